//! Bounded ring buffer bridging a blocking producer to a non-blocking reader.
//!
//! The buffer sits between an upstream handle that may block (a hardware
//! capture device, typically) and a consumer that must not. A driving loop
//! calls [`RingBuffer::iter`] to move bytes from the upstream into the ring;
//! the consumer reads through the handle returned by
//! [`RingBuffer::get_output`] and never waits on the upstream directly.

use std::sync::{Arc, Mutex};

use crate::stream::{Stream, StreamHandle};
use crate::Error;

/// Upper bound on bytes moved per [`RingBuffer::iter`] call.
const MAX_FILL: usize = 8192;

struct RingCore {
    content: Vec<u8>,
    reader: usize,
    writer: usize,
    upstream: Option<StreamHandle>,
}

impl RingCore {
    fn fill(&self) -> usize {
        let size = self.content.len();
        (self.writer + size - self.reader) % size
    }
}

/// A fixed-size single-producer single-consumer byte ring.
///
/// One slot is kept as a sentinel, so a ring of size `n` holds at most
/// `n - 1` bytes in flight.
pub struct RingBuffer {
    core: Arc<Mutex<RingCore>>,
}

impl RingBuffer {
    /// Creates a ring of `size` bytes. Sizes below 4 are rejected with
    /// [`Error::Inval`].
    pub fn new(size: usize) -> Result<Self, Error> {
        if size < 4 {
            return Err(Error::Inval);
        }

        Ok(RingBuffer {
            core: Arc::new(Mutex::new(RingCore {
                content: vec![0; size],
                reader: 0,
                writer: 0,
                upstream: None,
            })),
        })
    }

    /// Attaches (or with `None`, detaches) the upstream producer.
    pub fn attach(&self, upstream: Option<StreamHandle>) {
        self.core.lock().unwrap().upstream = upstream;
    }

    /// Performs one non-blocking fill attempt.
    ///
    /// Reads into the largest contiguous free segment, capped at 8 KiB, and
    /// returns how many bytes were moved. Fails with [`Error::Busy`] when
    /// the ring is full and [`Error::Inval`] when no upstream is attached.
    pub fn iter(&self) -> Result<usize, Error> {
        let mut core = self.core.lock().unwrap();
        let core = &mut *core;
        let size = core.content.len();

        let upstream = core.upstream.as_mut().ok_or(Error::Inval)?;

        // The free region ends just before the reader, at the end of the
        // buffer if the write position can wrap later, or one short of the
        // end to keep the sentinel slot when the reader sits at zero.
        let end = if core.reader > core.writer {
            core.reader - 1
        } else if core.reader > 0 {
            size
        } else {
            size - 1
        };

        let len = (end - core.writer).min(MAX_FILL);
        if len == 0 {
            return Err(Error::Busy);
        }

        let n = upstream.read(&mut core.content[core.writer..core.writer + len])?;

        core.writer += n;
        if core.writer == size {
            core.writer = 0;
        }

        Ok(n)
    }

    /// Returns the number of bytes currently buffered.
    pub fn fill(&self) -> usize {
        self.core.lock().unwrap().fill()
    }

    /// Returns the consumer-side handle.
    ///
    /// The ring has a single read position; when several handles are taken
    /// they all advance the same position.
    pub fn get_output(&self) -> StreamHandle {
        StreamHandle::new(RingReader {
            core: Arc::clone(&self.core),
        })
    }
}

struct RingReader {
    core: Arc<Mutex<RingCore>>,
}

impl Stream for RingReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut core = self.core.lock().unwrap();
        let core = &mut *core;
        let size = core.content.len();

        let end = if core.reader > core.writer {
            size
        } else {
            core.writer
        };

        let len = buf.len().min(end - core.reader);
        buf[..len].copy_from_slice(&core.content[core.reader..core.reader + len]);

        core.reader += len;
        if core.reader == size {
            core.reader = 0;
        }

        Ok(len)
    }

    fn is_eof(&mut self) -> bool {
        let mut core = self.core.lock().unwrap();
        let core = &mut *core;

        if core.reader != core.writer {
            return false;
        }

        match core.upstream.as_mut() {
            None => true,
            Some(upstream) => upstream.is_eof(),
        }
    }
}
