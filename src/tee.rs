//! Fan-out of one upstream into several independent readers.
//!
//! The tee keeps a single sliding window over the upstream bytes and one
//! offset per reader slot. A physical upstream read happens only when the
//! reader that is furthest ahead has drained the window; the window is
//! compacted by the offset of the reader that is furthest behind. A reader
//! that never advances therefore pins the window until it reaches its
//! maximum size, at which point physical reads start failing with
//! [`Error::Nomem`].

use std::sync::{Arc, Mutex};

use crate::stream::{Stream, StreamHandle};
use crate::Error;

/// Maximum number of reader slots per tee.
pub const MAX_READERS: usize = 4;

/// Window size bounds. Short windows cost physical reads, long windows cost
/// memory held for lagging readers.
const MIN_WINDOW: usize = 1024;
const MAX_WINDOW: usize = 8192;

struct TeeCore {
    readers: usize,
    next_reader: usize,
    buffer: Vec<u8>,
    fill: usize,
    offset: [usize; MAX_READERS],
    upstream: Option<StreamHandle>,
}

impl TeeCore {
    /// Grows the window toward `len_request` (clamped) and compacts it by
    /// the minimum reader offset.
    fn readjust(&mut self, len_request: usize) {
        let len_request = len_request.clamp(MIN_WINDOW, MAX_WINDOW);

        if len_request > self.buffer.len() {
            self.buffer.resize(len_request, 0);
        }

        let min_offset = self.offset[..self.readers]
            .iter()
            .copied()
            .min()
            .unwrap_or(0)
            .min(self.fill);

        if min_offset > 0 {
            self.buffer.copy_within(min_offset..self.fill, 0);
            self.fill -= min_offset;
            for offset in &mut self.offset[..self.readers] {
                *offset -= min_offset;
            }
        }
    }

    /// Pulls more bytes from the upstream into the window.
    fn read_phy(&mut self, len_request: usize) -> Result<usize, Error> {
        self.readjust(len_request);

        let free = self.buffer.len() - self.fill;
        if free == 0 {
            tracing::error!(fill = self.fill, "tee window exhausted by a stalled reader");
            return Err(Error::Nomem);
        }

        let len = free.min(len_request.clamp(MIN_WINDOW, MAX_WINDOW));
        let upstream = self.upstream.as_mut().ok_or(Error::Fault)?;
        let n = upstream.read(&mut self.buffer[self.fill..self.fill + len])?;
        self.fill += n;

        Ok(n)
    }
}

/// Duplicates one upstream to up to [`MAX_READERS`] independent consumers.
pub struct Tee {
    core: Arc<Mutex<TeeCore>>,
}

impl Tee {
    /// Creates a tee with `readers` reader slots (1 to [`MAX_READERS`]).
    pub fn new(readers: usize) -> Result<Self, Error> {
        if readers < 1 || readers > MAX_READERS {
            return Err(Error::Inval);
        }

        Ok(Tee {
            core: Arc::new(Mutex::new(TeeCore {
                readers,
                next_reader: 0,
                buffer: Vec::new(),
                fill: 0,
                offset: [0; MAX_READERS],
                upstream: None,
            })),
        })
    }

    /// Attaches (or with `None`, detaches) the upstream producer.
    pub fn attach(&self, upstream: Option<StreamHandle>) {
        self.core.lock().unwrap().upstream = upstream;
    }

    /// Returns the handle for reader slot `index`, or for the next unused
    /// slot when `index` is `None`.
    ///
    /// Each handle owns its slot; reading through it only advances that
    /// slot's position.
    pub fn get_output(&self, index: Option<usize>) -> Result<StreamHandle, Error> {
        let mut core = self.core.lock().unwrap();

        let index = index.unwrap_or(core.next_reader);
        if index >= core.readers {
            return Err(Error::Inval);
        }
        core.next_reader = index + 1;

        Ok(StreamHandle::new(TeeReader {
            core: Arc::clone(&self.core),
            index,
        }))
    }
}

struct TeeReader {
    core: Arc<Mutex<TeeCore>>,
    index: usize,
}

impl Stream for TeeReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut core = self.core.lock().unwrap();
        let mut done = 0;

        while done < buf.len() {
            let mut avail = core.fill - core.offset[self.index];

            if avail == 0 {
                match core.read_phy(buf.len()) {
                    Ok(n) if n > 0 => {}
                    Ok(_) => return Ok(done),
                    Err(_) if done > 0 => return Ok(done),
                    Err(err) => return Err(err),
                }
                avail = core.fill - core.offset[self.index];
            }

            let offset = core.offset[self.index];
            let take = avail.min(buf.len() - done);
            buf[done..done + take].copy_from_slice(&core.buffer[offset..offset + take]);

            done += take;
            core.offset[self.index] += take;
        }

        Ok(done)
    }

    fn is_eof(&mut self) -> bool {
        let mut core = self.core.lock().unwrap();
        let core = &mut *core;

        if core.offset[self.index] < core.fill {
            return false;
        }

        match core.upstream.as_mut() {
            None => true,
            Some(upstream) => upstream.is_eof(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::tests::ChunkedStream;

    fn sequence(len: usize) -> Vec<u8> {
        (0..len).map(|v| (v % 251) as u8).collect()
    }

    #[test]
    fn reader_count_bounds() {
        assert!(Tee::new(0).is_err());
        assert!(Tee::new(1).is_ok());
        assert!(Tee::new(4).is_ok());
        assert!(Tee::new(5).is_err());
    }

    #[test]
    fn auto_index_assignment() {
        let tee = Tee::new(2).unwrap();
        assert!(tee.get_output(None).is_ok());
        assert!(tee.get_output(None).is_ok());
        assert!(tee.get_output(None).is_err());
        // Explicit indices are still valid after the cursor ran out.
        assert!(tee.get_output(Some(0)).is_ok());
    }

    #[test]
    fn both_readers_see_identical_bytes() {
        let data = sequence(10_000);
        let tee = Tee::new(2).unwrap();
        tee.attach(Some(StreamHandle::new(ChunkedStream::new(data.clone(), 17))));

        let mut a = tee.get_output(None).unwrap();
        let mut b = tee.get_output(None).unwrap();

        let mut got_a = Vec::new();
        let mut got_b = Vec::new();
        let mut buf = [0u8; 97];

        // Alternate with unaligned read sizes so the window compacts at
        // shifting offsets while the readers stay within one window span.
        loop {
            let n = a.read(&mut buf).unwrap();
            got_a.extend_from_slice(&buf[..n]);

            let m = b.read(&mut buf).unwrap();
            got_b.extend_from_slice(&buf[..m]);

            if n == 0 && m == 0 {
                break;
            }
        }

        while !b.is_eof() {
            let m = b.read(&mut buf).unwrap();
            got_b.extend_from_slice(&buf[..m]);
        }

        assert_eq!(got_a, data);
        assert_eq!(got_b, data);
        assert!(a.is_eof());
    }

    #[test]
    fn stalled_reader_pins_window_until_nomem() {
        let data = sequence(100_000);
        let tee = Tee::new(2).unwrap();
        tee.attach(Some(StreamHandle::new(ChunkedStream::new(data.clone(), 512))));

        let _stalled = tee.get_output(None).unwrap();
        let mut active = tee.get_output(None).unwrap();

        let mut total = 0;
        let mut buf = [0u8; MAX_WINDOW];
        let err = loop {
            match active.read(&mut buf) {
                Ok(n) if n > 0 => total += n,
                Ok(_) => panic!("expected Nomem before end of stream"),
                Err(err) => break err,
            }
        };

        // The stalled reader caps the carry at the maximum window size.
        assert_eq!(err, Error::Nomem);
        assert_eq!(total, MAX_WINDOW);
    }

    #[test]
    fn single_reader_streams_through() {
        let data = sequence(4096);
        let tee = Tee::new(1).unwrap();
        tee.attach(Some(StreamHandle::new(ChunkedStream::new(data.clone(), 100))));

        let mut out = tee.get_output(Some(0)).unwrap();
        let mut got = vec![0u8; 4096];
        assert_eq!(out.read(&mut got).unwrap(), 4096);
        assert_eq!(got, data);
        assert!(out.is_eof());
    }
}
