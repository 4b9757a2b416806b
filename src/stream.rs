//! The uniform byte-stream port connecting pipeline stages.
//!
//! Every stage exposes its output as a [`StreamHandle`] and consumes its
//! input through one. Data only moves when a downstream consumer reads, so
//! a chain of handles forms a lazy pull pipeline.
//!
//! A handle keeps its producing stage alive: the [`Stream`] implementation
//! behind it captures whatever shared state it needs (usually an `Arc` of
//! the stage core), and releasing the handle releases that reference. Any
//! teardown a stage needs on release belongs in the `Drop` of its `Stream`
//! implementation.

use crate::Error;

/// A raw source of bytes, implemented by every pipeline stage.
///
/// `read` performs a single read attempt and may return fewer bytes than
/// requested, including zero when nothing is available right now. Consumers
/// that need the stronger accumulate-until-blocked behavior should go
/// through [`StreamHandle::read`].
pub trait Stream: Send {
    /// Reads at most `buf.len()` bytes into `buf`, returning how many were
    /// produced. `Ok(0)` means no data is available from this attempt;
    /// whether the stream has ended is answered by [`Stream::is_eof`].
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Returns true once the stream has permanently run out of data.
    ///
    /// Once this returns true while no further bytes are buffered it must
    /// keep returning true until the stream is dropped.
    fn is_eof(&mut self) -> bool {
        false
    }
}

/// Owned read port on a pipeline stage.
///
/// The handle is the only way to consume a stage's output. It is a
/// single-consumer object; fan-out is provided by [`Tee`](crate::Tee),
/// which hands out one handle per reader slot.
pub struct StreamHandle {
    inner: Box<dyn Stream>,
}

impl StreamHandle {
    /// Wraps a raw [`Stream`] into a handle.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream + 'static,
    {
        StreamHandle {
            inner: Box::new(stream),
        }
    }

    /// Reads into `buf`, looping over the underlying stream until the buffer
    /// is full, the stream has nothing more to give, or an error occurs.
    ///
    /// A zero-length `buf` is a no-op returning `Ok(0)`. If at least one
    /// byte was read before an error occurred, the bytes read so far are
    /// returned and the error is left for the next call to rediscover.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut done = 0;

        while done < buf.len() {
            match self.inner.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(_) if done > 0 => break,
                Err(err) => return Err(err),
            }
        }

        Ok(done)
    }

    /// Returns true once the stream has permanently ended.
    pub fn is_eof(&mut self) -> bool {
        self.inner.is_eof()
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}
