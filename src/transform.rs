//! Per-channel linear gain over interleaved 16-bit PCM.
//!
//! The stage reads whole frames from its upstream, applies an integer gain
//! of `gain[channel] / scale` to every sample and saturates the result to
//! the 16-bit range. Upstream data may arrive arbitrarily sliced; a carry
//! of less than one frame is kept between reads to restore alignment.

use std::sync::{Arc, Mutex};

use crate::common::{frame_size, ChannelCount, SampleRate};
use crate::stream::{Stream, StreamHandle};
use crate::Error;

struct TransformCore {
    channels: ChannelCount,
    carry: [u8; 2 * MAX_CHANNELS - 1],
    carry_fill: usize,
    gain_scale: u16,
    gain: Vec<u16>,
    upstream: Option<StreamHandle>,
}

/// Highest channel count the gain stage supports.
pub const MAX_CHANNELS: usize = 8;

impl TransformCore {
    fn process(&self, buf: &mut [u8]) {
        if self.gain_scale == 0 {
            return;
        }

        let channels = self.channels as usize;
        for frame in buf.chunks_exact_mut(2 * channels) {
            for (channel, sample) in frame.chunks_exact_mut(2).enumerate() {
                let value = i16::from_le_bytes([sample[0], sample[1]]) as i64;
                let scaled = value * self.gain[channel] as i64 / self.gain_scale as i64;
                let clamped = scaled.clamp(i16::MIN as i64, i16::MAX as i64) as i16;
                sample.copy_from_slice(&clamped.to_le_bytes());
            }
        }
    }
}

/// The gain stage.
///
/// Clones share the same state, so a handed-out reference can adjust the
/// gain of a running pipeline.
#[derive(Clone)]
pub struct Transform {
    rate: SampleRate,
    channels: ChannelCount,
    core: Arc<Mutex<TransformCore>>,
}

impl Transform {
    /// Creates a transform for the given signal parameters. The stage
    /// starts in bypass (no gain applied).
    pub fn new(rate: SampleRate, channels: ChannelCount) -> Result<Self, Error> {
        if rate == 0 || channels == 0 || channels as usize > MAX_CHANNELS {
            return Err(Error::Inval);
        }

        Ok(Transform {
            rate,
            channels,
            core: Arc::new(Mutex::new(TransformCore {
                channels,
                carry: [0; 2 * MAX_CHANNELS - 1],
                carry_fill: 0,
                gain_scale: 0,
                gain: vec![0; channels as usize],
                upstream: None,
            })),
        })
    }

    /// Sample rate the stage was created for.
    pub fn rate(&self) -> SampleRate {
        self.rate
    }

    /// Channel count the stage was created for.
    pub fn channels(&self) -> ChannelCount {
        self.channels
    }

    /// Attaches (or with `None`, detaches) the upstream producer.
    pub fn attach(&self, upstream: Option<StreamHandle>) {
        self.core.lock().unwrap().upstream = upstream;
    }

    /// Sets the master gain to `gain[channel] / scale` per channel.
    ///
    /// A `scale` of zero or an empty `gain` slice disables the gain stage
    /// entirely (bypass). Otherwise the slice must either match the channel
    /// count, hold a single value to broadcast to all channels, or hold a
    /// stereo pair to be averaged down for a mono stage.
    pub fn set_master_gain(&self, scale: u16, gain: &[u16]) -> Result<(), Error> {
        let mut core = self.core.lock().unwrap();

        if scale == 0 || gain.is_empty() {
            core.gain_scale = 0;
            return Ok(());
        }

        let channels = self.channels as usize;
        if gain.len() == channels {
            core.gain_scale = scale;
            core.gain.copy_from_slice(gain);
        } else if gain.len() == 1 {
            core.gain_scale = scale;
            core.gain.fill(gain[0]);
        } else if gain.len() == 2 && channels == 1 {
            core.gain_scale = scale;
            core.gain[0] = ((gain[0] as u32 + gain[1] as u32) / 2) as u16;
            tracing::debug!(
                scale,
                gain = core.gain[0],
                "stereo gain averaged down for mono signal"
            );
        } else {
            return Err(Error::Inval);
        }

        Ok(())
    }

    /// Returns the stage's output handle.
    pub fn get_output(&self) -> StreamHandle {
        StreamHandle::new(TransformReader {
            core: Arc::clone(&self.core),
        })
    }
}

struct TransformReader {
    core: Arc<Mutex<TransformCore>>,
}

impl Stream for TransformReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut core = self.core.lock().unwrap();
        let core = &mut *core;
        let framesize = frame_size(core.channels);

        let len = buf.len() - buf.len() % framesize;
        if len == 0 {
            return Ok(0);
        }

        // The target buffer always has room for at least one whole frame,
        // which is more than the carry can hold.
        let mut done = core.carry_fill;
        buf[..done].copy_from_slice(&core.carry[..done]);
        core.carry_fill = 0;

        if let Some(upstream) = core.upstream.as_mut() {
            match upstream.read(&mut buf[done..len]) {
                Ok(n) => done += n,
                Err(err) if done == 0 => return Err(err),
                Err(_) => {}
            }
        }

        let unaligned = done % framesize;
        if unaligned > 0 {
            core.carry[..unaligned].copy_from_slice(&buf[done - unaligned..done]);
            core.carry_fill = unaligned;
            done -= unaligned;
        }

        core.process(&mut buf[..done]);

        Ok(done)
    }

    fn is_eof(&mut self) -> bool {
        let mut core = self.core.lock().unwrap();

        // The carry never holds a full frame, so it alone can not satisfy
        // another read; only the upstream matters here.
        match core.upstream.as_mut() {
            None => true,
            Some(upstream) => upstream.is_eof(),
        }
    }
}
