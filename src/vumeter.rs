//! Per-channel peak and RMS power metering.
//!
//! The meter consumes PCM from its upstream like any other stage, but has
//! no output of its own: it accumulates peaks and squared sums until
//! [`VuMeter::result`] is called, which returns the aggregate and resets
//! the accumulator.

use std::sync::{Arc, Mutex};

use crate::common::{frame_size, ChannelCount, SampleRate};
use crate::stream::StreamHandle;
use crate::Error;

/// Bytes pulled per [`VuMeter::read`] call when no limit is given.
const BUFFER_SIZE: usize = 2048;

/// One measurement window, as handed to the session callback.
#[derive(Debug, Clone, PartialEq)]
pub struct VuMeterResult {
    /// Sample rate of the measured signal.
    pub rate: SampleRate,
    /// Channel count of the measured signal.
    pub channels: ChannelCount,
    /// Number of frames that went into this window.
    pub frames: u64,
    /// Largest absolute sample value over all channels.
    pub global_peak: u16,
    /// RMS power over all channels pooled, in dB relative to full scale.
    /// Never above zero.
    pub global_power: f64,
    /// Largest absolute sample value per channel.
    pub channel_peak: Vec<u16>,
    /// RMS power per channel in dB relative to full scale.
    pub channel_power: Vec<f64>,
}

struct VuMeterCore {
    rate: SampleRate,
    channels: ChannelCount,
    upstream: Option<StreamHandle>,
    carry: Vec<u8>,
    frames: u64,
    peak: Vec<u16>,
    sum_sq: Vec<f64>,
}

impl VuMeterCore {
    fn reset(&mut self) {
        self.frames = 0;
        self.peak.fill(0);
        self.sum_sq.fill(0.0);
    }

    fn accumulate(&mut self, pcm: &[u8]) {
        let channels = self.channels as usize;
        for frame in pcm.chunks_exact(2 * channels) {
            for (channel, sample) in frame.chunks_exact(2).enumerate() {
                let value = i16::from_le_bytes([sample[0], sample[1]]);
                let magnitude = (value as i32).unsigned_abs() as u16;
                if magnitude > self.peak[channel] {
                    self.peak[channel] = magnitude;
                }
                self.sum_sq[channel] += (value as f64) * (value as f64);
            }
            self.frames += 1;
        }
    }
}

fn power_db(sum_sq: f64, samples: u64) -> f64 {
    if samples == 0 {
        return 0.0;
    }
    let rms = (sum_sq / samples as f64).sqrt() / 32768.0;
    (20.0 * rms.log10()).min(0.0)
}

/// The metering stage.
#[derive(Clone)]
pub struct VuMeter {
    core: Arc<Mutex<VuMeterCore>>,
}

impl VuMeter {
    /// Creates a meter for the given signal parameters.
    pub fn new(rate: SampleRate, channels: ChannelCount) -> Result<Self, Error> {
        if rate == 0 || channels == 0 {
            return Err(Error::Inval);
        }

        Ok(VuMeter {
            core: Arc::new(Mutex::new(VuMeterCore {
                rate,
                channels,
                upstream: None,
                carry: Vec::new(),
                frames: 0,
                peak: vec![0; channels as usize],
                sum_sq: vec![0.0; channels as usize],
            })),
        })
    }

    /// Attaches (or with `None`, detaches) the upstream producer.
    pub fn attach(&self, upstream: Option<StreamHandle>) {
        self.core.lock().unwrap().upstream = upstream;
    }

    /// Pulls up to `max_len` bytes (or one internal buffer when `None`)
    /// from the upstream and folds them into the running measurement.
    ///
    /// Returns the number of bytes consumed; zero when the upstream had
    /// nothing to give.
    pub fn read(&self, max_len: Option<usize>) -> Result<usize, Error> {
        let mut core = self.core.lock().unwrap();
        let core = &mut *core;

        let Some(upstream) = core.upstream.as_mut() else {
            return Err(Error::Unconnected);
        };

        let framesize = frame_size(core.channels);
        let len = max_len.unwrap_or(BUFFER_SIZE).min(BUFFER_SIZE);
        if len == 0 {
            return Ok(0);
        }

        let mut buf = vec![0u8; core.carry.len() + len];
        buf[..core.carry.len()].copy_from_slice(&core.carry);
        let carried = core.carry.len();

        let n = match upstream.read(&mut buf[carried..]) {
            Ok(n) => n,
            Err(err) => return Err(err),
        };

        let total = carried + n;
        let aligned = total - total % framesize;

        core.carry.clear();
        core.carry.extend_from_slice(&buf[aligned..total]);

        let (head, _) = buf.split_at(aligned);
        core.accumulate(head);

        Ok(n)
    }

    /// Returns the accumulated measurement and starts a fresh window.
    pub fn result(&self) -> VuMeterResult {
        let mut core = self.core.lock().unwrap();
        let channels = core.channels as usize;

        let channel_peak = core.peak.clone();
        let channel_power: Vec<f64> = core
            .sum_sq
            .iter()
            .map(|&sum| power_db(sum, core.frames))
            .collect();

        let global_peak = channel_peak.iter().copied().max().unwrap_or(0);
        let pooled: f64 = core.sum_sq.iter().sum();
        let global_power = power_db(pooled, core.frames * channels as u64);

        let result = VuMeterResult {
            rate: core.rate,
            channels: core.channels,
            frames: core.frames,
            global_peak,
            global_power,
            channel_peak,
            channel_power,
        };

        core.reset();
        result
    }
}
