//! Test tone device: an endless 1 kHz sine, mono.
//!
//! The full wave is computed once at open time for the requested rate and
//! then replayed from the table. Only rates with a (near) integer number of
//! samples per period are supported; 44.1 kHz reuses the 44-sample period
//! of 44 kHz. Writes behave like the null device.

use std::f64::consts::TAU;

use super::Driver;
use crate::common::{ChannelCount, SampleRate};
use crate::Error;

/// Samples per 1 kHz period for each supported rate.
fn period_len(rate: SampleRate) -> Option<usize> {
    match rate {
        8000 => Some(8),
        16000 => Some(16),
        24000 => Some(24),
        32000 => Some(32),
        44000 | 44100 => Some(44),
        48000 => Some(48),
        96000 => Some(96),
        _ => None,
    }
}

pub(super) struct SineDriver {
    table: Vec<u8>,
    pos: usize,
}

impl SineDriver {
    pub(super) fn open(rate: SampleRate, channels: ChannelCount) -> Result<Self, Error> {
        if channels != 1 {
            return Err(Error::Inval);
        }

        let period = period_len(rate).ok_or(Error::Inval)?;
        let table = (0..period)
            .map(|i| ((TAU * i as f64 / period as f64).sin() * 32766.0).round() as i16)
            .flat_map(|s| s.to_le_bytes())
            .collect();

        Ok(SineDriver { table, pos: 0 })
    }
}

impl Driver for SineDriver {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let len = self.table.len();
        for byte in buf.iter_mut() {
            *byte = self.table[self.pos];
            self.pos = (self.pos + 1) % len;
        }
        Ok(buf.len())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        Ok(buf.len())
    }
}
