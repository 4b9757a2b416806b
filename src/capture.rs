//! Audio capture sources.
//!
//! A [`Capture`] wraps one of several drivers behind the uniform stream
//! port. Drivers are selected by a string tag:
//!
//! | tag | device |
//! |---|---|
//! | `auto` | platform preference order; the hardware driver when the `recording` feature is compiled in, the null driver otherwise |
//! | `null` | silence on read, discard on write |
//! | `sine` | 1 kHz test tone, mono |
//! | `stdio` | a file opened at the given path |
//! | `cpal` | the system audio device (`recording` feature) |
//!
//! All drivers produce or consume interleaved signed 16-bit little-endian
//! PCM.

use std::sync::{Arc, Mutex};

use crate::common::{ChannelCount, Direction, SampleRate};
use crate::stream::{Stream, StreamHandle};
use crate::Error;

mod null;
mod sine;
mod stdio;

#[cfg(feature = "recording")]
mod device;

/// Driver backing a [`Capture`]. One read/write pair, no pull-loop
/// semantics of its own.
trait Driver: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error>;

    /// Drivers over finite media report when they run dry.
    fn is_eof(&mut self) -> bool {
        false
    }
}

/// An opened capture or playback device.
pub struct Capture {
    rate: SampleRate,
    channels: ChannelCount,
    direction: Direction,
    driver: Arc<Mutex<Box<dyn Driver>>>,
}

impl Capture {
    /// Opens the driver identified by `tag`.
    ///
    /// `device` names the concrete device where the driver needs one (the
    /// file path for `stdio`). `buffer_hint` sizes internal buffering in
    /// bytes for drivers that buffer; the rest ignore it.
    ///
    /// Unknown tags fail with [`Error::NoSys`], rate/channel combinations a
    /// driver can not serve with [`Error::Inval`].
    pub fn open(
        tag: &str,
        device: Option<&str>,
        rate: SampleRate,
        channels: ChannelCount,
        direction: Direction,
        buffer_hint: Option<usize>,
    ) -> Result<Self, Error> {
        if rate == 0 || channels == 0 {
            return Err(Error::Inval);
        }

        tracing::info!(tag, rate, channels, ?direction, "opening capture driver");

        let driver: Box<dyn Driver> = match tag {
            "auto" => Self::open_auto(device, rate, channels, direction, buffer_hint)?,
            "null" => Box::new(null::NullDriver),
            "sine" => Box::new(sine::SineDriver::open(rate, channels)?),
            "stdio" => Box::new(stdio::StdioDriver::open(device, direction)?),
            #[cfg(feature = "recording")]
            "cpal" => Box::new(device::CpalDriver::open(
                rate,
                channels,
                direction,
                buffer_hint,
            )?),
            _ => {
                tracing::error!(tag, "unknown capture driver");
                return Err(Error::NoSys);
            }
        };

        Ok(Capture {
            rate,
            channels,
            direction,
            driver: Arc::new(Mutex::new(driver)),
        })
    }

    #[cfg(feature = "recording")]
    fn open_auto(
        _device: Option<&str>,
        rate: SampleRate,
        channels: ChannelCount,
        direction: Direction,
        buffer_hint: Option<usize>,
    ) -> Result<Box<dyn Driver>, Error> {
        match device::CpalDriver::open(rate, channels, direction, buffer_hint) {
            Ok(driver) => Ok(Box::new(driver)),
            Err(err) => {
                tracing::warn!(%err, "hardware capture unavailable, falling back to null");
                Ok(Box::new(null::NullDriver))
            }
        }
    }

    #[cfg(not(feature = "recording"))]
    fn open_auto(
        _device: Option<&str>,
        _rate: SampleRate,
        _channels: ChannelCount,
        _direction: Direction,
        _buffer_hint: Option<usize>,
    ) -> Result<Box<dyn Driver>, Error> {
        Ok(Box::new(null::NullDriver))
    }

    /// Sample rate the device was opened with.
    pub fn rate(&self) -> SampleRate {
        self.rate
    }

    /// Channel count the device was opened with.
    pub fn channels(&self) -> ChannelCount {
        self.channels
    }

    /// Direction the device was opened with.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Writes PCM to the device (playback and duplex directions).
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        if self.direction == Direction::Record {
            return Err(Error::Inval);
        }
        self.driver.lock().unwrap().write(buf)
    }

    /// Returns the device's PCM output as a stream handle.
    ///
    /// The handle keeps the device open; the device closes when the last
    /// of the `Capture` and its handles is dropped.
    pub fn get_output(&self) -> StreamHandle {
        StreamHandle::new(CaptureReader {
            driver: Arc::clone(&self.driver),
        })
    }
}

struct CaptureReader {
    driver: Arc<Mutex<Box<dyn Driver>>>,
}

impl Stream for CaptureReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.driver.lock().unwrap().read(buf)
    }

    fn is_eof(&mut self) -> bool {
        self.driver.lock().unwrap().is_eof()
    }
}
