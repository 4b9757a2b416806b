//! Hardware capture through the system audio API.
//!
//! The cpal stream and its device handles live on a dedicated keeper
//! thread (stream handles are not movable between threads on every
//! platform); the audio callback pushes converted samples into a lock-free
//! ring buffer that the driver's `read` side drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use dasp_sample::{Sample as DaspSample, ToSample};
use rtrb::RingBuffer;

use super::Driver;
use crate::common::{ChannelCount, Direction, SampleRate};
use crate::Error;

pub(super) struct CpalDriver {
    consumer: rtrb::Consumer<i16>,
    error_occurred: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    keeper: Option<thread::JoinHandle<()>>,
    poll_interval: Duration,
}

impl CpalDriver {
    pub(super) fn open(
        rate: SampleRate,
        channels: ChannelCount,
        direction: Direction,
        buffer_hint: Option<usize>,
    ) -> Result<Self, Error> {
        if direction != Direction::Record {
            return Err(Error::NoSys);
        }

        // Default to a tenth of a second of buffering between the audio
        // callback and the pull side.
        let capacity = buffer_hint
            .map(|bytes| (bytes / 2).max(1024))
            .unwrap_or((rate as usize * channels as usize) / 10);

        let (producer, consumer) = RingBuffer::<i16>::new(capacity);
        let error_occurred = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = mpsc::channel();
        let keeper = {
            let error_occurred = Arc::clone(&error_occurred);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("oggcast-capture".to_string())
                .spawn(move || {
                    keeper_main(rate, channels, producer, error_occurred, stop, ready_tx)
                })
                .map_err(|_| Error::Generic)?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = keeper.join();
                return Err(err);
            }
            Err(_) => return Err(Error::Generic),
        }

        Ok(CpalDriver {
            consumer,
            error_occurred,
            stop,
            keeper: Some(keeper),
            poll_interval: Duration::from_millis(5),
        })
    }
}

fn keeper_main(
    rate: SampleRate,
    channels: ChannelCount,
    producer: rtrb::Producer<i16>,
    error_occurred: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<Result<(), Error>>,
) {
    let stream = match open_stream(rate, channels, producer, Arc::clone(&error_occurred)) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    while !stop.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(100));
    }

    drop(stream);
}

fn open_stream(
    rate: SampleRate,
    channels: ChannelCount,
    producer: rtrb::Producer<i16>,
    error_occurred: Arc<AtomicBool>,
) -> Result<cpal::Stream, Error> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(Error::NoSys)?;

    let default_config = device.default_input_config().map_err(|err| {
        tracing::error!(%err, "no usable input config");
        Error::NoSys
    })?;

    // No resampling or channel mixing happens here; the device has to
    // match the requested parameters.
    if default_config.sample_rate().0 != rate || default_config.channels() != channels {
        tracing::error!(
            device_rate = default_config.sample_rate().0,
            device_channels = default_config.channels(),
            rate,
            channels,
            "device config does not match requested parameters"
        );
        return Err(Error::Inval);
    }

    let config = default_config.config();

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, producer, error_occurred),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, producer, error_occurred),
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, producer, error_occurred),
        other => {
            tracing::error!(?other, "unsupported sample format");
            return Err(Error::NoSys);
        }
    }?;

    stream.play().map_err(|err| {
        tracing::error!(%err, "can not start input stream");
        Error::Generic
    })?;

    Ok(stream)
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: rtrb::Producer<i16>,
    error_occurred: Arc<AtomicBool>,
) -> Result<cpal::Stream, Error>
where
    T: cpal::SizedSample + DaspSample + ToSample<i16>,
{
    device
        .build_input_stream::<T, _, _>(
            config,
            move |data, _info| {
                for &sample in data {
                    // Dropped samples mean the pull side is behind; there
                    // is nothing useful to do about it here.
                    let _ = producer.push(sample.to_sample::<i16>());
                }
            },
            move |err| {
                tracing::error!(%err, "input stream failed");
                error_occurred.store(true, Ordering::Release);
            },
            Some(Duration::from_millis(100)),
        )
        .map_err(|err| {
            tracing::error!(%err, "can not open input stream");
            Error::Generic
        })
}

impl Driver for CpalDriver {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut done = 0;
        let mut waited = false;

        while done + 2 <= buf.len() {
            match self.consumer.pop() {
                Ok(sample) => {
                    buf[done..done + 2].copy_from_slice(&sample.to_le_bytes());
                    done += 2;
                }
                Err(_) if self.error_occurred.load(Ordering::Acquire) => break,
                Err(_) if done == 0 && !waited => {
                    // Give the audio callback one interval to catch up
                    // before reporting an empty read.
                    thread::sleep(self.poll_interval);
                    waited = true;
                }
                Err(_) => break,
            }
        }

        Ok(done)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize, Error> {
        Err(Error::NoSys)
    }

    fn is_eof(&mut self) -> bool {
        self.error_occurred.load(Ordering::Acquire) && self.consumer.slots() == 0
    }
}

impl Drop for CpalDriver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(keeper) = self.keeper.take() {
            let _ = keeper.join();
        }
    }
}
