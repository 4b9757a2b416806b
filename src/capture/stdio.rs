//! File-backed device.
//!
//! The `device` string is a path; the open mode follows the direction:
//! read for capture, write (create/truncate) for playback, read-write for
//! duplex. Bytes pass through untouched, so a capture-direction open over
//! an Ogg file turns the file into a raw bitstream source.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};

use super::Driver;
use crate::common::Direction;
use crate::Error;

pub(super) struct StdioDriver {
    file: File,
    eof: bool,
}

impl StdioDriver {
    pub(super) fn open(device: Option<&str>, direction: Direction) -> Result<Self, Error> {
        let path = device.ok_or(Error::Inval)?;

        let file = match direction {
            Direction::Record => OpenOptions::new().read(true).open(path),
            Direction::Playback => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path),
            Direction::Duplex => OpenOptions::new().read(true).write(true).open(path),
        };

        let file = file.map_err(|err| {
            tracing::error!(path, %err, "can not open file device");
            Error::from(err)
        })?;

        Ok(StdioDriver { file, eof: false })
    }
}

impl Driver for StdioDriver {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = self.file.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.eof = true;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        Ok(self.file.write(buf)?)
    }

    fn is_eof(&mut self) -> bool {
        self.eof
    }
}
