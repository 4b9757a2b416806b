#![cfg_attr(test, deny(missing_docs))]
#![doc = include_str!("../README.md")]
//!
//! # How the pieces fit together
//!
//! Every stage exposes its output as a [`StreamHandle`] (`read` + `eof`)
//! and consumes its input through one; bytes only move when the terminal
//! consumer reads. The live streaming composition is
//!
//! ```text
//! capture -> transform -> tee -> encoder -> network sink
//!                             \-> vu meter
//! ```
//!
//! while file playback hands the file's bytes to the sink unmodified.
//! [`Session`] owns a background worker that drives the terminal reads,
//! swaps segments, reconnects after a loss and reports everything through
//! an event callback.
//!
//! # Quick start
//!
//! ```no_run
//! use oggcast::{CodecKind, Event, IcecastConfig, Session};
//!
//! # fn main() -> Result<(), oggcast::Error> {
//! let config = IcecastConfig {
//!     hostname: "icecast.example.net".to_string(),
//!     port: 8000,
//!     mount: "/live.ogg".to_string(),
//!     password: "hackme".to_string(),
//!     ..IcecastConfig::default()
//! };
//!
//! let session = Session::new(CodecKind::Vorbis, 48000, 1, None, &config)?;
//! session.set_callback(|event| {
//!     if let Event::StreamState { state, .. } = event {
//!         println!("stream is now {state:?}");
//!     }
//! });
//! session.set_meta("TITLE", "Morning show", true);
//! session.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! The stages are also usable on their own; see [`RingBuffer`], [`Tee`],
//! [`Transform`], [`Encoder`] and [`IcecastSink`].

mod capture;
mod common;
mod encoder;
mod error;
mod icecast;
mod metadata;
mod ring;
mod session;
mod stream;
mod tee;
mod transform;
mod vumeter;

pub use crate::capture::Capture;
pub use crate::common::{frame_size, ChannelCount, Direction, SampleRate};
pub use crate::encoder::{CodecKind, Encoder};
pub use crate::error::Error;
pub use crate::icecast::{IcecastClient, IcecastConfig, IcecastSink, TlsMode};
pub use crate::metadata::Metadata;
pub use crate::ring::RingBuffer;
pub use crate::session::{
    ConnectionState, Event, ReconnectionProfile, Segment, SegmentPipeline, Session,
};
pub use crate::stream::{Stream, StreamHandle};
pub use crate::tee::{Tee, MAX_READERS};
pub use crate::transform::Transform;
pub use crate::vumeter::{VuMeter, VuMeterResult};
