//! Opus codec backend.
//!
//! Produces the standard Ogg Opus encapsulation: an `OpusHead` packet on
//! its own beginning-of-stream page, an `OpusTags` packet on its own page,
//! then one data packet per 60 ms frame (2880 samples at 48 kHz) with the
//! granule position advancing by the frame size. The final data packet
//! ends the stream and forces its page out.

use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, ErrorCode, SampleRate};

use super::{Codec, EncShared, FrameState, PacketEnd, VENDOR_STRING};
use crate::Error;

/// Samples per channel per packet: 60 ms at 48 kHz.
const FRAMES_PER_PACKET: usize = 2880;

/// Ceiling for a single encoded packet.
const MAX_PACKET: usize = 4096;

/// Bitrates the quality setting quantizes into, in kbit/s.
const BITRATES: [i32; 15] = [
    32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512,
];

fn opus_error(err: audiopus::Error) -> Error {
    match err {
        audiopus::Error::Opus(ErrorCode::BadArg) => Error::Inval,
        audiopus::Error::Opus(ErrorCode::BufferTooSmall) => Error::Fault,
        audiopus::Error::Opus(ErrorCode::InvalidPacket) => Error::Inval,
        audiopus::Error::Opus(ErrorCode::Unimplemented) => Error::NoSys,
        audiopus::Error::Opus(ErrorCode::InvalidState) => Error::Inval,
        audiopus::Error::Opus(ErrorCode::AllocFail) => Error::Nomem,
        _ => Error::Generic,
    }
}

fn bitrate_for_quality(quality: f64) -> i32 {
    let index = (quality.clamp(0.0, 1.0) * (BITRATES.len() - 1) as f64).round() as usize;
    BITRATES[index] * 1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpusState {
    Head,
    Tags,
    Data,
    Eof,
}

pub(super) struct OpusCodec {
    encoder: Option<OpusEncoder>,
    state: OpusState,
    granulepos: u64,
    /// Partial frame carried between process calls.
    buffer: Vec<u8>,
}

impl OpusCodec {
    pub(super) fn new() -> Self {
        OpusCodec {
            encoder: None,
            state: OpusState::Head,
            granulepos: 0,
            buffer: Vec::new(),
        }
    }

    fn build_head(shared: &EncShared) -> Vec<u8> {
        let mut head = Vec::with_capacity(19);
        head.extend_from_slice(b"OpusHead");
        head.push(1); // version
        head.push(shared.channels as u8);
        head.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
        head.extend_from_slice(&shared.rate.to_le_bytes()); // input sample rate
        head.extend_from_slice(&0u16.to_le_bytes()); // output gain
        head.push(0); // channel mapping family
        head
    }

    fn build_tags(shared: &EncShared) -> Vec<u8> {
        let mut pairs = vec![("ENCODER".to_string(), VENDOR_STRING.to_string())];
        if let Some(metadata) = &shared.metadata {
            pairs.extend(metadata.pairs());
        }

        let mut tags = Vec::new();
        tags.extend_from_slice(b"OpusTags");
        tags.extend_from_slice(&(VENDOR_STRING.len() as u32).to_le_bytes());
        tags.extend_from_slice(VENDOR_STRING.as_bytes());
        tags.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
        for (key, value) in &pairs {
            tags.extend_from_slice(&((key.len() + value.len() + 1) as u32).to_le_bytes());
            tags.extend_from_slice(key.as_bytes());
            tags.push(b'=');
            tags.extend_from_slice(value.as_bytes());
        }
        tags
    }

    /// Tries to complete one frame's worth of PCM in the carry buffer.
    /// Returns whether the input has permanently ended.
    fn fill_frame(&mut self, shared: &mut EncShared, frame_bytes: usize) -> Result<bool, Error> {
        let Some(input) = shared.input.as_mut() else {
            return Ok(true);
        };

        if self.buffer.len() < frame_bytes {
            let missing = frame_bytes - self.buffer.len();
            let start = self.buffer.len();
            self.buffer.resize(frame_bytes, 0);
            let n = match input.read(&mut self.buffer[start..]) {
                Ok(n) => n,
                Err(err) => {
                    self.buffer.truncate(start);
                    return Err(err);
                }
            };
            if n < missing {
                self.buffer.truncate(start + n);
            }
        }

        Ok(input.is_eof())
    }

    fn encode_frame(&mut self, shared: &mut EncShared, frame_bytes: usize) -> Result<(), Error> {
        let finishing = shared.finishing();
        let input_ended = self.fill_frame(shared, frame_bytes)?;

        if self.buffer.len() < frame_bytes {
            if !finishing && !input_ended {
                // Not enough input for a whole packet; never emit a short
                // one.
                return Err(Error::Retry);
            }
            // Final packet: pad the carry out to a full frame of silence.
            self.buffer.resize(frame_bytes, 0);
        }

        let pcm: Vec<i16> = self
            .buffer
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        self.buffer.clear();

        let encoder = self.encoder.as_mut().ok_or(Error::Inval)?;
        let mut packet = vec![0u8; MAX_PACKET];
        let len = encoder.encode(&pcm, &mut packet).map_err(|err| {
            tracing::error!(%err, "opus encode failed");
            opus_error(err)
        })?;
        packet.truncate(len);

        self.granulepos += FRAMES_PER_PACKET as u64;

        let last = finishing || input_ended;
        let end = if last {
            self.state = OpusState::Eof;
            if input_ended && !shared.finishing() {
                shared.state = FrameState::Eof;
            }
            PacketEnd::Stream
        } else {
            PacketEnd::Normal
        };

        shared.mux.packet_in(packet, self.granulepos, end)
    }
}

impl Codec for OpusCodec {
    fn start(&mut self, shared: &mut EncShared) -> Result<(), Error> {
        if shared.channels < 1 || shared.channels > 2 {
            return Err(Error::Inval);
        }
        if shared.rate != 48000 {
            return Err(Error::Inval);
        }

        let channels = if shared.channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        };

        let mut encoder = OpusEncoder::new(SampleRate::Hz48000, channels, Application::Audio)
            .map_err(opus_error)?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(bitrate_for_quality(shared.quality)))
            .map_err(opus_error)?;

        tracing::info!(
            bitrate = bitrate_for_quality(shared.quality),
            channels = shared.channels,
            "opus encoder ready"
        );

        self.encoder = Some(encoder);
        self.state = OpusState::Head;
        self.granulepos = 0;
        self.buffer.clear();

        Ok(())
    }

    fn stop(&mut self, _shared: &mut EncShared) {
        self.encoder = None;
        self.state = OpusState::Head;
        self.granulepos = 0;
        self.buffer.clear();
    }

    fn process(&mut self, shared: &mut EncShared) -> Result<(), Error> {
        match self.state {
            OpusState::Head => {
                let head = Self::build_head(shared);
                shared.mux.packet_in(head, 0, PacketEnd::Page)?;
                self.state = OpusState::Tags;
                Ok(())
            }
            OpusState::Tags => {
                let tags = Self::build_tags(shared);
                shared.mux.packet_in(tags, 0, PacketEnd::Page)?;
                self.state = OpusState::Data;
                Ok(())
            }
            OpusState::Data => {
                let frame_bytes = FRAMES_PER_PACKET * shared.channels as usize * 2;
                self.encode_frame(shared, frame_bytes)
            }
            OpusState::Eof => Ok(()),
        }
    }
}
