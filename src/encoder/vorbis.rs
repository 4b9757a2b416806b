//! Vorbis codec backend over libvorbis.
//!
//! Quality-based VBR encoding. `start` writes the standard three-header
//! sequence (identification, comment, setup) with the identification and
//! setup headers each ending their page; `process` pulls PCM in small
//! bursts, converts it into the float analysis buffer and flushes whatever
//! packets the bitrate manager produces. End of input is signalled to
//! libvorbis with a zero-length write, which makes it emit the final
//! packets with the end-of-stream flag set.

use std::ffi::CString;
use std::mem;
use std::os::raw::{c_int, c_long};

use ogg_sys::ogg_packet;
use vorbis_sys::{
    vorbis_analysis, vorbis_analysis_blockout, vorbis_analysis_buffer, vorbis_analysis_headerout,
    vorbis_analysis_init, vorbis_analysis_wrote, vorbis_bitrate_addblock,
    vorbis_bitrate_flushpacket, vorbis_block, vorbis_block_clear, vorbis_block_init,
    vorbis_comment, vorbis_comment_add_tag, vorbis_comment_clear, vorbis_comment_init,
    vorbis_dsp_state, vorbis_dsp_clear, vorbis_info, vorbis_info_clear,
};
use vorbisenc_sys::vorbis_encode_init_vbr;

use super::{Codec, EncShared, FrameState, PacketEnd, VENDOR_STRING};
use crate::common::frame_size;
use crate::Error;

/// PCM burst size per input read.
const READ_BURST: usize = 1024;

pub(super) struct VorbisCodec {
    vi: vorbis_info,
    vc: vorbis_comment,
    vd: vorbis_dsp_state,
    vb: vorbis_block,
    started: bool,
    /// Zero-length analysis write already issued for this bitstream.
    wrote_end: bool,
    /// Sub-frame remainder between input reads.
    carry: Vec<u8>,
    /// Header packet counter, to place page breaks after the
    /// identification and setup headers.
    packets_in: u64,
}

// The libvorbis state blocks contain raw pointers. They are only ever
// touched through the codec, which lives behind the encoder mutex.
unsafe impl Send for VorbisCodec {}

impl VorbisCodec {
    pub(super) fn new() -> Self {
        VorbisCodec {
            vi: unsafe { mem::zeroed() },
            vc: unsafe { mem::zeroed() },
            vd: unsafe { mem::zeroed() },
            vb: unsafe { mem::zeroed() },
            started: false,
            wrote_end: false,
            carry: Vec::new(),
            packets_in: 0,
        }
    }

    fn add_comment(&mut self, key: &str, value: &str) {
        let (Ok(key), Ok(value)) = (CString::new(key), CString::new(value)) else {
            tracing::warn!(key, "metadata tag with embedded NUL skipped");
            return;
        };
        unsafe {
            vorbis_comment_add_tag(&mut self.vc, key.as_ptr(), value.as_ptr());
        }
    }

    fn packet_in(&mut self, shared: &mut EncShared, packet: &ogg_packet) -> Result<(), Error> {
        let data =
            unsafe { std::slice::from_raw_parts(packet.packet as *const u8, packet.bytes as usize) };

        let end = if packet.e_o_s != 0 {
            PacketEnd::Stream
        } else if self.packets_in == 0 || self.packets_in == 2 {
            // The identification and setup headers must end their pages.
            PacketEnd::Page
        } else {
            PacketEnd::Normal
        };

        self.packets_in += 1;
        shared
            .mux
            .packet_in(data.to_vec(), packet.granulepos.max(0) as u64, end)
    }

    /// Flushes everything the bitrate manager has ready. Returns whether
    /// any packet was produced.
    fn flush_packets(&mut self, shared: &mut EncShared) -> Result<bool, Error> {
        let mut produced = false;
        let mut packet: ogg_packet = unsafe { mem::zeroed() };

        while unsafe { vorbis_bitrate_flushpacket(&mut self.vd, &mut packet) } == 1 {
            self.packet_in(shared, &packet)?;
            produced = true;
        }

        Ok(produced)
    }

    /// Moves one burst of PCM into the analysis buffer, or signals end of
    /// input.
    fn read_data(&mut self, shared: &mut EncShared) -> Result<(), Error> {
        if shared.finishing() {
            if !self.wrote_end {
                unsafe { vorbis_analysis_wrote(&mut self.vd, 0) };
                self.wrote_end = true;
            }
            return Ok(());
        }

        let framesize = frame_size(shared.channels);
        let mut buffer = [0u8; READ_BURST];
        buffer[..self.carry.len()].copy_from_slice(&self.carry);
        let carried = self.carry.len();

        let input = shared.input.as_mut().ok_or(Error::Fault)?;
        let n = input.read(&mut buffer[carried..])?;

        if n == 0 {
            if input.is_eof() {
                unsafe { vorbis_analysis_wrote(&mut self.vd, 0) };
                self.wrote_end = true;
                shared.state = FrameState::Eof;
                return Ok(());
            }
            return Err(Error::Retry);
        }

        let total = carried + n;
        let aligned = total - total % framesize;
        self.carry.clear();
        self.carry.extend_from_slice(&buffer[aligned..total]);

        let frames = aligned / framesize;
        let channels = shared.channels as usize;
        let analysis = unsafe {
            std::slice::from_raw_parts(
                vorbis_analysis_buffer(&mut self.vd, frames as c_int),
                channels,
            )
        };

        for (c, &channel_buf) in analysis.iter().enumerate() {
            let samples = unsafe { std::slice::from_raw_parts_mut(channel_buf, frames) };
            for (i, sample) in samples.iter_mut().enumerate() {
                let at = (i * channels + c) * 2;
                *sample = i16::from_le_bytes([buffer[at], buffer[at + 1]]) as f32 / 32768.0;
            }
        }

        unsafe { vorbis_analysis_wrote(&mut self.vd, frames as c_int) };

        Ok(())
    }
}

impl Codec for VorbisCodec {
    fn start(&mut self, shared: &mut EncShared) -> Result<(), Error> {
        unsafe {
            vorbis_sys::vorbis_info_init(&mut self.vi);

            if vorbis_encode_init_vbr(
                &mut self.vi,
                shared.channels as c_long,
                shared.rate as c_long,
                shared.quality as f32,
            ) != 0
            {
                tracing::error!(
                    rate = shared.rate,
                    channels = shared.channels,
                    quality = shared.quality,
                    "libvorbis rejected the encoder parameters"
                );
                vorbis_info_clear(&mut self.vi);
                return Err(Error::Inval);
            }

            vorbis_comment_init(&mut self.vc);
        }

        self.add_comment("ENCODER", VENDOR_STRING);
        if let Some(metadata) = shared.metadata.clone() {
            for (key, value) in metadata.pairs() {
                self.add_comment(&key, &value);
            }
        }

        unsafe {
            vorbis_analysis_init(&mut self.vd, &mut self.vi);
            vorbis_block_init(&mut self.vd, &mut self.vb);
        }

        self.started = true;
        self.wrote_end = false;
        self.carry.clear();
        self.packets_in = 0;

        let mut header: ogg_packet = unsafe { mem::zeroed() };
        let mut header_comm: ogg_packet = unsafe { mem::zeroed() };
        let mut header_code: ogg_packet = unsafe { mem::zeroed() };
        unsafe {
            vorbis_analysis_headerout(
                &mut self.vd,
                &mut self.vc,
                &mut header,
                &mut header_comm,
                &mut header_code,
            );
        }

        self.packet_in(shared, &header)?;
        self.packet_in(shared, &header_comm)?;
        self.packet_in(shared, &header_code)?;

        tracing::info!(
            rate = shared.rate,
            channels = shared.channels,
            quality = shared.quality,
            "vorbis encoder ready"
        );

        Ok(())
    }

    fn stop(&mut self, _shared: &mut EncShared) {
        if !self.started {
            return;
        }

        unsafe {
            vorbis_block_clear(&mut self.vb);
            vorbis_dsp_clear(&mut self.vd);
            vorbis_comment_clear(&mut self.vc);
            vorbis_info_clear(&mut self.vi);

            self.vb = mem::zeroed();
            self.vd = mem::zeroed();
            self.vc = mem::zeroed();
            self.vi = mem::zeroed();
        }

        self.started = false;
        self.wrote_end = false;
        self.carry.clear();
    }

    fn process(&mut self, shared: &mut EncShared) -> Result<(), Error> {
        if self.flush_packets(shared)? {
            return Ok(());
        }

        loop {
            match unsafe { vorbis_analysis_blockout(&mut self.vd, &mut self.vb) } {
                1 => break,
                0 if self.wrote_end => {
                    // End was signalled and no blocks remain; everything
                    // is flushed already.
                    return Ok(());
                }
                0 => self.read_data(shared)?,
                _ => return Err(Error::Generic),
            }
        }

        unsafe {
            vorbis_analysis(&mut self.vb, std::ptr::null_mut());
            vorbis_bitrate_addblock(&mut self.vb);
        }

        self.flush_packets(shared)?;
        Ok(())
    }
}

impl Drop for VorbisCodec {
    fn drop(&mut self) {
        if self.started {
            unsafe {
                vorbis_block_clear(&mut self.vb);
                vorbis_dsp_clear(&mut self.vd);
                vorbis_comment_clear(&mut self.vc);
                vorbis_info_clear(&mut self.vi);
            }
            self.started = false;
        }
    }
}
