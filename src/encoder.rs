//! Codec-agnostic Ogg encoder stage.
//!
//! The encoder reads PCM from its upstream, runs it through a codec
//! backend and exposes the resulting Ogg bitstream as a stream handle. The
//! read side is a *page pump*: whenever the consumer has drained all
//! completed pages, the codec's `process` is invoked until the muxer emits
//! more, and the resulting bytes are handed out as they are asked for.
//!
//! The frame moves through a small state machine:
//!
//! ```text
//! NeedInit -> Running -> Eof                        (input ended / reset)
//!                     -> NeedRestart -> NeedReset   (soft restart)
//!                     -> NeedStop                   (stop request)
//! NeedReset -> Running                              (new serial, headers again)
//! NeedStop  -> NeedInit
//! ```
//!
//! A restart always finishes the current bitstream with an end-of-stream
//! page before the first page of the new serial is produced, so a
//! downstream Ogg parser sees two complete logical streams.

use std::collections::VecDeque;
use std::io;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use ogg::{PacketWriteEndInfo, PacketWriter};
use rand::Rng;

use crate::common::{ChannelCount, SampleRate};
use crate::metadata::Metadata;
use crate::stream::{Stream, StreamHandle};
use crate::Error;

#[cfg(feature = "opus")]
mod opus;
#[cfg(feature = "vorbis")]
mod vorbis;

/// Vendor string written into every comment header, and the value of the
/// always-present `ENCODER` tag. This is a wire constant; changing it
/// changes the produced bitstreams.
pub(crate) const VENDOR_STRING: &str = "libcoolmic-dsp";

/// Quality range accepted by [`Encoder::set_quality`].
const QUALITY_RANGE: std::ops::RangeInclusive<f64> = -0.1..=1.0;

/// The codecs an [`Encoder`] can be built around.
///
/// Each variant needs its backend compiled in (the `vorbis` and `opus`
/// features); constructing an encoder for a missing backend fails with
/// [`Error::NoSys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// Ogg Vorbis, quality-based VBR.
    Vorbis,
    /// Ogg Opus, 48 kHz only, bitrate derived from the quality setting.
    Opus,
}

impl FromStr for CodecKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("vorbis") {
            Ok(CodecKind::Vorbis)
        } else if s.eq_ignore_ascii_case("opus") {
            Ok(CodecKind::Opus)
        } else {
            Err(Error::NoSys)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    NeedInit,
    Running,
    Eof,
    NeedRestart,
    NeedReset,
    NeedStop,
}

/// Everything a codec backend may touch: signal parameters, the input
/// handle, the metadata reference and the muxer.
struct EncShared {
    rate: SampleRate,
    channels: ChannelCount,
    quality: f64,
    state: FrameState,
    input: Option<StreamHandle>,
    metadata: Option<Metadata>,
    mux: OggMux,
}

impl EncShared {
    /// True while the codec should finish the current bitstream rather
    /// than pull more input.
    fn finishing(&self) -> bool {
        matches!(
            self.state,
            FrameState::Eof | FrameState::NeedReset | FrameState::NeedRestart | FrameState::NeedStop
        )
    }
}

/// A codec backend drives packets into the muxer via three lifecycle
/// callbacks.
trait Codec: Send {
    /// Initializes the codec and writes its header packets.
    fn start(&mut self, shared: &mut EncShared) -> Result<(), Error>;

    /// Releases all codec state in preparation for a new `start`.
    fn stop(&mut self, shared: &mut EncShared);

    /// Feeds the muxer. Returns `Err(Error::Retry)` when input is not
    /// available right now (recoverable); any other error is fatal to the
    /// frame.
    fn process(&mut self, shared: &mut EncShared) -> Result<(), Error>;
}

/// How a packet finishes its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketEnd {
    /// Pages are cut wherever the muxer finds convenient.
    Normal,
    /// Force the page out after this packet.
    Page,
    /// This packet ends the logical bitstream.
    Stream,
}

/// Completed page bytes waiting for the consumer. Clones share the same
/// queue; the muxer writes through one clone while the drain side reads
/// through another.
#[derive(Clone, Default)]
struct PageQueue {
    data: Arc<Mutex<VecDeque<u8>>>,
}

impl io::Write for PageQueue {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.lock().unwrap().extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The Ogg muxer collaborator: one live serial at a time, packets in,
/// completed page bytes out.
struct OggMux {
    writer: PacketWriter<'static, PageQueue>,
    queue: PageQueue,
    serial: u32,
    eos_written: bool,
}

impl OggMux {
    fn new() -> Self {
        let queue = PageQueue::default();
        OggMux {
            writer: PacketWriter::new(queue.clone()),
            queue,
            serial: 0,
            eos_written: false,
        }
    }

    /// Starts a fresh logical bitstream with a new serial.
    fn begin_stream(&mut self) {
        self.serial = rand::thread_rng().gen();
        self.eos_written = false;
        tracing::debug!(serial = self.serial, "new ogg bitstream");
    }

    fn packet_in(&mut self, packet: Vec<u8>, granulepos: u64, end: PacketEnd) -> Result<(), Error> {
        let info = match end {
            PacketEnd::Normal => PacketWriteEndInfo::NormalPacket,
            PacketEnd::Page => PacketWriteEndInfo::EndPage,
            PacketEnd::Stream => PacketWriteEndInfo::EndStream,
        };

        if end == PacketEnd::Stream {
            self.eos_written = true;
        }

        self.writer
            .write_packet(packet, self.serial, info, granulepos)
            .map_err(|err| {
                tracing::error!(%err, "ogg muxer rejected packet");
                Error::Generic
            })
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.data.lock().unwrap().is_empty()
    }

    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let mut queue = self.queue.data.lock().unwrap();
        let len = buf.len().min(queue.len());
        for byte in buf[..len].iter_mut() {
            *byte = match queue.pop_front() {
                Some(byte) => byte,
                None => break,
            };
        }
        len
    }
}

enum Pumped {
    /// Page bytes are available.
    Data,
    /// The stream is over; the consumer sees end-of-stream.
    Drained,
    /// A bitstream boundary was crossed; zero bytes this call, more on the
    /// next one.
    Boundary,
}

struct EncCore {
    shared: EncShared,
    codec: Box<dyn Codec>,
    fatal: bool,
}

impl EncCore {
    fn start_codec(&mut self) -> Result<(), Error> {
        tracing::info!("encoder start request");
        self.shared.mux.begin_stream();

        if let Err(err) = self.codec.start(&mut self.shared) {
            tracing::error!(%err, "encoder start failed");
            self.fatal = true;
            return Err(err);
        }

        self.shared.state = FrameState::Running;
        Ok(())
    }

    fn stop_codec(&mut self) {
        tracing::info!("encoder stop request");
        self.codec.stop(&mut self.shared);
        self.shared.state = FrameState::NeedInit;
    }

    /// Makes page bytes available, crossing codec lifecycle boundaries as
    /// the state machine demands.
    fn pump(&mut self) -> Result<Pumped, Error> {
        if self.shared.state == FrameState::NeedInit {
            self.start_codec()?;
        }

        loop {
            if !self.shared.mux.queue_is_empty() {
                return Ok(Pumped::Data);
            }

            if self.shared.mux.eos_written {
                match self.shared.state {
                    FrameState::Eof => return Ok(Pumped::Drained),
                    FrameState::NeedRestart => self.shared.state = FrameState::NeedReset,
                    _ => {}
                }
            }

            match self.shared.state {
                FrameState::NeedReset => {
                    self.stop_codec();
                    self.start_codec()?;
                    return Ok(Pumped::Boundary);
                }
                FrameState::NeedStop => {
                    self.stop_codec();
                    return Ok(Pumped::Boundary);
                }
                _ => {}
            }

            tracing::trace!("no page buffered, calling codec process");
            match self.codec.process(&mut self.shared) {
                Ok(()) => {}
                Err(Error::Retry) => return Err(Error::Retry),
                Err(err) => {
                    self.fatal = true;
                    return Err(err);
                }
            }
        }
    }
}

/// The encoder stage.
pub struct Encoder {
    core: Arc<Mutex<EncCore>>,
}

impl Encoder {
    /// Creates an encoder for `codec` at the given signal parameters.
    ///
    /// The codec is only opened when the first page is pulled; parameter
    /// problems the codec itself detects (such as Opus' 48 kHz
    /// requirement) are reported there.
    pub fn new(codec: CodecKind, rate: SampleRate, channels: ChannelCount) -> Result<Self, Error> {
        if rate == 0 || channels == 0 {
            return Err(Error::Inval);
        }

        let backend: Box<dyn Codec> = match codec {
            #[cfg(feature = "vorbis")]
            CodecKind::Vorbis => Box::new(vorbis::VorbisCodec::new()),
            #[cfg(feature = "opus")]
            CodecKind::Opus => Box::new(opus::OpusCodec::new()),
            #[allow(unreachable_patterns)]
            _ => {
                tracing::error!(?codec, "codec backend not compiled in");
                return Err(Error::NoSys);
            }
        };

        Ok(Encoder::with_codec(backend, rate, channels))
    }

    fn with_codec(codec: Box<dyn Codec>, rate: SampleRate, channels: ChannelCount) -> Self {
        Encoder {
            core: Arc::new(Mutex::new(EncCore {
                shared: EncShared {
                    rate,
                    channels,
                    quality: 0.1,
                    state: FrameState::NeedInit,
                    input: None,
                    metadata: None,
                    mux: OggMux::new(),
                },
                codec,
                fatal: false,
            })),
        }
    }

    /// Attaches (or with `None`, detaches) the PCM input.
    pub fn attach(&self, input: Option<StreamHandle>) {
        self.core.lock().unwrap().shared.input = input;
    }

    /// Returns the encoded bitstream as a stream handle.
    pub fn get_output(&self) -> StreamHandle {
        StreamHandle::new(EncReader {
            core: Arc::clone(&self.core),
        })
    }

    /// True once the output has delivered a complete bitstream and holds
    /// nothing further.
    pub fn output_at_eof(&self) -> bool {
        let core = self.core.lock().unwrap();
        core.shared.state == FrameState::Eof
            && core.shared.mux.eos_written
            && core.shared.mux.queue_is_empty()
    }

    /// Forces a full bitstream restart.
    ///
    /// The current stream is finished with an end-of-stream page and a new
    /// stream (new Ogg serial) is started immediately; bytes already
    /// produced stay queued for the consumer in order.
    pub fn reset(&self) -> Result<(), Error> {
        let mut core = self.core.lock().unwrap();
        tracing::info!("encoder reset request");

        if core.fatal {
            return Err(Error::Generic);
        }

        match core.shared.state {
            FrameState::NeedInit => return Ok(()),
            FrameState::Running | FrameState::Eof => {}
            _ => return Err(Error::Generic),
        }

        core.shared.state = FrameState::Eof;

        // Drive the codec until the end-of-stream page is out.
        while !core.shared.mux.eos_written {
            let core = &mut *core;
            if let Err(err) = core.codec.process(&mut core.shared) {
                if err != Error::Retry {
                    core.fatal = true;
                    return Err(err);
                }
            }
        }

        core.shared.state = FrameState::NeedReset;
        core.stop_codec();
        core.start_codec()?;

        Ok(())
    }

    /// Requests a soft restart: the current page group is finished first,
    /// then the bitstream restarts with fresh headers. Quality and
    /// metadata changes take effect at the boundary.
    pub fn restart(&self) -> Result<(), Error> {
        let mut core = self.core.lock().unwrap();
        tracing::info!("encoder restart request");

        match core.shared.state {
            FrameState::Running | FrameState::Eof => {
                core.shared.state = FrameState::NeedRestart;
                Ok(())
            }
            _ => Err(Error::Generic),
        }
    }

    /// Requests the encoder to stop once the current page group is
    /// flushed. Fails with [`Error::Busy`] while a start or stop is
    /// already in flight.
    pub fn stop(&self) -> Result<(), Error> {
        let mut core = self.core.lock().unwrap();

        match core.shared.state {
            FrameState::Running
            | FrameState::Eof
            | FrameState::NeedReset
            | FrameState::NeedRestart => {
                core.shared.state = FrameState::NeedStop;
                Ok(())
            }
            _ => Err(Error::Busy),
        }
    }

    /// Current encoder quality.
    pub fn quality(&self) -> f64 {
        self.core.lock().unwrap().shared.quality
    }

    /// Sets the encoder quality, in `[-0.1, 1.0]`.
    ///
    /// Takes effect at the next codec start (see [`Encoder::restart`]).
    pub fn set_quality(&self, quality: f64) -> Result<(), Error> {
        if !QUALITY_RANGE.contains(&quality) {
            return Err(Error::Inval);
        }
        self.core.lock().unwrap().shared.quality = quality;
        Ok(())
    }

    /// Returns the metadata store the comment headers are built from.
    pub fn metadata(&self) -> Option<Metadata> {
        self.core.lock().unwrap().shared.metadata.clone()
    }

    /// Replaces the metadata store reference.
    pub fn set_metadata(&self, metadata: Option<Metadata>) {
        self.core.lock().unwrap().shared.metadata = metadata;
    }
}

struct EncReader {
    core: Arc<Mutex<EncCore>>,
}

impl Stream for EncReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut core = self.core.lock().unwrap();

        if core.fatal {
            return Err(Error::Generic);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if core.shared.state == FrameState::NeedInit || core.shared.mux.queue_is_empty() {
            match core.pump()? {
                Pumped::Data => {}
                Pumped::Drained | Pumped::Boundary => return Ok(0),
            }
        }

        Ok(core.shared.mux.drain(buf))
    }

    fn is_eof(&mut self) -> bool {
        let core = self.core.lock().unwrap();
        core.shared.state == FrameState::Eof
            && core.shared.mux.eos_written
            && core.shared.mux.queue_is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal codec: one header packet per start, then one data packet
    /// per process call, finishing with an EOS packet when asked.
    struct TestCodec {
        started: bool,
        counter: u64,
        fail_start: bool,
    }

    impl TestCodec {
        fn new() -> Self {
            TestCodec {
                started: false,
                counter: 0,
                fail_start: false,
            }
        }
    }

    impl Codec for TestCodec {
        fn start(&mut self, shared: &mut EncShared) -> Result<(), Error> {
            if self.fail_start {
                return Err(Error::Inval);
            }
            self.started = true;
            shared
                .mux
                .packet_in(b"HDR".to_vec(), 0, PacketEnd::Page)?;
            Ok(())
        }

        fn stop(&mut self, _shared: &mut EncShared) {
            self.started = false;
        }

        fn process(&mut self, shared: &mut EncShared) -> Result<(), Error> {
            self.counter += 1;
            if shared.finishing() {
                shared
                    .mux
                    .packet_in(b"END".to_vec(), self.counter, PacketEnd::Stream)?;
            } else {
                shared
                    .mux
                    .packet_in(vec![0x42; 64], self.counter, PacketEnd::Page)?;
            }
            Ok(())
        }
    }

    fn encoder_with_test_codec() -> Encoder {
        Encoder::with_codec(Box::new(TestCodec::new()), 48000, 1)
    }

    fn read_all_available(handle: &mut StreamHandle, limit: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while out.len() < limit {
            let n = handle.read(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
            if n == 0 {
                break;
            }
        }
        out
    }

    fn page_serial(page: &[u8]) -> u32 {
        u32::from_le_bytes([page[14], page[15], page[16], page[17]])
    }

    fn split_pages(stream: &[u8]) -> Vec<&[u8]> {
        // An Ogg page is 27 bytes of header, the segment table, then the
        // segment payload. A trailing partial page is ignored.
        let mut pages = Vec::new();
        let mut rest = stream;
        while rest.len() >= 27 {
            assert_eq!(&rest[..4], b"OggS");
            let segments = rest[26] as usize;
            if rest.len() < 27 + segments {
                break;
            }
            let body: usize = rest[27..27 + segments].iter().map(|&v| v as usize).sum();
            let len = 27 + segments + body;
            if rest.len() < len {
                break;
            }
            pages.push(&rest[..len]);
            rest = &rest[len..];
        }
        pages
    }

    #[test]
    fn produces_ogg_pages_on_demand() {
        let enc = encoder_with_test_codec();
        let mut out = enc.get_output();

        let bytes = read_all_available(&mut out, 512);
        let pages = split_pages(&bytes);
        assert!(pages.len() >= 2);
        // First page carries the beginning-of-stream flag.
        assert_eq!(pages[0][5] & 0x02, 0x02);
    }

    #[test]
    fn quality_round_trip_and_range() {
        let enc = encoder_with_test_codec();
        enc.set_quality(0.3).unwrap();
        assert_eq!(enc.quality(), 0.3);
        assert_eq!(enc.set_quality(1.5), Err(Error::Inval));
        assert_eq!(enc.set_quality(-0.2), Err(Error::Inval));
        assert_eq!(enc.quality(), 0.3);
    }

    #[test]
    fn metadata_reference_round_trip() {
        let enc = encoder_with_test_codec();
        assert!(enc.metadata().is_none());

        let meta = Metadata::new();
        meta.add("TITLE", "t");
        enc.set_metadata(Some(meta));
        assert_eq!(enc.metadata().unwrap().values("TITLE"), vec!["t"]);

        enc.set_metadata(None);
        assert!(enc.metadata().is_none());
    }

    #[test]
    fn reset_emits_eos_then_new_serial() {
        let enc = encoder_with_test_codec();
        let mut out = enc.get_output();

        let before = read_all_available(&mut out, 300);
        enc.reset().unwrap();
        let after = read_all_available(&mut out, 600);

        let mut stream = before;
        stream.extend_from_slice(&after);
        let pages = split_pages(&stream);

        let eos_index = pages
            .iter()
            .position(|p| p[5] & 0x04 == 0x04)
            .expect("an end-of-stream page");
        assert!(eos_index + 1 < pages.len(), "a new stream follows the EOS page");

        let old_serial = page_serial(pages[0]);
        let new_serial = page_serial(pages[eos_index + 1]);
        assert_ne!(old_serial, new_serial);
        // The page right after EOS starts the new stream.
        assert_eq!(pages[eos_index + 1][5] & 0x02, 0x02);
    }

    #[test]
    fn restart_is_deferred_to_the_page_boundary() {
        let enc = encoder_with_test_codec();
        let mut out = enc.get_output();

        read_all_available(&mut out, 200);
        enc.restart().unwrap();

        // Keep reading: the old stream must end, then a new one begins.
        let mut stream = Vec::new();
        let mut buf = [0u8; 128];
        let mut zero_reads = 0;
        while zero_reads < 3 {
            let n = out.read(&mut buf).unwrap();
            if n == 0 {
                zero_reads += 1;
            } else {
                zero_reads = 0;
                stream.extend_from_slice(&buf[..n]);
            }
            if stream.len() > 2048 {
                break;
            }
        }

        let pages = split_pages(&stream);
        let eos_index = pages.iter().position(|p| p[5] & 0x04 == 0x04).unwrap();
        assert!(eos_index + 1 < pages.len());
        assert_ne!(page_serial(pages[0]), page_serial(pages[eos_index + 1]));
    }

    #[test]
    fn failed_start_latches_the_fatal_state() {
        let enc = Encoder::with_codec(
            Box::new(TestCodec {
                started: false,
                counter: 0,
                fail_start: true,
            }),
            48000,
            1,
        );
        let mut out = enc.get_output();

        let mut buf = [0u8; 16];
        assert_eq!(out.read(&mut buf), Err(Error::Inval));
        // Every read afterwards fails the same way.
        assert_eq!(out.read(&mut buf), Err(Error::Generic));
    }

    #[test]
    fn stop_flushes_then_returns_to_need_init() {
        let enc = encoder_with_test_codec();
        let mut out = enc.get_output();

        read_all_available(&mut out, 100);
        enc.stop().unwrap();

        // Drain until the boundary; afterwards the encoder re-initializes
        // on the next read.
        let mut buf = [0u8; 256];
        loop {
            let n = out.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
        }

        assert_eq!(
            self::FrameState::NeedInit,
            enc.core.lock().unwrap().shared.state
        );
    }

    #[test]
    fn stop_in_need_init_is_busy() {
        let enc = encoder_with_test_codec();
        assert_eq!(enc.stop(), Err(Error::Busy));
    }
}
