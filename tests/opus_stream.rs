//! End-to-end shape of the produced Ogg Opus bitstream.

use oggcast::{CodecKind, Encoder, Error, Metadata};

mod test_support;
use test_support::{drain_handle, parse_packets, parse_pages, pcm_bytes, sine_samples, ChunkSource};

const VENDOR: &str = "libcoolmic-dsp";

/// Reads a little-endian u32 out of a comment packet.
fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

/// Splits an `OpusTags` packet into its user comments.
fn parse_comments(tags: &[u8]) -> (String, Vec<String>) {
    assert_eq!(&tags[..8], b"OpusTags");
    let vendor_len = read_u32(tags, 8) as usize;
    let vendor = String::from_utf8(tags[12..12 + vendor_len].to_vec()).unwrap();

    let mut at = 12 + vendor_len;
    let count = read_u32(tags, at) as usize;
    at += 4;

    let mut comments = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_u32(tags, at) as usize;
        at += 4;
        comments.push(String::from_utf8(tags[at..at + len].to_vec()).unwrap());
        at += len;
    }
    assert_eq!(at, tags.len(), "trailing bytes after the last comment");

    (vendor, comments)
}

#[test]
fn one_exact_frame_yields_head_tags_and_one_eos_packet() {
    // 60 ms of stereo at 48 kHz: 2880 frames * 2 channels * 2 bytes.
    let pcm = pcm_bytes(&vec![0i16; 2880 * 2]);
    assert_eq!(pcm.len(), 11520);

    let enc = Encoder::new(CodecKind::Opus, 48000, 2).unwrap();
    enc.attach(Some(ChunkSource::handle(pcm, 1024)));

    let mut out = enc.get_output();
    let bytes = drain_handle(&mut out, 3);
    assert!(out.is_eof());

    let pages = parse_pages(&bytes);
    assert_eq!(pages.len(), 3);

    assert!(pages[0].bos);
    assert!(pages[1].continued == false && !pages[1].bos);
    assert!(pages[2].eos);
    assert_eq!(pages[2].granulepos, 2880);

    let serial = pages[0].serial;
    let packets = parse_packets(&pages, serial);
    assert_eq!(packets.len(), 3);
    assert_eq!(&packets[0][..8], b"OpusHead");
    assert_eq!(&packets[1][..8], b"OpusTags");
    assert!(!packets[2].is_empty());
}

#[test]
fn head_packet_describes_the_signal() {
    let pcm = pcm_bytes(&vec![0i16; 2880]);

    let enc = Encoder::new(CodecKind::Opus, 48000, 1).unwrap();
    enc.attach(Some(ChunkSource::handle(pcm, 512)));

    let mut out = enc.get_output();
    let bytes = drain_handle(&mut out, 3);
    let pages = parse_pages(&bytes);
    let packets = parse_packets(&pages, pages[0].serial);

    let head = &packets[0];
    assert_eq!(head.len(), 19);
    assert_eq!(head[8], 1); // version
    assert_eq!(head[9], 1); // channel count
    assert_eq!(u16::from_le_bytes([head[10], head[11]]), 0); // pre-skip
    assert_eq!(read_u32(head, 12), 48000); // input rate
}

#[test]
fn tags_carry_vendor_and_metadata_in_order() {
    let metadata = Metadata::new();
    metadata.add("TITLE", "A");
    metadata.add("TITLE", "B");
    metadata.set("ARTIST", "X");

    let enc = Encoder::new(CodecKind::Opus, 48000, 1).unwrap();
    enc.set_metadata(Some(metadata));
    enc.attach(Some(ChunkSource::handle(pcm_bytes(&vec![0i16; 2880]), 512)));

    let mut out = enc.get_output();
    let bytes = drain_handle(&mut out, 3);
    let pages = parse_pages(&bytes);
    let packets = parse_packets(&pages, pages[0].serial);

    let (vendor, comments) = parse_comments(&packets[1]);
    assert_eq!(vendor, VENDOR);
    assert_eq!(
        comments,
        vec![
            format!("ENCODER={VENDOR}"),
            "TITLE=A".to_string(),
            "TITLE=B".to_string(),
            "ARTIST=X".to_string(),
        ]
    );
}

#[test]
fn multiple_frames_advance_the_granule_position() {
    // Five full packets of real signal.
    let samples = sine_samples(48000, 2880 * 5);
    let enc = Encoder::new(CodecKind::Opus, 48000, 1).unwrap();
    enc.attach(Some(ChunkSource::handle(pcm_bytes(&samples), 4096)));

    let mut out = enc.get_output();
    let bytes = drain_handle(&mut out, 3);
    let pages = parse_pages(&bytes);

    let last = pages.last().unwrap();
    assert!(last.eos);
    assert_eq!(last.granulepos, 2880 * 5);

    let packets = parse_packets(&pages, pages[0].serial);
    assert_eq!(packets.len(), 2 + 5); // head, tags, five audio packets
}

#[test]
fn partial_final_frame_is_padded_not_dropped() {
    // One and a half packets of input.
    let samples = sine_samples(48000, 2880 + 1440);
    let enc = Encoder::new(CodecKind::Opus, 48000, 1).unwrap();
    enc.attach(Some(ChunkSource::handle(pcm_bytes(&samples), 4096)));

    let mut out = enc.get_output();
    let bytes = drain_handle(&mut out, 3);
    let pages = parse_pages(&bytes);

    let last = pages.last().unwrap();
    assert!(last.eos);
    // The padded final packet still advances by a whole frame.
    assert_eq!(last.granulepos, 2880 * 2);
}

#[test]
fn opus_rejects_odd_rates() {
    let enc = Encoder::new(CodecKind::Opus, 44100, 1).unwrap();
    let mut out = enc.get_output();
    let mut buf = [0u8; 64];
    assert_eq!(out.read(&mut buf), Err(Error::Inval));
}
