#![allow(dead_code)]

use oggcast::{Error, Stream, StreamHandle};

/// Serves a byte vector in fixed-size slices, ending cleanly.
pub struct ChunkSource {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl ChunkSource {
    pub fn new(data: Vec<u8>, chunk: usize) -> Self {
        ChunkSource {
            data,
            pos: 0,
            chunk,
        }
    }

    pub fn handle(data: Vec<u8>, chunk: usize) -> StreamHandle {
        StreamHandle::new(ChunkSource::new(data, chunk))
    }
}

impl Stream for ChunkSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn is_eof(&mut self) -> bool {
        self.pos == self.data.len()
    }
}

/// Interleaved 16-bit little-endian bytes for a slice of samples.
pub fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// A 1 kHz sine at `rate`, mono, `len` samples.
pub fn sine_samples(rate: u32, len: usize) -> Vec<i16> {
    (0..len)
        .map(|i| {
            let phase = (i as f64) * 1000.0 * std::f64::consts::TAU / rate as f64;
            (phase.sin() * 24000.0) as i16
        })
        .collect()
}

/// One parsed Ogg page.
pub struct Page {
    pub serial: u32,
    pub granulepos: u64,
    pub bos: bool,
    pub eos: bool,
    pub continued: bool,
    /// Lacing values of this page's segment table.
    pub lacing: Vec<u8>,
    pub body: Vec<u8>,
}

/// Splits a byte stream into Ogg pages. A trailing partial page is
/// ignored.
pub fn parse_pages(data: &[u8]) -> Vec<Page> {
    let mut pages = Vec::new();
    let mut rest = data;

    while rest.len() >= 27 {
        assert_eq!(&rest[..4], b"OggS", "lost page sync");
        let flags = rest[5];
        let granulepos = u64::from_le_bytes(rest[6..14].try_into().unwrap());
        let serial = u32::from_le_bytes(rest[14..18].try_into().unwrap());
        let segments = rest[26] as usize;

        if rest.len() < 27 + segments {
            break;
        }
        let lacing = rest[27..27 + segments].to_vec();
        let body_len: usize = lacing.iter().map(|&v| v as usize).sum();
        if rest.len() < 27 + segments + body_len {
            break;
        }

        pages.push(Page {
            serial,
            granulepos,
            bos: flags & 0x02 != 0,
            eos: flags & 0x04 != 0,
            continued: flags & 0x01 != 0,
            lacing,
            body: rest[27 + segments..27 + segments + body_len].to_vec(),
        });

        rest = &rest[27 + segments + body_len..];
    }

    pages
}

/// Reassembles the logical packets of one serial, following lacing values
/// across page boundaries.
pub fn parse_packets(pages: &[Page], serial: u32) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut pending: Vec<u8> = Vec::new();

    for page in pages.iter().filter(|p| p.serial == serial) {
        let mut at = 0;
        for &lacing in &page.lacing {
            pending.extend_from_slice(&page.body[at..at + lacing as usize]);
            at += lacing as usize;
            if lacing < 255 {
                packets.push(std::mem::take(&mut pending));
            }
        }
    }

    packets
}

/// Drains a stream handle until it reports end-of-stream or stops making
/// progress for `patience` consecutive reads.
pub fn drain_handle(handle: &mut StreamHandle, patience: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    let mut idle = 0;

    loop {
        match handle.read(&mut buf) {
            Ok(0) => {
                if handle.is_eof() || idle >= patience {
                    break;
                }
                idle += 1;
            }
            Ok(n) => {
                idle = 0;
                out.extend_from_slice(&buf[..n]);
            }
            Err(Error::Retry) => {
                if idle >= patience {
                    break;
                }
                idle += 1;
            }
            Err(err) => panic!("stream failed: {err}"),
        }
    }

    out
}
