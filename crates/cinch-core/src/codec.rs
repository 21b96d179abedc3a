//! The pack header and the compression collaborator.
//!
//! [`PackHeader`] is the 32-byte record patched into the loader that the
//! unpacker scans for; it carries the method, the lengths and adler32
//! checksums of both payloads, and the filter parameters.  [`Compressor`]
//! is the codec contract; [`XzCodec`] implements it with an LZMA2 stream
//! whose dictionary is sized to the input.

use std::io::{Read, Write};

use xz2::stream::{Check, Filters, LzmaOptions, Stream};

use crate::error::{PeError, Result};
use crate::filter::{Filter, FILTER_CALL32, STRATEGY_NO_FILTER};
use crate::util::{adler32, get_u32, put_u32};

// ---------------------------------------------------------------------------
// Pack header
// ---------------------------------------------------------------------------

pub const PACK_HEADER_SIZE: usize = 32;
pub const PACK_MAGIC: &[u8; 4] = b"UPX!";

/// Bumped when the persisted layout changes.
pub const PACK_VERSION: u8 = 14;
/// Oldest layout the unpacker still understands.
pub const MIN_UNPACK_VERSION: u8 = 14;

pub const METHOD_LZMA: u8 = 14;

pub const FORMAT_W32PE: u8 = 36;
pub const FORMAT_WINCE_ARM: u8 = 37;
pub const FORMAT_W64PE: u8 = 38;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackHeader {
    pub version: u8,
    pub format: u8,
    pub method: u8,
    pub level: u8,
    pub u_adler: u32,
    pub c_adler: u32,
    pub u_len: u32,
    pub c_len: u32,
    pub u_file_size: u32,
    pub filter_id: u8,
    pub filter_cto: u8,
}

impl PackHeader {
    pub fn encode(&self) -> [u8; PACK_HEADER_SIZE] {
        let mut buf = [0u8; PACK_HEADER_SIZE];
        buf[0..4].copy_from_slice(PACK_MAGIC);
        buf[4] = self.version;
        buf[5] = self.format;
        buf[6] = self.method;
        buf[7] = self.level;
        put_u32(&mut buf, 8, self.u_adler);
        put_u32(&mut buf, 12, self.c_adler);
        put_u32(&mut buf, 16, self.u_len);
        put_u32(&mut buf, 20, self.c_len);
        put_u32(&mut buf, 24, self.u_file_size);
        buf[28] = self.filter_id;
        buf[29] = self.filter_cto;
        buf[30] = 0;
        buf[31] = Self::checksum(&buf);
        buf
    }

    fn checksum(buf: &[u8]) -> u8 {
        buf[4..PACK_HEADER_SIZE - 1]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b))
    }

    pub fn decode(buf: &[u8]) -> Option<PackHeader> {
        if buf.len() < PACK_HEADER_SIZE || &buf[0..4] != PACK_MAGIC {
            return None;
        }
        if Self::checksum(buf) != buf[PACK_HEADER_SIZE - 1] {
            return None;
        }
        Some(PackHeader {
            version: buf[4],
            format: buf[5],
            method: buf[6],
            level: buf[7],
            u_adler: get_u32(buf, 8).unwrap(),
            c_adler: get_u32(buf, 12).unwrap(),
            u_len: get_u32(buf, 16).unwrap(),
            c_len: get_u32(buf, 20).unwrap(),
            u_file_size: get_u32(buf, 24).unwrap(),
            filter_id: buf[28],
            filter_cto: buf[29],
        })
    }

    /// Scan a window for the header magic.  Returns the offset of the
    /// header inside `window` and the decoded header.
    pub fn scan(window: &[u8]) -> Option<(usize, PackHeader)> {
        let mut off = 0;
        while off + PACK_HEADER_SIZE <= window.len() {
            if window[off..off + 4] == PACK_MAGIC[..] {
                if let Some(ph) = Self::decode(&window[off..]) {
                    return Some((off, ph));
                }
            }
            off += 1;
        }
        None
    }

    /// Version gate for the unpack path.
    pub fn check_version(&self) -> Result<()> {
        if self.version < MIN_UNPACK_VERSION {
            return Err(PeError::cant_unpack(
                "this program is packed with an obsolete version and cannot be unpacked",
            ));
        }
        if self.version != PACK_VERSION {
            return Err(PeError::cant_unpack(
                "program has been modified; run a virus checker!",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Compressor contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct CompressResult {
    pub c_len: u32,
    /// Extra virtual space the in-place decompressor needs beyond the
    /// uncompressed length.
    pub overlap_overhead: u32,
    pub method: u8,
    pub level: u8,
    pub filter_id: u8,
    pub filter_cto: u8,
    pub u_adler: u32,
    pub c_adler: u32,
}

pub trait Compressor {
    /// Compress `src` in place of the bulk payload.  `filter` carries
    /// `buf_len`/`addvalue` describing the code range inside `src`; a
    /// non-negative `strategy` allows the codec to filter that range
    /// first.  Raises `NotCompressible` when the result would not be
    /// smaller.
    fn compress(
        &mut self,
        src: &mut [u8],
        filter: &mut Filter,
        strategy: i32,
    ) -> Result<(Vec<u8>, CompressResult)>;

    /// Inverse transform; writes exactly the original bytes into `dst`.
    fn decompress(&mut self, method: u8, src: &[u8], dst: &mut [u8]) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// LZMA2 codec
// ---------------------------------------------------------------------------

pub struct XzCodec {
    level: u32,
}

impl XzCodec {
    pub fn new(level: u32) -> XzCodec {
        XzCodec {
            level: level.clamp(1, 9),
        }
    }

    fn dict_size(stream_len: usize) -> u32 {
        let ds = stream_len
            .max(1 << 16)
            .next_power_of_two()
            .clamp(1 << 16, 1 << 26);
        ds as u32
    }

    fn encoder(&self, src_len: usize) -> Result<Stream> {
        let mut opts = LzmaOptions::new_preset(self.level)
            .map_err(|e| PeError::Internal(format!("lzma preset: {e}")))?;
        opts.position_bits(2).dict_size(Self::dict_size(src_len));
        let mut filters = Filters::new();
        filters.lzma2(&opts);
        Stream::new_stream_encoder(&filters, Check::None)
            .map_err(|e| PeError::Internal(format!("xz encoder: {e}")))
    }
}

impl Compressor for XzCodec {
    fn compress(
        &mut self,
        src: &mut [u8],
        filter: &mut Filter,
        strategy: i32,
    ) -> Result<(Vec<u8>, CompressResult)> {
        // filter the code range first when allowed
        if strategy != STRATEGY_NO_FILTER && strategy >= 0 && filter.buf_len > 1 {
            let start = filter.addvalue as usize;
            let end = (start + filter.buf_len as usize).min(src.len());
            if start < end {
                let mut trial = Filter::new();
                trial.init(FILTER_CALL32, filter.addvalue);
                trial.buf_len = filter.buf_len;
                let hits = trial.apply(&mut src[start..end])?;
                if hits > 0 {
                    filter.id = FILTER_CALL32;
                    filter.cto = trial.cto;
                } else {
                    filter.id = 0;
                }
            }
        } else {
            filter.id = 0;
        }

        let u_adler = adler32(1, src);
        let stream = self.encoder(src.len())?;
        let mut enc = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
        enc.write_all(src)?;
        let out = enc
            .finish()
            .map_err(|e| PeError::Internal(format!("xz finish: {e}")))?;
        if out.len() >= src.len() {
            return Err(PeError::NotCompressible);
        }
        let result = CompressResult {
            c_len: out.len() as u32,
            overlap_overhead: 0x1000 + (out.len() as u32 >> 3),
            method: METHOD_LZMA,
            level: self.level as u8,
            filter_id: filter.id,
            filter_cto: filter.cto,
            u_adler,
            c_adler: adler32(1, &out),
        };
        Ok((out, result))
    }

    fn decompress(&mut self, method: u8, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        if method != METHOD_LZMA {
            return Err(PeError::cant_unpack("unknown compression method"));
        }
        let mut dec = xz2::read::XzDecoder::new(src);
        let mut produced = 0usize;
        loop {
            if produced == dst.len() {
                // anything further means the stream lies about u_len
                let mut probe = [0u8; 1];
                if dec.read(&mut probe).map_err(|_| oversized())? != 0 {
                    return Err(oversized());
                }
                break;
            }
            match dec.read(&mut dst[produced..]) {
                Ok(0) => break,
                Ok(n) => produced += n,
                Err(_) => return Err(PeError::cant_unpack("corrupt compressed data")),
            }
        }
        Ok(produced)
    }
}

fn oversized() -> PeError {
    PeError::cant_unpack("decompressed data overflows the declared length")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn pack_header_round_trip() {
        let ph = PackHeader {
            version: PACK_VERSION,
            format: FORMAT_W64PE,
            method: METHOD_LZMA,
            level: 7,
            u_adler: 0x11223344,
            c_adler: 0x55667788,
            u_len: 0x9000,
            c_len: 0x3000,
            u_file_size: 0xa000,
            filter_id: FILTER_CALL32,
            filter_cto: 0,
        };
        let bytes = ph.encode();
        assert_eq!(PackHeader::decode(&bytes), Some(ph));
    }

    #[test]
    fn corrupted_header_rejected() {
        let mut bytes = PackHeader {
            version: PACK_VERSION,
            ..PackHeader::default()
        }
        .encode();
        bytes[16] ^= 1;
        assert_eq!(PackHeader::decode(&bytes), None);
    }

    #[test]
    fn scan_finds_offset() {
        let ph = PackHeader {
            version: PACK_VERSION,
            u_len: 77,
            ..PackHeader::default()
        };
        let mut window = vec![0xccu8; 100];
        window.extend_from_slice(&ph.encode());
        window.extend_from_slice(&[0u8; 30]);
        let (off, found) = PackHeader::scan(&window).unwrap();
        assert_eq!(off, 100);
        assert_eq!(found.u_len, 77);
    }

    #[test]
    fn version_gate() {
        let mut ph = PackHeader {
            version: PACK_VERSION,
            ..PackHeader::default()
        };
        assert!(ph.check_version().is_ok());
        ph.version = PACK_VERSION + 1;
        assert!(matches!(ph.check_version(), Err(PeError::CantUnpack(_))));
        ph.version = MIN_UNPACK_VERSION - 1;
        match ph.check_version() {
            Err(PeError::CantUnpack(msg)) => assert!(msg.contains("obsolete")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn codec_round_trip() {
        let mut src: Vec<u8> = Vec::new();
        for i in 0..4096u32 {
            src.extend_from_slice(&(i / 7).to_le_bytes());
        }
        let original = src.clone();
        let mut codec = XzCodec::new(7);
        let mut ft = Filter::new();
        let (packed, info) = codec
            .compress(&mut src, &mut ft, STRATEGY_NO_FILTER)
            .unwrap();
        assert!(packed.len() < original.len());
        assert_eq!(info.c_len as usize, packed.len());
        assert_eq!(info.u_adler, adler32(1, &original));

        let mut dst = vec![0u8; original.len()];
        let n = codec.decompress(info.method, &packed, &mut dst).unwrap();
        assert_eq!(n, original.len());
        assert_eq!(dst, original);
    }

    #[test]
    fn codec_with_filter_round_trip() {
        // a code-looking payload: lots of CALL sites behind a 0x100
        // byte data prefix
        let mut src = vec![0u8; 0x100];
        for i in 0..512u32 {
            src.push(0xe8);
            src.extend_from_slice(&(i * 16).to_le_bytes());
            src.extend_from_slice(&[0x90, 0x90, 0xc3]);
        }
        let original = src.clone();
        let code_len = (src.len() - 0x100) as u32;
        let mut codec = XzCodec::new(7);
        let mut ft = Filter::new();
        ft.buf_len = code_len;
        ft.addvalue = 0x100; // code range starts past the prefix
        let (packed, info) = codec.compress(&mut src, &mut ft, 0).unwrap();
        assert_eq!(info.filter_id, FILTER_CALL32);
        // the prefix is left alone
        assert_eq!(&src[..0x100], &original[..0x100]);

        let mut dst = vec![0u8; original.len()];
        codec.decompress(info.method, &packed, &mut dst).unwrap();
        // decompressed data is still filtered; invert the code window
        let mut inv = Filter::new();
        inv.init(info.filter_id, 0x100);
        inv.cto = info.filter_cto;
        inv.buf_len = code_len;
        inv.unfilter(&mut dst[0x100..]).unwrap();
        assert_eq!(dst, original);
    }

    #[test]
    fn incompressible_input_refused() {
        let mut rng = ChaCha20Rng::seed_from_u64(99);
        let mut src: Vec<u8> = (0..512).map(|_| rng.gen()).collect();
        let mut codec = XzCodec::new(7);
        let mut ft = Filter::new();
        match codec.compress(&mut src, &mut ft, STRATEGY_NO_FILTER) {
            Err(PeError::NotCompressible) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn truncated_stream_is_cant_unpack() {
        let mut src: Vec<u8> = vec![7; 4096];
        let mut codec = XzCodec::new(7);
        let mut ft = Filter::new();
        let (packed, _) = codec
            .compress(&mut src, &mut ft, STRATEGY_NO_FILTER)
            .unwrap();
        let mut dst = vec![0u8; 4096];
        let r = codec.decompress(METHOD_LZMA, &packed[..packed.len() / 2], &mut dst);
        match r {
            // either the decoder chokes or it produces a short output;
            // the engine checks the length afterwards
            Err(PeError::CantUnpack(_)) => {}
            Ok(n) => assert!(n < 4096),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
