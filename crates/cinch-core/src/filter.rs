//! The reversible code filter applied to the text range before
//! compression.
//!
//! Relative branch targets make nearly-identical call sites compress
//! poorly; rewriting them as absolute addresses (stored big-endian so
//! the mostly-equal high bytes cluster) fixes that.  The transform scans
//! forward for the CALL opcode and skips the four operand bytes it
//! rewrites, so the inverse pass makes identical marker decisions and
//! the round trip is exact.

use crate::error::{PeError, Result};

/// CALL rel32.
const MARKER: u8 = 0xe8;

/// Filter id of the call-site transform.
pub const FILTER_CALL32: u8 = 0x11;
/// Strategy value meaning "never filter".
pub const STRATEGY_NO_FILTER: i32 = -3;

/// State of one filter run, shared between the compressor (which decides
/// whether filtering pays off) and the unpacker (which inverts it).
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub id: u8,
    pub cto: u8,
    /// Length of the code range inside the buffer handed to `apply`.
    pub buf_len: u32,
    /// Value added to each in-buffer position to form the stored
    /// absolute address (the code base RVA).
    pub addvalue: u32,
}

impl Filter {
    pub fn new() -> Filter {
        Filter::default()
    }

    pub fn init(&mut self, id: u8, addvalue: u32) {
        self.id = id;
        self.addvalue = addvalue;
        self.cto = 0;
    }

    /// Run the transform over `buf[..buf_len]`.  Returns the number of
    /// rewritten sites; zero means filtering brought nothing and the
    /// caller should record no filter.
    pub fn apply(&mut self, buf: &mut [u8]) -> Result<u32> {
        if self.id == 0 {
            return Ok(0);
        }
        if self.id != FILTER_CALL32 {
            return Err(PeError::internal("unknown filter id"));
        }
        let len = (self.buf_len as usize).min(buf.len());
        let mut count = 0u32;
        let mut p = 0usize;
        while p + 5 <= len {
            if buf[p] == MARKER {
                let rel = u32::from_le_bytes([buf[p + 1], buf[p + 2], buf[p + 3], buf[p + 4]]);
                let abs = rel
                    .wrapping_add(p as u32)
                    .wrapping_add(5)
                    .wrapping_add(self.addvalue);
                buf[p + 1..p + 5].copy_from_slice(&abs.to_be_bytes());
                count += 1;
                p += 5;
            } else {
                p += 1;
            }
        }
        Ok(count)
    }

    /// Exact inverse of [`apply`].
    pub fn unfilter(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.id == 0 {
            return Ok(());
        }
        if self.id != FILTER_CALL32 {
            return Err(PeError::cant_unpack("unknown filter id"));
        }
        let len = (self.buf_len as usize).min(buf.len());
        let mut p = 0usize;
        while p + 5 <= len {
            if buf[p] == MARKER {
                let abs = u32::from_be_bytes([buf[p + 1], buf[p + 2], buf[p + 3], buf[p + 4]]);
                let rel = abs
                    .wrapping_sub(p as u32)
                    .wrapping_sub(5)
                    .wrapping_sub(self.addvalue);
                buf[p + 1..p + 5].copy_from_slice(&rel.to_le_bytes());
                p += 5;
            } else {
                p += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    fn call_site(target_delta: i32) -> [u8; 5] {
        let mut b = [MARKER, 0, 0, 0, 0];
        b[1..5].copy_from_slice(&target_delta.to_le_bytes());
        b
    }

    #[test]
    fn round_trip_simple() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0x90, 0x90]);
        buf.extend_from_slice(&call_site(0x100));
        buf.extend_from_slice(&[0xc3]);
        buf.extend_from_slice(&call_site(-16));
        let original = buf.clone();

        let mut ft = Filter::new();
        ft.init(FILTER_CALL32, 0x1000);
        ft.buf_len = buf.len() as u32;
        let count = ft.apply(&mut buf).unwrap();
        assert_eq!(count, 2);
        assert_ne!(buf, original);
        ft.unfilter(&mut buf).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn marker_bytes_inside_operands_do_not_break_inverse() {
        // an operand that itself contains 0xe8 must not be re-detected
        let mut buf = Vec::new();
        buf.extend_from_slice(&[MARKER, MARKER, MARKER, MARKER, MARKER]);
        buf.extend_from_slice(&[MARKER, 1, 2, 3, 4]);
        let original = buf.clone();
        let mut ft = Filter::new();
        ft.init(FILTER_CALL32, 0);
        ft.buf_len = buf.len() as u32;
        ft.apply(&mut buf).unwrap();
        ft.unfilter(&mut buf).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn random_buffers_round_trip() {
        let mut rng = ChaCha20Rng::seed_from_u64(0x0cf1);
        for _ in 0..64 {
            let len = rng.gen_range(0..1024);
            let mut buf: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let original = buf.clone();
            let mut ft = Filter::new();
            ft.init(FILTER_CALL32, rng.gen());
            ft.buf_len = buf.len() as u32;
            ft.apply(&mut buf).unwrap();
            ft.unfilter(&mut buf).unwrap();
            assert_eq!(buf, original);
        }
    }

    #[test]
    fn disabled_filter_is_identity() {
        let mut buf = call_site(4).to_vec();
        let original = buf.clone();
        let mut ft = Filter::new();
        ft.buf_len = buf.len() as u32;
        assert_eq!(ft.apply(&mut buf).unwrap(), 0);
        assert_eq!(buf, original);
    }

    #[test]
    fn buf_len_limits_the_scan() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&call_site(8));
        buf.extend_from_slice(&call_site(8));
        let mut ft = Filter::new();
        ft.init(FILTER_CALL32, 0);
        ft.buf_len = 5;
        assert_eq!(ft.apply(&mut buf).unwrap(), 1);
        assert_eq!(&buf[5..], &call_site(8));
    }
}
