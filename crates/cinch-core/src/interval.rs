//! Sorted, coalescing set of `[start, len)` byte ranges.
//!
//! Used to mark regions of the input image that become dead once their
//! content has been preprocessed away (import names, export tables,
//! resource directories), so they can be zeroed before compression.

use crate::buffer::ImageBuf;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub len: u32,
}

#[derive(Debug, Default)]
pub struct Interval {
    entries: Vec<Span>,
}

impl Interval {
    pub fn new() -> Self {
        Interval::default()
    }

    pub fn add(&mut self, start: u32, len: u32) {
        self.entries.push(Span { start, len });
    }

    pub fn add_interval(&mut self, other: &Interval) {
        self.entries.extend_from_slice(&other.entries);
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[Span] {
        &self.entries
    }

    /// Total bytes covered.  Only meaningful after [`flatten`].
    pub fn covered(&self) -> u32 {
        self.entries.iter().map(|s| s.len).sum()
    }

    /// Sort by start ascending (longer span first on a tie), then merge
    /// every entry that overlaps or touches its predecessor.  The result
    /// is disjoint and sorted; calling it again is a no-op.
    pub fn flatten(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        self.entries
            .sort_by(|a, b| a.start.cmp(&b.start).then(b.len.cmp(&a.len)));
        let mut merged: Vec<Span> = Vec::with_capacity(self.entries.len());
        for &span in &self.entries {
            match merged.last_mut() {
                Some(last) if span.start <= last.start + last.len => {
                    let end = span.start + span.len;
                    if end > last.start + last.len {
                        last.len = end - last.start;
                    }
                }
                _ => merged.push(span),
            }
        }
        self.entries = merged;
    }

    /// Zero every covered range inside `buf`.
    pub fn clear_in(&self, what: &str, buf: &mut ImageBuf) -> Result<()> {
        for span in &self.entries {
            buf.fill(what, span.start as usize, span.len as usize, 0)?;
        }
        Ok(())
    }

    pub fn dump(&self) {
        tracing::debug!("{} intervals:", self.entries.len());
        for span in &self.entries {
            tracing::debug!("{:x} {:x}", span.start, span.len);
        }
    }
}
