//! File access collaborators.
//!
//! The engine reads its input through a random-access [`InputSource`]
//! and emits through a sequential [`OutputSink`]; both have file-backed
//! and in-memory implementations (the latter carry the tests).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{PeError, Result};

pub trait InputSource {
    fn seek(&mut self, pos: u64) -> Result<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    /// Short reads allowed; returns the byte count.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn size(&self) -> u64;
    fn name(&self) -> &str;
}

pub trait OutputSink {
    fn write_all(&mut self, data: &[u8]) -> Result<()>;
    fn bytes_written(&self) -> u64;
}

// ---------------------------------------------------------------------------
// File backed
// ---------------------------------------------------------------------------

pub struct FileSource {
    file: File,
    name: String,
    size: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<FileSource> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(FileSource {
            file,
            name: path.display().to_string(),
            size,
        })
    }
}

impl InputSource for FileSource {
    fn seek(&mut self, pos: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        Ok(self.file.read_exact(buf)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct FileSink {
    file: File,
    written: u64,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> Result<FileSink> {
        Ok(FileSink {
            file: File::create(path)?,
            written: 0,
        })
    }
}

impl OutputSink for FileSink {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

pub struct MemSource {
    data: Vec<u8>,
    pos: usize,
    name: String,
}

impl MemSource {
    pub fn new(data: Vec<u8>, name: impl Into<String>) -> MemSource {
        MemSource {
            data,
            pos: 0,
            name: name.into(),
        }
    }
}

impl InputSource for MemSource {
    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos as usize;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let end = self.pos.checked_add(buf.len()).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => {
                buf.copy_from_slice(&self.data[self.pos..end]);
                self.pos = end;
                Ok(())
            }
            None => Err(PeError::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            ))),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let avail = self.data.len().saturating_sub(self.pos);
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
pub struct MemSink {
    data: Vec<u8>,
}

impl MemSink {
    pub fn new() -> MemSink {
        MemSink::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl OutputSink for MemSink {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.data.len() as u64
    }
}
