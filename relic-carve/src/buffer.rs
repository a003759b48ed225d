//! Overlapping buffered reads for very large evidence files.
//!
//! Carving a multi-gigabyte capture cannot hold the file in memory. A
//! [`BufferedFile`] reads it window by window, keeping a configurable
//! overlap from the previous window so packets straddling a boundary are
//! still found; the (filename, index, length) dedup in [`crate::Frames`]
//! drops the second sighting of anything inside the overlap.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Default buffer size: 100 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 100 * 1024 * 1024;
/// Default overlap: 1 MiB.
pub const DEFAULT_OVERLAP_SIZE: usize = 1024 * 1024;

/// An error while buffering an input file.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Reading the file failed.
    #[error("error reading file")]
    Io(#[from] io::Error),
    /// The buffer could not be allocated; retry with a smaller buffer size.
    #[error("data is too large to fit in memory, use a smaller buffer")]
    OutOfMemory,
}

/// A file read through an overlapping sliding window.
#[derive(Debug)]
pub struct BufferedFile {
    path: PathBuf,
    file: Option<File>,
    buffer_size: usize,
    overlap_size: usize,
    /// File offset of the first byte of [`BufferedFile::buffer`].
    pub index: Option<u64>,
    /// The current window.
    pub buffer: Vec<u8>,
    file_size: u64,
    bytes_read: u64,
}

impl BufferedFile {
    /// Prepares a buffered reader over `path`.
    pub fn new(path: &Path, buffer_size: usize, overlap_size: usize) -> io::Result<Self> {
        let file_size = std::fs::metadata(path)?.len();
        Ok(BufferedFile {
            path: path.to_owned(),
            file: None,
            buffer_size,
            overlap_size,
            index: None,
            buffer: Vec::new(),
            file_size,
            bytes_read: 0,
        })
    }

    /// Advances to the next window.
    ///
    /// Returns `Ok(false)` once the file is exhausted. The first window is
    /// `buffer_size + overlap_size` bytes; every further call keeps the
    /// trailing `overlap_size` bytes and appends another `buffer_size`.
    pub fn read(&mut self) -> Result<bool, BufferError> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.path)?);
        }
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(false),
        };

        match self.index {
            None => {
                self.index = Some(0);
                self.buffer = read_up_to(file, self.buffer_size + self.overlap_size)?;
                self.bytes_read += self.buffer.len() as u64;
                Ok(!self.buffer.is_empty())
            }
            Some(index) => {
                let keep = self.buffer.len().saturating_sub(self.overlap_size);
                self.buffer.drain(..keep);
                let chunk = read_up_to(file, self.buffer_size)?;
                if chunk.is_empty() {
                    return Ok(false);
                }
                self.bytes_read += chunk.len() as u64;
                self.buffer.extend_from_slice(&chunk);
                self.index = Some(index + self.buffer_size as u64);
                Ok(true)
            }
        }
    }

    /// Percentage of the file read so far.
    pub fn progress(&self) -> u8 {
        if self.file_size == 0 {
            return 100;
        }
        ((self.bytes_read as f64 / self.file_size as f64) * 100.0) as u8
    }

    /// Size of the underlying file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

/// Reads up to `limit` bytes, surfacing allocation failure as
/// [`BufferError::OutOfMemory`].
fn read_up_to(file: &mut File, limit: usize) -> Result<Vec<u8>, BufferError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(limit.min(usize::MAX / 2))
        .map_err(|_| BufferError::OutOfMemory)?;
    file.take(limit as u64).read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use tempfile::NamedTempFile;

    #[test]
    fn test_windows_overlap() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();

        let mut buffered = BufferedFile::new(tmp.path(), 4, 2).unwrap();
        assert!(buffered.read().unwrap());
        assert_eq!(buffered.index, Some(0));
        assert_eq!(buffered.buffer, b"012345");

        assert!(buffered.read().unwrap());
        assert_eq!(buffered.index, Some(4));
        assert_eq!(buffered.buffer, b"456789");

        assert!(!buffered.read().unwrap());
        assert_eq!(buffered.progress(), 100);
    }

    #[test]
    fn test_empty_file() {
        let tmp = NamedTempFile::new().unwrap();
        let mut buffered = BufferedFile::new(tmp.path(), 4, 2).unwrap();
        assert!(!buffered.read().unwrap());
    }
}
