//! Owned views of evidence bytes.
//!
//! Core dumps, IOMEM captures and firmware images are routinely hundreds of
//! megabytes, so evidence files are memory mapped rather than copied into
//! the process. Evidence is also commonly exchanged inside ZIP containers
//! protected with the conventional password `infected`;
//! [`ByteView::open_evidence`] unwraps those transparently.

use std::fs::File;
use std::io::{self, Read};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use thiserror::Error;
#[cfg(test)]
use zip::unstable::write::FileOptionsExt;

/// Password conventionally protecting evidence exchange containers.
const CONTAINER_PASSWORD: &[u8] = b"infected";

/// An error opening an evidence file.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// Reading the file failed.
    #[error("error reading file")]
    Io(#[from] io::Error),
    /// The ZIP container could not be read.
    #[error("error reading container")]
    Container(#[from] zip::result::ZipError),
    /// The ZIP container holds no file.
    #[error("container holds no file")]
    EmptyContainer,
}

/// The owner of the bytes behind a [`ByteView`].
#[derive(Debug)]
enum ByteViewBacking {
    Buf(Vec<u8>),
    Mmap(Mmap),
}

impl Deref for ByteViewBacking {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match *self {
            ByteViewBacking::Buf(ref buf) => buf,
            ByteViewBacking::Mmap(ref mmap) => mmap,
        }
    }
}

/// An immutable, cheaply clonable buffer of evidence bytes.
///
/// Every parser in the suite takes `&[u8]` and treats it as read-only
/// evidence; a `ByteView` is where those bytes live. Raw files are memory
/// mapped, container contents are held in an owned buffer, and either form
/// dereferences into a `&[u8]`.
#[derive(Clone, Debug)]
pub struct ByteView {
    backing: Arc<ByteViewBacking>,
}

impl ByteView {
    fn with_backing(backing: ByteViewBacking) -> Self {
        ByteView {
            backing: Arc::new(backing),
        }
    }

    /// Wraps an in-memory buffer, e.g. bytes extracted from a container.
    pub fn from_vec(buffer: Vec<u8>) -> Self {
        ByteView::with_backing(ByteViewBacking::Buf(buffer))
    }

    /// Memory maps a raw file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let file = File::open(path)?;
        let backing = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => ByteViewBacking::Mmap(mmap),
            // empty files cannot be mapped; an empty dump is still evidence
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                ByteViewBacking::Buf(Vec::new())
            }
            Err(err) => return Err(err),
        };
        Ok(ByteView::with_backing(backing))
    }

    /// Opens an evidence file, transparently unwrapping `.zip` containers.
    ///
    /// Containers are read through their first entry, decrypted with the
    /// conventional `infected` password when necessary; anything else is
    /// memory mapped as-is.
    pub fn open_evidence<P: AsRef<Path>>(path: P) -> Result<Self, EvidenceError> {
        let path = path.as_ref();
        if !is_zip_container(path) {
            return Ok(ByteView::open(path)?);
        }
        let mut archive = zip::ZipArchive::new(File::open(path)?)?;
        if archive.len() == 0 {
            return Err(EvidenceError::EmptyContainer);
        }
        let mut content = archive.by_index_decrypt(0, CONTAINER_PASSWORD)?;
        let mut buffer = Vec::new();
        content.read_to_end(&mut buffer)?;
        Ok(ByteView::from_vec(buffer))
    }

    /// Returns a slice of the underlying data.
    pub fn as_slice(&self) -> &[u8] {
        self.backing.deref()
    }
}

impl AsRef<[u8]> for ByteView {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Deref for ByteView {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

fn is_zip_container(path: &Path) -> bool {
    path.extension()
        .map(|extension| extension.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use tempfile::NamedTempFile;

    #[test]
    fn test_open_raw_dump() -> Result<(), io::Error> {
        let mut tmp = NamedTempFile::new()?;
        tmp.write_all(b"\xDE\xAD\x12\x34\x00\x00\x00\x05")?;

        let view = ByteView::open(tmp.path())?;
        assert_eq!(&view[..4], b"\xDE\xAD\x12\x34");
        Ok(())
    }

    #[test]
    fn test_open_empty_dump() -> Result<(), io::Error> {
        let tmp = NamedTempFile::new()?;

        let view = ByteView::open(tmp.path())?;
        assert_eq!(&*view, b"");
        Ok(())
    }

    #[test]
    fn test_evidence_passthrough_for_raw_files() {
        let mut tmp = tempfile::Builder::new()
            .suffix(".bin")
            .tempfile()
            .unwrap();
        tmp.write_all(b"\x7FELF").unwrap();

        let view = ByteView::open_evidence(tmp.path()).unwrap();
        assert_eq!(&*view, b"\x7FELF");
    }

    #[test]
    fn test_evidence_unwraps_protected_container() {
        let container = tempfile::Builder::new()
            .suffix(".zip")
            .tempfile()
            .unwrap();
        let mut writer = zip::ZipWriter::new(container.reopen().unwrap());
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .with_deprecated_encryption(CONTAINER_PASSWORD);
        writer.start_file("coredump.bin", options).unwrap();
        writer.write_all(b"\xAB\x12\x34\xCD evidence").unwrap();
        writer.finish().unwrap();

        let view = ByteView::open_evidence(container.path()).unwrap();
        assert_eq!(&*view, b"\xAB\x12\x34\xCD evidence");
    }

    #[test]
    fn test_evidence_rejects_empty_container() {
        let container = tempfile::Builder::new()
            .suffix(".zip")
            .tempfile()
            .unwrap();
        let writer = zip::ZipWriter::new(container.reopen().unwrap());
        writer.finish().unwrap();

        assert!(matches!(
            ByteView::open_evidence(container.path()),
            Err(EvidenceError::EmptyContainer)
        ));
    }
}
