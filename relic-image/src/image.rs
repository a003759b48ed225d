//! The IOS firmware image aggregate.
//!
//! An [`IosImage`] classifies the sections of a parsed [`Elf`] by content,
//! validates the compressed payload's declared checksums, extracts the
//! uncompressed image from its ZIP container and recovers both the embedded
//! and the computed MD5 digest.

use std::io::{Cursor, Read, Write};

use md5::{Digest, Md5};
use thiserror::Error;

use relic_common::{find, magic};

use crate::cw::{contains_cw_region, CwStrings};
use crate::elf::{Elf, ElfSection, SECTION_HEADER_SIZE};

/// Section indices excluded from the computed image digest.
///
/// By the ELF layout convention of IOS images, index 3 is the SFX loader and
/// index 4 the compressed payload; the embedded digest covers neither.
const MD5_SKIPPED_SECTIONS: [usize; 2] = [3, 4];

/// An error observed while parsing an IOS image.
///
/// The discriminant is the stable numeric error code reported by the image
/// scanner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ImageError {
    /// The ELF container could not be parsed.
    #[error("ELF parsing failed")]
    Elf = 1,
    /// More than one section starts with `FEEDFACE`.
    #[error("more than one FEEDFACE section")]
    MultipleCompressed = 2,
    /// More than one section carries a `FADEFAD1` digest marker.
    #[error("more than one FADEFAD1 section")]
    MultipleEmbeddedMd5 = 3,
    /// No section starts with `FEEDFACE`.
    #[error("MAGIC number FEEDFACE not found")]
    CompressedMissing = 4,
    /// The compressed payload is not a readable ZIP archive.
    #[error("error parsing ZIP section")]
    ZipParse = 5,
    /// The ZIP directory could not be enumerated.
    #[error("error retrieving ZIP namelist")]
    ZipNamelist = 6,
    /// The ZIP archive contains no file.
    #[error("no file found in ZIP")]
    ZipEmpty = 7,
    /// The ZIP archive contains more than one file.
    #[error("more than one file found in ZIP")]
    ZipMultiple = 8,
    /// The single ZIP entry failed to decompress.
    #[error("error decompressing ZIP section")]
    ZipExtract = 9,
    /// More than one section contains a CW_ strings region.
    #[error("more than one CW_ strings section")]
    MultipleCwStrings = 10,
}

impl ImageError {
    /// The stable numeric code of this error.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// A parsed IOS firmware image.
#[derive(Debug)]
pub struct IosImage<'data> {
    /// The underlying ELF container.
    pub elf: Elf<'data>,
    compressed_index: Option<usize>,
    embedded_md5_index: Option<usize>,
    cw_index: Option<usize>,
    /// Declared size of the uncompressed image.
    pub size_uncompressed: Option<u32>,
    /// Declared size of the compressed payload.
    pub size_compressed: Option<u32>,
    /// Declared checksum of the compressed payload.
    pub checksum_compressed: Option<u32>,
    /// Declared checksum of the uncompressed image.
    pub checksum_uncompressed: Option<u32>,
    /// Checksum computed over the compressed payload.
    pub calculated_checksum_compressed: Option<u32>,
    /// Checksum computed over the extracted image.
    pub calculated_checksum_uncompressed: Option<u32>,
    /// The extracted uncompressed image.
    pub image_uncompressed: Option<Vec<u8>>,
    /// Name of the single file inside the ZIP payload.
    pub image_uncompressed_name: Option<String>,
    /// The embedded MD5 digest as lowercase hex.
    pub embedded_md5: Option<String>,
    /// MD5 computed over all sections except the SFX loader and payload.
    pub calculated_md5: Option<String>,
    /// The recovered CW_ string table, when a CW_ section exists.
    pub cw_strings: Option<CwStrings>,
    /// The last anomaly observed, if any.
    pub error: Option<ImageError>,
}

impl<'data> IosImage<'data> {
    /// Parses an IOS image from raw file bytes.
    ///
    /// Anomalies are recorded in [`IosImage::error`]; fields recovered before
    /// the anomaly stay available.
    pub fn parse(data: &'data [u8]) -> Self {
        let mut image = IosImage {
            elf: Elf::parse(data),
            compressed_index: None,
            embedded_md5_index: None,
            cw_index: None,
            size_uncompressed: None,
            size_compressed: None,
            checksum_compressed: None,
            checksum_uncompressed: None,
            calculated_checksum_compressed: None,
            calculated_checksum_uncompressed: None,
            image_uncompressed: None,
            image_uncompressed_name: None,
            embedded_md5: None,
            calculated_md5: None,
            cw_strings: None,
            error: None,
        };
        if image.elf.error.is_some() {
            image.error = Some(ImageError::Elf);
            return image;
        }
        image.classify_sections();
        if let Some(data) = image.embedded_md5_section().map(|section| section.data) {
            image.embedded_md5 = extract_embedded_md5(data);
        }
        if let Some(data) = image.cw_section().map(|section| section.data) {
            image.cw_strings = Some(CwStrings::parse(data));
        }
        image.calculated_md5 = Some(image.section_md5());
        image.extract_payload();
        image
    }

    fn classify_sections(&mut self) {
        for (index, section) in self.elf.sections.iter().enumerate() {
            if section.data.get(..4) == Some(&magic::FEEDFACE[..]) {
                if self.compressed_index.is_some() {
                    tracing::warn!("more than one FEEDFACE section");
                    self.error = Some(ImageError::MultipleCompressed);
                } else {
                    self.compressed_index = Some(index);
                }
            } else if find(section.data, magic::FADEFAD1, 0).is_some() {
                if self.embedded_md5_index.is_some() {
                    tracing::warn!("more than one FADEFAD1 section");
                    self.error = Some(ImageError::MultipleEmbeddedMd5);
                } else {
                    self.embedded_md5_index = Some(index);
                }
            } else if contains_cw_region(section.data) {
                if self.cw_index.is_some() {
                    tracing::warn!("more than one CW_ strings section");
                    self.error = Some(ImageError::MultipleCwStrings);
                } else {
                    self.cw_index = Some(index);
                }
            }
        }
    }

    fn section_md5(&self) -> String {
        let mut md5 = Md5::new();
        for (index, section) in self.elf.sections.iter().enumerate() {
            if !MD5_SKIPPED_SECTIONS.contains(&index) {
                md5.update(section.data);
            }
        }
        hex(&md5.finalize())
    }

    fn extract_payload(&mut self) {
        let data = match self.compressed_section().map(|section| section.data) {
            Some(data) => data,
            None => {
                self.error = Some(ImageError::CompressedMissing);
                return;
            }
        };
        if data.len() < magic::FEEDFACE.len() + 16 {
            self.error = Some(ImageError::CompressedMissing);
            return;
        }
        let words = &data[magic::FEEDFACE.len()..];
        self.size_uncompressed = Some(u32::from_be_bytes([words[0], words[1], words[2], words[3]]));
        self.size_compressed = Some(u32::from_be_bytes([words[4], words[5], words[6], words[7]]));
        self.checksum_compressed =
            Some(u32::from_be_bytes([words[8], words[9], words[10], words[11]]));
        self.checksum_uncompressed =
            Some(u32::from_be_bytes([words[12], words[13], words[14], words[15]]));

        let payload = &words[16..];
        let end = (self.size_compressed.unwrap_or(0) as usize).min(payload.len());
        let zip_data = &payload[..end];
        self.calculated_checksum_compressed = Some(calc_checksum(zip_data));

        let mut archive = match zip::ZipArchive::new(Cursor::new(zip_data)) {
            Ok(archive) => archive,
            Err(_) => {
                tracing::warn!("error parsing ZIP section");
                self.error = Some(ImageError::ZipParse);
                return;
            }
        };
        match archive.len() {
            0 => {
                tracing::warn!("no file found in ZIP");
                self.error = Some(ImageError::ZipEmpty);
                return;
            }
            1 => {}
            count => {
                tracing::warn!(count, "more than one file found in ZIP");
                self.error = Some(ImageError::ZipMultiple);
                return;
            }
        }
        let mut file = match archive.by_index(0) {
            Ok(file) => file,
            Err(_) => {
                tracing::warn!("error retrieving ZIP namelist");
                self.error = Some(ImageError::ZipNamelist);
                return;
            }
        };
        self.image_uncompressed_name = Some(file.name().to_owned());
        let mut uncompressed = Vec::new();
        if file.read_to_end(&mut uncompressed).is_err() {
            tracing::warn!("error decompressing ZIP section");
            self.error = Some(ImageError::ZipExtract);
            return;
        }
        self.calculated_checksum_uncompressed = Some(calc_checksum(&uncompressed));
        self.image_uncompressed = Some(uncompressed);
    }

    /// The section holding the `FEEDFACE` payload.
    pub fn compressed_section(&self) -> Option<&ElfSection<'data>> {
        self.compressed_index.and_then(|i| self.elf.sections.get(i))
    }

    /// The section carrying the embedded MD5 digest.
    pub fn embedded_md5_section(&self) -> Option<&ElfSection<'data>> {
        self.embedded_md5_index
            .and_then(|i| self.elf.sections.get(i))
    }

    /// The section holding the CW_ strings region.
    pub fn cw_section(&self) -> Option<&ElfSection<'data>> {
        self.cw_index.and_then(|i| self.elf.sections.get(i))
    }

    /// Builds a `FEEDFACE` payload for `image_uncompressed` with freshly
    /// computed sizes and checksums.
    pub fn compress(name: &str, image_uncompressed: &[u8]) -> Result<Vec<u8>, ImageError> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        writer
            .start_file(name, options)
            .and_then(|()| writer.write_all(image_uncompressed).map_err(Into::into))
            .map_err(|_| ImageError::ZipParse)?;
        let zip_data = writer
            .finish()
            .map_err(|_| ImageError::ZipParse)?
            .into_inner();

        let mut result = Vec::with_capacity(magic::FEEDFACE.len() + 16 + zip_data.len());
        result.extend_from_slice(magic::FEEDFACE);
        result.extend_from_slice(&(image_uncompressed.len() as u32).to_be_bytes());
        result.extend_from_slice(&(zip_data.len() as u32).to_be_bytes());
        result.extend_from_slice(&calc_checksum(&zip_data).to_be_bytes());
        result.extend_from_slice(&calc_checksum(image_uncompressed).to_be_bytes());
        result.extend_from_slice(&zip_data);
        Ok(result)
    }

    /// Rebuilds a complete IOS image around a replacement uncompressed
    /// payload.
    ///
    /// Supports the 6- and 7-section layouts used by IOS: the leading
    /// sections form the SFX loader, the second-to-last section header is
    /// repointed past the new payload and the last one at it. Returns `None`
    /// for any other layout.
    pub fn pack(&self, name: &str, image_uncompressed: &[u8]) -> Option<Vec<u8>> {
        let count = self.elf.sections.len();
        if count != 6 && count != 7 {
            return None;
        }
        let sfx_count = count - 2;
        let tail = &self.elf.sections[sfx_count];
        let payload_header = &self.elf.sections[sfx_count + 1];

        let sfx_len: usize = self.elf.sections[..sfx_count]
            .iter()
            .map(|section| section.data.len())
            .sum();
        let compressed = Self::compress(name, image_uncompressed).ok()?;

        let mut image = Vec::new();
        image.extend_from_slice(self.elf.header());
        image.extend_from_slice(&self.elf.program_header(
            (sfx_len + compressed.len() + tail.data.len()) as u32,
        ));
        for section in &self.elf.sections[..sfx_count] {
            image.extend_from_slice(section.header());
        }
        let headers_len = image.len() + 2 * SECTION_HEADER_SIZE;
        image.extend_from_slice(&tail.header_with(
            Some((headers_len + sfx_len + compressed.len()) as u32),
            Some(tail.data.len() as u32),
        ));
        image.extend_from_slice(&payload_header.header_with(
            Some((headers_len + sfx_len) as u32),
            Some(compressed.len() as u32),
        ));
        for section in &self.elf.sections[..sfx_count] {
            image.extend_from_slice(section.data);
        }
        image.extend_from_slice(&compressed);
        image.extend_from_slice(tail.data);
        Some(image)
    }

    /// Returns the uncompressed image patched for IDA Pro.
    ///
    /// Sets the ELF machine field to PowerPC (`0x14`) so the disassembler
    /// accepts the inner image.
    pub fn image_uncompressed_ida(&self) -> Option<Vec<u8>> {
        let image = self.image_uncompressed.as_ref()?;
        if image.len() < 20 {
            return None;
        }
        let mut patched = image.clone();
        patched[18] = 0x00;
        patched[19] = 0x14;
        Some(patched)
    }
}

/// The 32-bit section checksum used by IOS image wrappers.
///
/// Sums the data as big-endian words; whenever the running sum overflows 32
/// bits it is incremented before truncation. Trailing bytes that do not fill
/// a word are ignored.
pub fn calc_checksum(data: &[u8]) -> u32 {
    let mut sum: u64 = 0;
    for word in data.chunks_exact(4) {
        sum += u32::from_be_bytes([word[0], word[1], word[2], word[3]]) as u64;
        if sum > 0xFFFF_FFFF {
            sum = (sum + 1) & 0xFFFF_FFFF;
        }
    }
    sum as u32
}

/// Locates the `FADEFAD1` marker and renders the following 16-byte digest.
fn extract_embedded_md5(data: &[u8]) -> Option<String> {
    let index = find(data, magic::FADEFAD1, 0)?;
    let start = index + magic::FADEFAD1.len();
    data.get(start..start + 16).map(hex)
}

/// Renders bytes as lowercase hex.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_checksum_no_carry() {
        // 1 + 2, never overflows
        let data = [0, 0, 0, 1, 0, 0, 0, 2];
        assert_eq!(calc_checksum(&data), 3);
    }

    #[test]
    fn test_calc_checksum_carry() {
        // 0xFFFFFFFF + 2 overflows: (0x1_0000_0001 + 1) & 0xFFFFFFFF
        let data = [0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 2];
        assert_eq!(calc_checksum(&data), 2);
    }

    #[test]
    fn test_calc_checksum_ignores_remainder() {
        let data = [0, 0, 0, 5, 0xAB, 0xCD];
        assert_eq!(calc_checksum(&data), 5);
    }

    #[test]
    fn test_calc_checksum_associative_over_words() {
        let left = [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        let right = [0xFF, 0xFF, 0x00, 0x01];
        let mut whole = left.to_vec();
        whole.extend_from_slice(&right);
        let mut partial = calc_checksum(&left) as u64 + calc_checksum(&right) as u64;
        if partial > 0xFFFF_FFFF {
            partial = (partial + 1) & 0xFFFF_FFFF;
        }
        assert_eq!(calc_checksum(&whole), partial as u32);
    }

    #[test]
    fn test_embedded_md5() {
        let mut data = b"pad".to_vec();
        data.extend_from_slice(magic::FADEFAD1);
        data.extend_from_slice(&[0xAB; 16]);
        assert_eq!(
            extract_embedded_md5(&data).as_deref(),
            Some("abababababababababababababababab")
        );
    }

    #[test]
    fn test_embedded_md5_truncated() {
        let mut data = magic::FADEFAD1.to_vec();
        data.extend_from_slice(&[0xAB; 15]);
        assert_eq!(extract_embedded_md5(&data), None);
    }
}
