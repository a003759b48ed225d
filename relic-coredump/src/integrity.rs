//! Heap and text-section cross-validation.
//!
//! The heap checks follow the classic IOS allocator invariants: every block
//! starts with `AB1234CD`, every referenced in-use block ends with the
//! `FD0110DF` canary, and the prev/next chain is closed except at its two
//! ends. The text check compares the dump's `text` region against the single
//! executable section of a paired firmware image.

use thiserror::Error;

use relic_common::magic;
use relic_image::{Elf, ElfError, IosImage, SHF_EXECINSTR};

use crate::block::MemoryBlocks;
use crate::region::CoreDump;

/// Indices of blocks violating each heap invariant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Blocks whose first 4 bytes are not `AB1234CD`.
    pub start_magic: Vec<usize>,
    /// Referenced in-use blocks not ending with `FD0110DF`.
    pub end_magic: Vec<usize>,
    /// Blocks after the first with a zero prev pointer.
    pub prev_block: Vec<usize>,
    /// Blocks before the last with a zero next pointer.
    pub next_block: Vec<usize>,
}

impl IntegrityReport {
    /// Whether all four checks passed.
    pub fn is_ok(&self) -> bool {
        self.start_magic.is_empty()
            && self.end_magic.is_empty()
            && self.prev_block.is_empty()
            && self.next_block.is_empty()
    }
}

/// Runs the four heap-chain checks over a walked block chain.
pub fn check_heap(heap: &MemoryBlocks<'_>) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    let count = heap.blocks.len();
    for (index, block) in heap.blocks.iter().enumerate() {
        let raw = heap.block_raw(block);
        if raw.get(..4) != Some(&magic::BLOCK_BEGIN[..]) {
            report.start_magic.push(index);
        }
        if block.ref_count > 0 {
            let canary = raw.len() >= 4 && {
                let tail = &raw[raw.len() - 4..];
                u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]])
                    == magic::BLOCK_CANARY_WORD
            };
            if !canary {
                report.end_magic.push(index);
            }
        }
        if index > 0 && block.prev_block == 0 {
            report.prev_block.push(index);
        }
        if index + 1 < count && block.next_block == 0 {
            report.next_block.push(index);
        }
    }
    report
}

/// Outcome of comparing CW_SYSDESCR between a dump and an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SysdescrComparison {
    /// Neither side carries a CW_SYSDESCR.
    Absent,
    /// Both sides carry the same descriptor.
    Identical(String),
    /// The descriptors differ only in the `-MZ` vs `-M` image designation.
    Equivalent(String),
    /// The descriptors differ.
    Different {
        /// Descriptor recovered from the core dump.
        core: String,
        /// Descriptor recovered from the image.
        image: String,
    },
}

/// Result of the text-section comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextCheckReport {
    /// Length of the dump's text region in bytes.
    pub core_len: usize,
    /// Length of the compared image slice in bytes.
    pub image_len: usize,
    /// Number of bytes compared (the shorter of the two).
    pub compared: usize,
    /// Number of differing bytes.
    pub different: usize,
    /// Core dump address of the first differing byte, if any.
    pub first_difference: Option<u32>,
}

impl TextCheckReport {
    /// Whether the compared ranges are identical.
    pub fn is_identical(&self) -> bool {
        self.different == 0
    }
}

/// An error preventing the text comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TextCheckError {
    /// The dump's text region has no recoverable bytes.
    #[error("error extracting text region from coredump")]
    TextRegionMissing,
    /// The image failed to parse or carries no uncompressed payload.
    #[error("image is not usable for text comparison")]
    ImageUnusable,
    /// The uncompressed inner image is not a parseable ELF.
    #[error("ELF parsing error {}", .0.code())]
    InnerElf(ElfError),
    /// The inner image does not have exactly one executable section.
    #[error("found {0} executable sections in image, expected 1")]
    ExecutableSections(usize),
    /// The inner image carries relocation data the comparison cannot handle.
    #[error("found {0} sreloc sections in image")]
    SrelocPresent(usize),
}

/// Compares CW_SYSDESCR between the dump's data region and the image.
///
/// This comparison never fails; either side may simply have nothing to
/// offer. It is reported before the text comparison, which can still abort
/// on a damaged image.
pub fn check_sysdescr(core: &CoreDump<'_>, image: &IosImage<'_>) -> SysdescrComparison {
    let sysdescr_core = core
        .region_data()
        .and_then(|(_, bytes)| bytes)
        .and_then(|bytes| {
            let strings = relic_image::CwStrings::parse(bytes);
            if strings.error.is_none() {
                strings.get_str(b"CW_SYSDESCR")
            } else {
                None
            }
        })
        .unwrap_or_default();
    let sysdescr_image = image
        .cw_strings
        .as_ref()
        .filter(|strings| strings.error.is_none())
        .and_then(|strings| strings.get_str(b"CW_SYSDESCR"))
        .unwrap_or_default();
    compare_sysdescr(&sysdescr_core, &sysdescr_image)
}

/// Compares the dump's `text` region against the executable section of the
/// image's uncompressed payload.
///
/// The comparison starts `text_address & 0xFF` bytes into the section data;
/// the offset is an empirical property of how IOS loads its text.
pub fn check_text(core: &CoreDump<'_>, image: &IosImage<'_>) -> Result<TextCheckReport, TextCheckError> {
    let (text_address, text_core) = match core.region_text() {
        Some((address, Some(bytes))) => (address, bytes),
        _ => return Err(TextCheckError::TextRegionMissing),
    };

    let inner = match image.image_uncompressed.as_deref() {
        Some(inner) if image.error.is_none() => inner,
        _ => return Err(TextCheckError::ImageUnusable),
    };
    let elf = Elf::parse(inner);
    if let Some(error) = elf.error {
        return Err(TextCheckError::InnerElf(error));
    }
    let executable: Vec<_> = elf
        .sections
        .iter()
        .filter(|section| section.flags & SHF_EXECINSTR != 0)
        .collect();
    if executable.len() != 1 {
        return Err(TextCheckError::ExecutableSections(executable.len()));
    }
    let sreloc = elf
        .sections
        .iter()
        .filter(|section| section.name == "sreloc")
        .count();
    if sreloc != 0 {
        return Err(TextCheckError::SrelocPresent(sreloc));
    }

    let section = executable[0].data;
    let start = (text_address & 0xFF) as usize; // to be further researched
    let end = (start + text_core.len()).min(section.len());
    let text_image = section.get(start..end).unwrap_or_default();

    let compared = text_core.len().min(text_image.len());
    let mut different = 0;
    let mut first_difference = None;
    for index in 0..compared {
        if text_core[index] != text_image[index] {
            if different == 0 {
                first_difference = Some(text_address.wrapping_add(index as u32));
            }
            different += 1;
        }
    }

    Ok(TextCheckReport {
        core_len: text_core.len(),
        image_len: text_image.len(),
        compared,
        different,
        first_difference,
    })
}

fn compare_sysdescr(core: &str, image: &str) -> SysdescrComparison {
    if core.is_empty() && image.is_empty() {
        SysdescrComparison::Absent
    } else if core == image {
        SysdescrComparison::Identical(core.to_owned())
    } else if core == image.replacen("-MZ", "-M", 1) {
        SysdescrComparison::Equivalent(core.to_owned())
    } else {
        SysdescrComparison::Different {
            core: core.to_owned(),
            image: image.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysdescr_equivalent() {
        let core = "Cisco IOS (tm) C2600 Software (C2600-I-M)";
        let image = "Cisco IOS (tm) C2600 Software (C2600-I-MZ)";
        assert_eq!(
            compare_sysdescr(core, image),
            SysdescrComparison::Equivalent(core.to_owned())
        );
    }

    #[test]
    fn test_sysdescr_absent() {
        assert_eq!(compare_sysdescr("", ""), SysdescrComparison::Absent);
    }

    #[test]
    fn test_sysdescr_different() {
        assert!(matches!(
            compare_sysdescr("a", "b"),
            SysdescrComparison::Different { .. }
        ));
    }
}
