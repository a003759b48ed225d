//! The ELF dialect used by IOS firmware images.
//!
//! This is deliberately not a general ELF reader: IOS images are always
//! 32-bit big-endian with a 52-byte ELF header, exactly one 32-byte program
//! header and 40-byte section headers. Rebuilding an image requires emitting
//! those headers byte-exactly with patched offsets, so section headers keep a
//! view of their raw 40 bytes.

use scroll::Pread;
use thiserror::Error;

/// Size of the ELF header in bytes.
pub const ELF_HEADER_SIZE: usize = 52;
/// Size of a section header in bytes.
pub const SECTION_HEADER_SIZE: usize = 40;
/// Size of the program header in bytes.
pub const PROGRAM_HEADER_SIZE: usize = 32;

/// Section flag for executable instructions (`SHF_EXECINSTR`).
pub const SHF_EXECINSTR: u32 = 0x4;

/// Fallback section names for images without a string table.
///
/// Images built without `.shstrtab` still use a fixed section layout; the
/// name index then addresses this conventional table.
const FALLBACK_SECTION_NAMES: &[(u32, &str)] = &[
    (0, ""),
    (1, ".shstrtab"),
    (11, ".text"),
    (17, ".rodata"),
    (25, ".sdata2"),
    (33, ".data"),
    (39, ".sdata"),
    (46, ".sbss"),
    (52, ".bss"),
];

/// An error observed while parsing the ELF container.
///
/// The discriminant is the stable numeric error code reported by the image
/// scanner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ElfError {
    /// The buffer is shorter than the 52-byte ELF header.
    #[error("buffer too short for an ELF header")]
    Truncated = 1,
    /// The `\x7FELF` magic number is missing.
    #[error("ELF magic number not found")]
    BadMagic = 2,
    /// The class byte does not indicate a 32-bit ELF.
    #[error("not a 32-bit ELF")]
    Not32Bit = 3,
    /// The data byte does not indicate big-endian (MSB) encoding.
    #[error("not a big-endian ELF")]
    NotBigEndian = 4,
    /// The declared ELF header size is not 52.
    #[error("unexpected ELF header size")]
    HeaderSize = 5,
    /// The declared program header size is not 32.
    #[error("unexpected program header size")]
    ProgramHeaderSize = 6,
    /// The image does not declare exactly one program header.
    #[error("unexpected program header count")]
    ProgramHeaderCount = 7,
    /// The declared section header size is not 40.
    #[error("unexpected section header size")]
    SectionHeaderSize = 8,
    /// The section header table extends past the end of the buffer.
    #[error("section header table truncated")]
    SectionTableTruncated = 9,
}

impl ElfError {
    /// The stable numeric code of this error.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// A parsed section header with a view into the section's bytes.
#[derive(Clone, Debug)]
pub struct ElfSection<'data> {
    header: &'data [u8],
    /// Offset of the section name in the string table.
    pub name_index: u32,
    /// The resolved section name, empty when unresolvable.
    pub name: String,
    /// The section type word.
    pub section_type: u32,
    /// The section flags word.
    pub flags: u32,
    /// File offset of the section contents.
    pub offset: u32,
    /// Size of the section contents in bytes.
    pub size: u32,
    /// View of the section contents, empty when `offset + size` exceeds the
    /// image.
    pub data: &'data [u8],
}

impl<'data> ElfSection<'data> {
    fn parse(header: &'data [u8], image: &'data [u8]) -> Self {
        let name_index = read_u32(header, 0);
        let section_type = read_u32(header, 4);
        let flags = read_u32(header, 8);
        let offset = read_u32(header, 16);
        let size = read_u32(header, 20);
        let end = offset as usize + size as usize;
        let data = if end <= image.len() {
            &image[offset as usize..end]
        } else {
            &[]
        };
        ElfSection {
            header,
            name_index,
            name: String::new(),
            section_type,
            flags,
            offset,
            size,
            data,
        }
    }

    /// Returns the raw 40-byte section header.
    pub fn header(&self) -> &'data [u8] {
        self.header
    }

    /// Returns the section header with the file offset and size fields
    /// optionally replaced, for image rebuilding.
    pub fn header_with(&self, offset: Option<u32>, size: Option<u32>) -> Vec<u8> {
        let mut out = Vec::with_capacity(SECTION_HEADER_SIZE);
        out.extend_from_slice(&self.header[..16]);
        match offset {
            Some(offset) => out.extend_from_slice(&offset.to_be_bytes()),
            None => out.extend_from_slice(&self.header[16..20]),
        }
        match size {
            Some(size) => out.extend_from_slice(&size.to_be_bytes()),
            None => out.extend_from_slice(&self.header[20..24]),
        }
        out.extend_from_slice(&self.header[24..40]);
        out
    }
}

/// The parsed ELF container of an IOS image.
///
/// Parsing never fails; malformed headers set [`Elf::error`] and leave the
/// section list empty, mirroring how the rest of the suite degrades on
/// damaged evidence.
#[derive(Clone, Debug)]
pub struct Elf<'data> {
    data: &'data [u8],
    /// The entry point address.
    pub entry: u32,
    /// File offset of the program header.
    pub program_offset: u32,
    /// File offset of the section header table.
    pub section_offset: u32,
    /// The ELF flags word.
    pub flags: u32,
    /// Number of section headers.
    pub section_count: u16,
    /// Index of the section-name string table, 0 when absent.
    pub string_table_index: u16,
    /// The parsed section headers in file order.
    pub sections: Vec<ElfSection<'data>>,
    /// The first malformation observed, if any.
    pub error: Option<ElfError>,
}

impl<'data> Elf<'data> {
    /// Parses the buffer as an IOS ELF container.
    pub fn parse(data: &'data [u8]) -> Self {
        let mut elf = Elf {
            data,
            entry: 0,
            program_offset: 0,
            section_offset: 0,
            flags: 0,
            section_count: 0,
            string_table_index: 0,
            sections: Vec::new(),
            error: None,
        };
        elf.error = elf.parse_header().err();
        if elf.error.is_none() {
            elf.error = elf.parse_sections().err();
        }
        elf
    }

    fn parse_header(&mut self) -> Result<(), ElfError> {
        let data = self.data;
        if data.len() < ELF_HEADER_SIZE {
            return Err(ElfError::Truncated);
        }
        if &data[..4] != b"\x7FELF" {
            return Err(ElfError::BadMagic);
        }
        if data[4] != 1 {
            return Err(ElfError::Not32Bit);
        }
        if data[5] != 2 {
            return Err(ElfError::NotBigEndian);
        }
        self.entry = read_u32(data, 24);
        self.program_offset = read_u32(data, 28);
        self.section_offset = read_u32(data, 32);
        self.flags = read_u32(data, 36);
        if read_u16(data, 40) != ELF_HEADER_SIZE as u16 {
            return Err(ElfError::HeaderSize);
        }
        if read_u16(data, 42) != PROGRAM_HEADER_SIZE as u16 {
            return Err(ElfError::ProgramHeaderSize);
        }
        if read_u16(data, 44) != 1 {
            return Err(ElfError::ProgramHeaderCount);
        }
        if read_u16(data, 46) != SECTION_HEADER_SIZE as u16 {
            return Err(ElfError::SectionHeaderSize);
        }
        self.section_count = read_u16(data, 48);
        self.string_table_index = read_u16(data, 50);
        Ok(())
    }

    fn parse_sections(&mut self) -> Result<(), ElfError> {
        let table_start = self.section_offset as usize;
        let table_len = self.section_count as usize * SECTION_HEADER_SIZE;
        if self.data.len() < table_start + table_len {
            return Err(ElfError::SectionTableTruncated);
        }
        self.sections = (0..self.section_count as usize)
            .map(|index| {
                let start = table_start + index * SECTION_HEADER_SIZE;
                ElfSection::parse(&self.data[start..start + SECTION_HEADER_SIZE], self.data)
            })
            .collect();
        self.resolve_names();
        Ok(())
    }

    fn resolve_names(&mut self) {
        if self.string_table_index == 0 {
            for section in &mut self.sections {
                if let Some(&(_, name)) = FALLBACK_SECTION_NAMES
                    .iter()
                    .find(|&&(index, _)| index == section.name_index)
                {
                    section.name = name.to_owned();
                }
            }
        } else {
            let table_offset = match self.sections.get(self.string_table_index as usize) {
                Some(table) => table.offset,
                None => return,
            };
            for index in 0..self.sections.len() {
                let start = table_offset as usize + self.sections[index].name_index as usize;
                self.sections[index].name = c_string_at(self.data, start);
            }
        }
    }

    /// Returns the raw 52-byte ELF header.
    pub fn header(&self) -> &'data [u8] {
        &self.data[..ELF_HEADER_SIZE.min(self.data.len())]
    }

    /// Returns the program header with the image length patched in.
    ///
    /// The segment length lands at offset 16 and, offset by `0x10000`, at
    /// offset 20; the rest of the header is preserved.
    pub fn program_header(&self, length: u32) -> Vec<u8> {
        let start = self.program_offset as usize;
        let mut out = Vec::with_capacity(PROGRAM_HEADER_SIZE);
        out.extend_from_slice(slice_at(self.data, start, 16));
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&length.wrapping_add(0x10000).to_be_bytes());
        out.extend_from_slice(slice_at(self.data, start + 24, 8));
        out
    }
}

/// Reads a big-endian `u32`, returning 0 past the end of the buffer.
fn read_u32(data: &[u8], offset: usize) -> u32 {
    data.pread_with(offset, scroll::BE).unwrap_or(0)
}

/// Reads a big-endian `u16`, returning 0 past the end of the buffer.
fn read_u16(data: &[u8], offset: usize) -> u16 {
    data.pread_with(offset, scroll::BE).unwrap_or(0)
}

/// Returns up to `len` bytes at `start`, truncated at the buffer end.
fn slice_at(data: &[u8], start: usize, len: usize) -> &[u8] {
    let start = start.min(data.len());
    let end = (start + len).min(data.len());
    &data[start..end]
}

/// Reads a NUL-terminated string at `start`, stopping at the buffer end.
fn c_string_at(data: &[u8], start: usize) -> String {
    let mut result = String::new();
    let mut index = start;
    while index < data.len() && data[index] != 0 {
        result.push(data[index] as char);
        index += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert_eq!(Elf::parse(b"").error, Some(ElfError::Truncated));
    }

    #[test]
    fn test_not_elf() {
        let elf = Elf::parse(&[0u8; 64]);
        assert_eq!(elf.error, Some(ElfError::BadMagic));
        assert_eq!(elf.error.map(ElfError::code), Some(2));
    }

    #[test]
    fn test_section_header_size_enforced() {
        let mut data = vec![0u8; 52];
        data[..4].copy_from_slice(b"\x7FELF");
        data[4] = 1; // 32-bit
        data[5] = 2; // MSB
        data[40] = 0;
        data[41] = 52; // ELF header size
        data[42] = 0;
        data[43] = 32; // program header size
        data[44] = 0;
        data[45] = 1; // program header count
        // section header size left at 0
        let elf = Elf::parse(&data);
        assert_eq!(elf.error, Some(ElfError::SectionHeaderSize));
        assert_eq!(elf.error.map(ElfError::code), Some(8));
    }
}
