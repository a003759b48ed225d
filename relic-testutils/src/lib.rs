//! Synthetic fixture builders for the relic test suites.
//!
//! Real IOS images and core dumps cannot be committed as fixtures, so the
//! integration tests synthesize the byte-level structures instead: minimal
//! ELF containers with `FEEDFACE`/`FADEFAD1`/CW_ sections, and core dumps
//! with a region record, a block-chained heap and process arrays.

use std::io::{Cursor, Write};

/// Base load address used by the core dump builders.
pub const DEFAULT_BASE_ADDRESS: u32 = 0x6000_0000;

const ELF_HEADER_SIZE: usize = 52;
const PROGRAM_HEADER_SIZE: usize = 32;
const SECTION_HEADER_SIZE: usize = 40;
const BLOCK_HEADER_SIZE: usize = 40;
const BLOCK_CANARY: u32 = 0xFD01_10DF;
const BLOCK_BEGIN: u32 = 0xAB12_34CD;
const BLOCK_FREE: u32 = 0xDEAD_BEEF;

/// The 4-byte-word checksum IOS wraps its payloads with.
pub fn checksum(data: &[u8]) -> u32 {
    let mut sum: u64 = 0;
    for word in data.chunks_exact(4) {
        sum += u32::from_be_bytes([word[0], word[1], word[2], word[3]]) as u64;
        if sum > 0xFFFF_FFFF {
            sum = (sum + 1) & 0xFFFF_FFFF;
        }
    }
    sum as u32
}

/// Builds a deflate ZIP archive holding a single file.
pub fn zip_single(name: &str, payload: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    writer.start_file(name, options).expect("zip fixture");
    writer.write_all(payload).expect("zip fixture");
    writer.finish().expect("zip fixture").into_inner()
}

/// Builds a `FEEDFACE` payload section: magic, four length/checksum words
/// and the ZIP archive.
pub fn feedface_section(name: &str, payload: &[u8]) -> Vec<u8> {
    let zip_data = zip_single(name, payload);
    let mut section = Vec::new();
    section.extend_from_slice(b"\xFE\xED\xFA\xCE");
    section.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    section.extend_from_slice(&(zip_data.len() as u32).to_be_bytes());
    section.extend_from_slice(&checksum(&zip_data).to_be_bytes());
    section.extend_from_slice(&checksum(payload).to_be_bytes());
    section.extend_from_slice(&zip_data);
    section
}

/// Builds a `FADEFAD1` section embedding the given digest.
pub fn embedded_md5_section(digest: &[u8; 16]) -> Vec<u8> {
    let mut section = Vec::new();
    section.extend_from_slice(b"\xFA\xDE\xFA\xD1\x00\x00\x00\x18");
    section.extend_from_slice(digest);
    section
}

struct SectionSpec {
    name_index: u32,
    section_type: u32,
    flags: u32,
    data: Vec<u8>,
}

/// Assembles a 32-bit big-endian ELF: header, one program header, section
/// headers, then the section data in the given order.
fn assemble_elf(entry: u32, sections: &[SectionSpec]) -> Vec<u8> {
    let section_offset = ELF_HEADER_SIZE + PROGRAM_HEADER_SIZE;
    let data_start = section_offset + sections.len() * SECTION_HEADER_SIZE;

    let mut elf = Vec::new();
    elf.extend_from_slice(b"\x7FELF");
    elf.push(1); // 32-bit
    elf.push(2); // MSB
    elf.push(1); // version
    elf.extend_from_slice(&[0u8; 9]);
    elf.extend_from_slice(&2u16.to_be_bytes()); // type: executable
    elf.extend_from_slice(&0x14u16.to_be_bytes()); // machine: PowerPC
    elf.extend_from_slice(&1u32.to_be_bytes()); // version
    elf.extend_from_slice(&entry.to_be_bytes());
    elf.extend_from_slice(&(ELF_HEADER_SIZE as u32).to_be_bytes()); // program header offset
    elf.extend_from_slice(&(section_offset as u32).to_be_bytes());
    elf.extend_from_slice(&0u32.to_be_bytes()); // flags
    elf.extend_from_slice(&(ELF_HEADER_SIZE as u16).to_be_bytes());
    elf.extend_from_slice(&(PROGRAM_HEADER_SIZE as u16).to_be_bytes());
    elf.extend_from_slice(&1u16.to_be_bytes());
    elf.extend_from_slice(&(SECTION_HEADER_SIZE as u16).to_be_bytes());
    elf.extend_from_slice(&(sections.len() as u16).to_be_bytes());
    elf.extend_from_slice(&0u16.to_be_bytes()); // no string table
    assert_eq!(elf.len(), ELF_HEADER_SIZE);

    // one program header covering the whole file
    let total_data: usize = sections.iter().map(|s| s.data.len()).sum();
    elf.extend_from_slice(&1u32.to_be_bytes()); // PT_LOAD
    elf.extend_from_slice(&(data_start as u32).to_be_bytes());
    elf.extend_from_slice(&entry.to_be_bytes());
    elf.extend_from_slice(&entry.to_be_bytes());
    elf.extend_from_slice(&(total_data as u32).to_be_bytes());
    elf.extend_from_slice(&(total_data as u32 + 0x10000).to_be_bytes());
    elf.extend_from_slice(&7u32.to_be_bytes()); // flags rwx
    elf.extend_from_slice(&4u32.to_be_bytes()); // alignment

    let mut offset = data_start;
    for section in sections {
        elf.extend_from_slice(&section.name_index.to_be_bytes());
        elf.extend_from_slice(&section.section_type.to_be_bytes());
        elf.extend_from_slice(&section.flags.to_be_bytes());
        elf.extend_from_slice(&0u32.to_be_bytes()); // address
        elf.extend_from_slice(&(offset as u32).to_be_bytes());
        elf.extend_from_slice(&(section.data.len() as u32).to_be_bytes());
        elf.extend_from_slice(&[0u8; 16]); // link, info, align, entsize
        offset += section.data.len();
    }
    for section in sections {
        elf.extend_from_slice(&section.data);
    }
    elf
}

/// Builds a minimal uncompressed inner image: an ELF with an empty leading
/// section and a single executable `.text` section holding `text`.
pub fn inner_elf(text: &[u8]) -> Vec<u8> {
    assemble_elf(
        0x8000_8000,
        &[
            SectionSpec {
                name_index: 0,
                section_type: 0,
                flags: 0,
                data: Vec::new(),
            },
            SectionSpec {
                name_index: 11, // ".text" in the fallback name table
                section_type: 1,
                flags: 0x4, // SHF_EXECINSTR
                data: text.to_vec(),
            },
        ],
    )
}

/// Builds a complete 6-section IOS image.
///
/// Sections 0..=3 form the SFX loader (section 1 carries the CW_ strings
/// region, section 2 the embedded digest), section 4 is the trailer and
/// section 5 the `FEEDFACE` payload holding `inner` as `inner_name`.
pub fn ios_image(
    cw_region: &[u8],
    digest: &[u8; 16],
    inner_name: &str,
    inner: &[u8],
) -> Vec<u8> {
    let mut image = assemble_elf(
        0x8000_F000,
        &[
            SectionSpec {
                name_index: 0,
                section_type: 1,
                flags: 0,
                data: b"boot loader filler".to_vec(),
            },
            SectionSpec {
                name_index: 17, // ".rodata"
                section_type: 1,
                flags: 0,
                data: cw_region.to_vec(),
            },
            SectionSpec {
                name_index: 33, // ".data"
                section_type: 1,
                flags: 0,
                data: embedded_md5_section(digest),
            },
            SectionSpec {
                name_index: 39, // ".sdata"
                section_type: 1,
                flags: 0,
                data: b"sfx tail".to_vec(),
            },
            SectionSpec {
                name_index: 46, // ".sbss"
                section_type: 1,
                flags: 0,
                data: b"image trailer".to_vec(),
            },
            SectionSpec {
                name_index: 52, // ".bss"
                section_type: 1,
                flags: 0,
                data: Vec::new(),
            },
        ],
    );
    // splice the payload into the last section, fixing its header and the
    // segment size in the program header
    let payload = feedface_section(inner_name, inner);
    let header_offset = ELF_HEADER_SIZE + PROGRAM_HEADER_SIZE + 5 * SECTION_HEADER_SIZE;
    let data_offset = image.len();
    image[header_offset + 16..header_offset + 20]
        .copy_from_slice(&(data_offset as u32).to_be_bytes());
    image[header_offset + 20..header_offset + 24]
        .copy_from_slice(&(payload.len() as u32).to_be_bytes());
    let old_size = u32::from_be_bytes([image[68], image[69], image[70], image[71]]);
    let new_size = old_size + payload.len() as u32;
    image[68..72].copy_from_slice(&new_size.to_be_bytes());
    image[72..76].copy_from_slice(&(new_size + 0x10000).to_be_bytes());
    image.extend_from_slice(&payload);
    image
}

/// One block of a synthetic allocator region.
struct BlockSpec {
    pid: u32,
    alloc_name: u32,
    alloc_pc: u32,
    ref_count: u32,
    free: bool,
    payload: Vec<u8>,
}

/// Builds raw memory for a chain of allocator blocks, parseable by the heap
/// walker. Addresses start at `address`.
pub struct HeapBuilder {
    address: u32,
    blocks: Vec<BlockSpec>,
    next_offset: usize,
}

impl HeapBuilder {
    /// Starts a heap whose first block lives at `address`.
    pub fn new(address: u32) -> Self {
        HeapBuilder {
            address,
            blocks: Vec::new(),
            next_offset: 0,
        }
    }

    /// The address the next added block will get.
    pub fn next_block_address(&self) -> u32 {
        self.address + self.next_offset as u32
    }

    /// Adds an in-use block; the canary is appended when `ref_count > 0`.
    /// Returns the address of the block payload.
    pub fn add_block(
        &mut self,
        alloc_name: u32,
        ref_count: u32,
        payload: &[u8],
    ) -> u32 {
        let mut stored = payload.to_vec();
        if stored.len() % 2 != 0 {
            stored.push(0);
        }
        if ref_count > 0 {
            stored.extend_from_slice(&BLOCK_CANARY.to_be_bytes());
        } else if stored.len() % 4 != 0 {
            while stored.len() % 4 != 0 {
                stored.push(0);
            }
        }
        self.push_block(BlockSpec {
            pid: 1,
            alloc_name,
            alloc_pc: 0x8001_2345,
            ref_count,
            free: false,
            payload: stored,
        })
    }

    /// Adds a free block of `payload_size` bytes carrying the free-chain
    /// record. Returns the address of the block payload.
    pub fn add_free_block(&mut self, alloc_name: u32, payload_size: usize) -> u32 {
        let mut payload = vec![0u8; payload_size.max(24)];
        if payload.len() % 2 != 0 {
            payload.push(0);
        }
        payload[..4].copy_from_slice(&BLOCK_FREE.to_be_bytes());
        self.push_block(BlockSpec {
            pid: 0,
            alloc_name,
            alloc_pc: 0,
            ref_count: 0,
            free: true,
            payload,
        })
    }

    fn push_block(&mut self, block: BlockSpec) -> u32 {
        let data_address = self.next_block_address() + BLOCK_HEADER_SIZE as u32;
        self.next_offset += BLOCK_HEADER_SIZE + block.payload.len();
        self.blocks.push(block);
        data_address
    }

    /// Serializes the chain.
    pub fn build(&self) -> Vec<u8> {
        let mut offsets = Vec::with_capacity(self.blocks.len());
        let mut offset = 0usize;
        for block in &self.blocks {
            offsets.push(offset);
            offset += BLOCK_HEADER_SIZE + block.payload.len();
        }

        let mut memory = Vec::with_capacity(offset);
        for (index, block) in self.blocks.iter().enumerate() {
            let next = if index + 1 < self.blocks.len() {
                self.address + offsets[index + 1] as u32
            } else {
                0
            };
            let prev = if index == 0 {
                0
            } else {
                self.address + offsets[index - 1] as u32 + 0x14
            };
            let size_units = (block.payload.len() / 2) as u32;
            let size_field = if block.free {
                size_units
            } else {
                size_units | 0x8000_0000
            };
            memory.extend_from_slice(&BLOCK_BEGIN.to_be_bytes());
            memory.extend_from_slice(&block.pid.to_be_bytes());
            memory.extend_from_slice(&0xB00F_B00Fu32.to_be_bytes()); // alloc check
            memory.extend_from_slice(&block.alloc_name.to_be_bytes());
            memory.extend_from_slice(&block.alloc_pc.to_be_bytes());
            memory.extend_from_slice(&next.to_be_bytes());
            memory.extend_from_slice(&prev.to_be_bytes());
            memory.extend_from_slice(&size_field.to_be_bytes());
            memory.extend_from_slice(&block.ref_count.to_be_bytes());
            memory.extend_from_slice(&0u32.to_be_bytes()); // last free
            memory.extend_from_slice(&block.payload);
        }
        memory
    }
}

/// Builds a complete synthetic core dump: region record, text, data, bss and
/// a block-chained heap.
pub struct CoreDumpBuilder {
    base: u32,
    text: Vec<u8>,
    text_cap: usize,
    data: Vec<u8>,
    data_cap: usize,
    bss_cap: usize,
    /// The heap chain; seeded at the computed heap address.
    pub heap: HeapBuilder,
}

const BEGIN_CAP: usize = 64;

impl CoreDumpBuilder {
    /// Starts a dump at the default base address with default region sizes.
    pub fn new() -> Self {
        Self::with_layout(DEFAULT_BASE_ADDRESS, 256, 512, 32)
    }

    /// Starts a dump with explicit text/data/bss region sizes.
    pub fn with_layout(base: u32, text_cap: usize, data_cap: usize, bss_cap: usize) -> Self {
        let heap_address = base + (BEGIN_CAP + text_cap + data_cap + bss_cap) as u32;
        CoreDumpBuilder {
            base,
            text: Vec::new(),
            text_cap,
            data: Vec::new(),
            data_cap,
            bss_cap,
            heap: HeapBuilder::new(heap_address),
        }
    }

    /// The dump's base load address.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// The address of the first heap block.
    pub fn heap_address(&self) -> u32 {
        self.heap.address
    }

    /// Fills the text region (truncated to the region size).
    pub fn set_text(&mut self, bytes: &[u8]) {
        self.text = bytes[..bytes.len().min(self.text_cap)].to_vec();
    }

    /// Appends a NUL-terminated string to the data region and returns its
    /// address.
    pub fn add_data_string(&mut self, string: &str) -> u32 {
        let address = self.base + (BEGIN_CAP + self.text_cap + self.data.len()) as u32;
        assert!(
            self.data.len() + string.len() + 1 <= self.data_cap,
            "data region overflow"
        );
        self.data.extend_from_slice(string.as_bytes());
        self.data.push(0);
        address
    }

    /// Serializes the dump.
    pub fn build(&self) -> Vec<u8> {
        let mut dump = Vec::new();
        // region record
        dump.extend_from_slice(b"\xDE\xAD\x12\x34");
        dump.extend_from_slice(&5u32.to_be_bytes());
        dump.extend_from_slice(&[0u8; 12]);
        dump.extend_from_slice(&self.base.to_be_bytes());
        dump.extend_from_slice(&(self.base + BEGIN_CAP as u32).to_be_bytes());
        dump.extend_from_slice(&(self.base + (BEGIN_CAP + self.text_cap) as u32).to_be_bytes());
        dump.extend_from_slice(
            &(self.base + (BEGIN_CAP + self.text_cap + self.data_cap) as u32).to_be_bytes(),
        );
        dump.resize(BEGIN_CAP, 0);

        dump.extend_from_slice(&self.text);
        dump.resize(BEGIN_CAP + self.text_cap, 0);
        dump.extend_from_slice(&self.data);
        dump.resize(BEGIN_CAP + self.text_cap + self.data_cap, 0);
        dump.resize(BEGIN_CAP + self.text_cap + self.data_cap + self.bss_cap, 0);
        dump.extend_from_slice(&self.heap.build());
        dump
    }
}

impl Default for CoreDumpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a process structure of `length` bytes (terminator included at
/// `length`), with the given 32-bit words planted at byte offsets.
pub fn process_structure(length: usize, fields: &[(usize, u32)]) -> Vec<u8> {
    let mut data = vec![0u8; length + 4];
    data[length..length + 4].copy_from_slice(b"\xBE\xEF\xCA\xFE");
    for &(offset, value) in fields {
        data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }
    data
}
