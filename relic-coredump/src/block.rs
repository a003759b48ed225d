//! The allocator heap block chain.
//!
//! IOS heap memory is a run of blocks, each with a fixed-size header starting
//! with `AB1234CD`, explicit prev/next pointers, a combined size-and-freeflag
//! word and, for in-use blocks, a trailing `FD0110DF` canary. Two header
//! sizes exist in the wild (40 and 48 bytes); the size is decided once per
//! memory region by probing the second block.

use std::collections::HashMap;

use scroll::Pread;
use thiserror::Error;

use relic_common::magic;

use crate::region::CoreDump;

/// Column header matching [`MemoryBlock::render_line`].
pub const BLOCK_LISTING_HEADER: &str =
    "Address\t Bytes\t    PrevBlk  NextBlk  Ref PrevFree NextFree AllocPC  What";

/// Bytes of the free-chain record following the header of a free block.
const FREE_RECORD_SIZE: usize = 24;

/// An error parsing a single block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Not enough bytes remain for a block header.
    #[error("insufficient bytes for a block header")]
    Truncated,
    /// The header does not start with `AB1234CD`.
    #[error("block header magic AB1234CD not found")]
    BadMagic,
    /// A free block's chain record does not start with `DEADBEEF`.
    #[error("free block magic DEADBEEF not found")]
    BadFreeMagic,
}

/// An error aborting the heap walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum WalkError {
    /// The region does not begin with a valid block, or the probe for the
    /// second block failed under both known header sizes.
    #[error("memory region does not start with a recognizable block chain")]
    NoInitialChain,
    /// A block header along the chain is malformed.
    #[error("malformed block header at offset {offset:#X}")]
    BadBlock {
        /// Offset of the malformed header within the region.
        offset: usize,
        /// The underlying header error.
        source: BlockError,
    },
    /// A next-block pointer leads backwards or outside the region.
    #[error("broken chain pointer at offset {offset:#X}")]
    BrokenChain {
        /// Offset of the block with the broken pointer.
        offset: usize,
    },
}

/// A parsed heap block header.
#[derive(Clone, Debug)]
pub struct MemoryBlock {
    /// Offset of the block within its memory region.
    pub index: usize,
    /// Address of the block in the router's address space.
    pub address: u32,
    /// Header size in use for this region (40 or 48).
    pub header_size: usize,
    /// PID of the allocating process.
    pub pid: u32,
    /// Raw alloc-check word.
    pub alloc_check: u32,
    /// Address of the allocation name string.
    pub alloc_name: u32,
    /// The allocation name resolved from the core dump, when available.
    pub alloc_name_resolved: Option<String>,
    /// Program counter of the allocation site.
    pub alloc_pc: u32,
    /// Address of the next block, 0 for the last block.
    pub next_block: u32,
    /// Address of the previous block, 0 for the first block.
    pub prev_block: u32,
    /// Whether the block is on the free list.
    pub free: bool,
    /// Payload size in bytes.
    pub size: usize,
    /// Reference count.
    pub ref_count: u32,
    /// Raw last-free word.
    pub last_free: u32,
    /// Next block in the free chain, present only for free blocks.
    pub next_free: Option<u32>,
    /// Previous block in the free chain, present only for free blocks.
    pub prev_free: Option<u32>,
}

impl MemoryBlock {
    fn parse(
        data: &[u8],
        header_size: usize,
        index: usize,
        base_address: u32,
    ) -> Result<Self, BlockError> {
        if data.len() < header_size {
            return Err(BlockError::Truncated);
        }
        let word = |slot: usize| -> u32 {
            data.pread_with(slot * 4, scroll::BE).unwrap_or(0)
        };
        if word(0) != magic::BLOCK_BEGIN_WORD {
            return Err(BlockError::BadMagic);
        }
        let (free, size) = parse_size_field(word(7));
        // the stored prev pointer is biased by 0x14; anything landing below
        // the region base (notably the first block's zero) clamps to 0
        let prev_raw = word(6) as i64 - 0x14;
        let prev_block = if prev_raw < base_address as i64 {
            0
        } else {
            prev_raw as u32
        };

        let mut block = MemoryBlock {
            index,
            address: base_address.wrapping_add(index as u32),
            header_size,
            pid: word(1),
            alloc_check: word(2),
            alloc_name: word(3),
            alloc_name_resolved: None,
            alloc_pc: word(4),
            next_block: word(5),
            prev_block,
            free,
            size,
            ref_count: word(8),
            last_free: word(9),
            next_free: None,
            prev_free: None,
        };
        if free {
            if data.len() < header_size + FREE_RECORD_SIZE {
                return Err(BlockError::Truncated);
            }
            let free_word =
                |slot: usize| -> u32 { data.pread_with(header_size + slot * 4, scroll::BE).unwrap_or(0) };
            if free_word(0) != magic::BLOCK_FREE_WORD {
                return Err(BlockError::BadFreeMagic);
            }
            block.next_free = Some(if free_word(4) >= base_address {
                free_word(4).wrapping_sub(header_size as u32)
            } else {
                0
            });
            block.prev_free = Some(if free_word(5) >= base_address {
                free_word(5).wrapping_sub(header_size as u32 + 0x10)
            } else {
                0
            });
        }
        Ok(block)
    }

    /// Address of the block payload.
    pub fn data_address(&self) -> u32 {
        self.address.wrapping_add(self.header_size as u32)
    }

    /// Renders the block as one heap-listing line.
    pub fn render_line(&self) -> String {
        let alloc_name = match self.alloc_name_resolved.as_deref() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => format!("{:08X}", self.alloc_name),
        };
        let free_link = |link: Option<u32>| match link {
            Some(value) => format!("{:->8}", format!("{value:X}")),
            None => "--------".to_owned(),
        };
        format!(
            "{:08X} {:010} {:08X} {:08X} {:03} {} {} {:08X} {}",
            self.address,
            self.size,
            self.prev_block,
            self.next_block,
            self.ref_count,
            free_link(self.prev_free),
            free_link(self.next_free),
            self.alloc_pc,
            alloc_name
        )
    }
}

/// Splits the combined size word into the free flag and the payload size.
///
/// The low 31 bits count 16-bit units; the sign bit is the allocation state.
fn parse_size_field(value: u32) -> (bool, usize) {
    let free = value & 0x8000_0000 == 0;
    let size = ((value & 0x7FFF_FFFF) as usize) * 2;
    (free, size)
}

/// The parsed block chain of one memory region.
///
/// Works for the heap region of a core dump as well as for standalone IOMEM
/// captures; the base address of the region is recovered from the chain
/// itself. Blocks never point back at the region; payload access goes
/// through [`MemoryBlocks::block_data`].
#[derive(Clone, Debug)]
pub struct MemoryBlocks<'data> {
    memory: &'data [u8],
    /// The header size decided for this region (40 or 48).
    pub header_size: usize,
    /// The base address of the region, when the probe succeeded.
    pub base_address: Option<u32>,
    /// The walked chain in address order.
    pub blocks: Vec<MemoryBlock>,
    /// Occurrences of each allocation-name address along the chain.
    pub name_counts: HashMap<u32, u32>,
    /// The error that stopped the walk early, if any.
    pub error: Option<WalkError>,
    by_data_address: HashMap<u32, usize>,
    resolved_names: HashMap<u32, Option<String>>,
}

impl<'data> MemoryBlocks<'data> {
    /// Walks the block chain of a memory region.
    pub fn parse(memory: &'data [u8]) -> Self {
        let mut blocks = MemoryBlocks {
            memory,
            header_size: 40,
            base_address: None,
            blocks: Vec::new(),
            name_counts: HashMap::new(),
            error: None,
            by_data_address: HashMap::new(),
            resolved_names: HashMap::new(),
        };
        if blocks.initial_checks() {
            blocks.extract_headers();
        } else {
            blocks.error = Some(WalkError::NoInitialChain);
        }
        blocks
    }

    /// Probes the first two blocks to decide the header size and recover the
    /// region base address.
    fn initial_checks(&mut self) -> bool {
        let first_magic = |offset: usize| {
            self.memory.get(offset..offset + 4) == Some(&magic::BLOCK_BEGIN[..])
        };
        if self.memory.len() < self.header_size || !first_magic(0) {
            return false;
        }
        let size_word: u32 = self.memory.pread_with(7 * 4, scroll::BE).unwrap_or(0);
        let (_, size) = parse_size_field(size_word);

        if !first_magic(self.header_size + size) {
            self.header_size = 48;
            if !first_magic(self.header_size + size) {
                return false;
            }
        }
        let probe = self.header_size + size;
        if self.memory.len() < probe + self.header_size {
            return false;
        }
        let prev_word: u32 = self.memory.pread_with(probe + 6 * 4, scroll::BE).unwrap_or(0);
        self.base_address = Some(prev_word.wrapping_sub(0x14));
        true
    }

    fn extract_headers(&mut self) {
        let base_address = match self.base_address {
            Some(base) => base,
            None => return,
        };
        let mut index = 0usize;
        loop {
            let end = (index + self.header_size + FREE_RECORD_SIZE).min(self.memory.len());
            let data = match self.memory.get(index..end) {
                Some(data) if !data.is_empty() => data,
                _ => return,
            };
            let block = match MemoryBlock::parse(data, self.header_size, index, base_address) {
                Ok(block) => block,
                Err(BlockError::Truncated) => return,
                Err(source) => {
                    tracing::warn!(offset = index, error = %source, "heap walk stopped");
                    self.error = Some(WalkError::BadBlock {
                        offset: index,
                        source,
                    });
                    return;
                }
            };
            let next_block = block.next_block;
            self.by_data_address
                .insert(block.data_address(), self.blocks.len());
            *self.name_counts.entry(block.alloc_name).or_insert(0) += 1;
            self.blocks.push(block);
            if next_block == 0 {
                return;
            }
            let next_index = match (next_block as usize).checked_sub(base_address as usize) {
                Some(next_index) if next_index > index => next_index,
                _ => {
                    self.error = Some(WalkError::BrokenChain { offset: index });
                    return;
                }
            };
            index = next_index;
        }
    }

    /// The block payload, excluding the trailing canary when present.
    pub fn block_data(&self, block: &MemoryBlock) -> &'data [u8] {
        let start = (block.index + block.header_size).min(self.memory.len());
        let end = (start + block.size).min(self.memory.len());
        let data = &self.memory[start..end];
        if data.len() >= 4 {
            let tail = &data[data.len() - 4..];
            if u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]) == magic::BLOCK_CANARY_WORD
            {
                return &data[..data.len() - 4];
            }
        }
        data
    }

    /// The raw block bytes, header and canary included.
    pub fn block_raw(&self, block: &MemoryBlock) -> &'data [u8] {
        let start = block.index.min(self.memory.len());
        let end = (block.index + block.header_size + block.size).min(self.memory.len());
        &self.memory[start..end]
    }

    /// Looks up a block by the address of its payload.
    pub fn block_by_data_address(&self, address: u32) -> Option<&MemoryBlock> {
        self.by_data_address
            .get(&address)
            .map(|&index| &self.blocks[index])
    }

    /// Resolves every distinct allocation-name address through the core dump
    /// and attaches the strings to the blocks.
    pub fn resolve_names(&mut self, core: &CoreDump<'_>) {
        for &address in self.name_counts.keys() {
            self.resolved_names
                .insert(address, core.get_string(address));
        }
        for block in &mut self.blocks {
            if let Some(resolved) = self.resolved_names.get(&block.alloc_name) {
                block.alloc_name_resolved = resolved.clone();
            }
        }
    }

    /// Iterates blocks whose resolved allocation name equals `name`.
    pub fn blocks_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MemoryBlock> {
        self.blocks
            .iter()
            .filter(move |block| block.alloc_name_resolved.as_deref() == Some(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_field() {
        // sign bit set: in use, low bits count 16-bit units
        assert_eq!(parse_size_field(0x8000_0010), (false, 32));
        assert_eq!(parse_size_field(0x0000_0010), (true, 32));
    }

    #[test]
    fn test_not_a_chain() {
        let blocks = MemoryBlocks::parse(&[0u8; 128]);
        assert_eq!(blocks.error, Some(WalkError::NoInitialChain));
        assert!(blocks.blocks.is_empty());
    }
}
