//! The core dump region table.
//!
//! Region metadata sits behind a `DEAD1234` record: a version word
//! (`0x00000005`) and the load addresses of the `begin`, `text`, `data` and
//! `bss` regions. The heap is not listed; its start is found by scanning for
//! the first block-header magic at or after the `bss` address.

use scroll::Pread;
use thiserror::Error;

use relic_common::{find, magic};

/// Names of the recovered regions, in address order.
pub const REGION_NAMES: [&str; 5] = ["begin", "text", "data", "bss", "heap"];

/// An error aborting core dump parsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CoreDumpError {
    /// The `DEAD1234` region record is absent.
    #[error("magic sequence DEAD1234 not found")]
    RegionsMagicNotFound,
    /// The region record version is not the supported `0x00000005`.
    #[error("unexpected region record version {0:#010X}")]
    UnexpectedVersion(u32),
    /// No `AB1234CD` block header found at or after the `bss` address.
    #[error("magic sequence AB1234CD not found")]
    HeapMagicNotFound,
}

/// A single recovered memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    /// The region name (`begin`, `text`, `data`, `bss` or `heap`).
    pub name: &'static str,
    /// Start address in the router's address space.
    pub start: u32,
    /// Region length, `None` when the start falls outside the dump.
    pub len: Option<u32>,
    /// Offset of the region within the dump file, `None` when unknown.
    pub file_offset: Option<u32>,
}

/// A parsed core dump with its region table.
#[derive(Clone, Debug)]
pub struct CoreDump<'data> {
    data: &'data [u8],
    /// The base load address of the dump.
    pub address: u32,
    /// The recovered regions in address order.
    pub regions: Vec<Region>,
}

impl<'data> CoreDump<'data> {
    /// Parses the region table from raw core dump bytes.
    pub fn parse(data: &'data [u8]) -> Result<Self, CoreDumpError> {
        let record = find(data, magic::REGIONS, 0).ok_or(CoreDumpError::RegionsMagicNotFound)?;
        let version: u32 = data
            .pread_with(record + 4, scroll::BE)
            .map_err(|_: scroll::Error| CoreDumpError::RegionsMagicNotFound)?;
        if version != 0x0000_0005 {
            return Err(CoreDumpError::UnexpectedVersion(version));
        }
        let mut addresses = [0u32; 4];
        for (slot, address) in addresses.iter_mut().enumerate() {
            *address = data
                .pread_with(record + 20 + slot * 4, scroll::BE)
                .map_err(|_: scroll::Error| CoreDumpError::RegionsMagicNotFound)?;
        }
        let [begin, text, data_address, bss] = addresses;

        let heap_index = find(
            data,
            magic::BLOCK_BEGIN,
            (bss as usize).saturating_sub(begin as usize),
        )
        .ok_or(CoreDumpError::HeapMagicNotFound)?;

        let size = data.len() as u32;
        let end = begin.wrapping_add(size);
        // the trailing end entry only bounds the last region
        let starts: [(&'static str, u32); 6] = [
            ("begin", begin),
            ("text", text),
            ("data", data_address),
            ("bss", bss),
            ("heap", begin.wrapping_add(heap_index as u32)),
            ("end", end),
        ];
        let valid: Vec<usize> = (0..starts.len())
            .filter(|&index| {
                let address = starts[index].1;
                address >= begin && address <= end
            })
            .collect();

        let mut regions: Vec<Region> = starts
            .iter()
            .map(|&(name, start)| Region {
                name,
                start,
                len: None,
                file_offset: None,
            })
            .collect();
        for window in valid.windows(2) {
            let (this, next) = (window[0], window[1]);
            regions[this].len = Some(starts[next].1.wrapping_sub(starts[this].1));
            regions[this].file_offset = Some(starts[this].1.wrapping_sub(begin));
        }
        regions.pop();

        Ok(CoreDump {
            data,
            address: begin,
            regions,
        })
    }

    /// Looks up a region by name; returns its start address and bytes, the
    /// latter `None` when the region size is unknown.
    pub fn region(&self, name: &str) -> Option<(u32, Option<&'data [u8]>)> {
        let region = self
            .regions
            .iter()
            .find(|region| region.name.eq_ignore_ascii_case(name))?;
        let bytes = match (region.file_offset, region.len) {
            (Some(offset), Some(len)) => self
                .data
                .get(offset as usize..offset as usize + len as usize),
            _ => None,
        };
        Some((region.start, bytes))
    }

    /// The `text` region.
    pub fn region_text(&self) -> Option<(u32, Option<&'data [u8]>)> {
        self.region("text")
    }

    /// The `data` region.
    pub fn region_data(&self) -> Option<(u32, Option<&'data [u8]>)> {
        self.region("data")
    }

    /// The `bss` region.
    pub fn region_bss(&self) -> Option<(u32, Option<&'data [u8]>)> {
        self.region("bss")
    }

    /// The `heap` region.
    pub fn region_heap(&self) -> Option<(u32, Option<&'data [u8]>)> {
        self.region("heap")
    }

    /// The raw dump bytes.
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// Dereferences a NUL-terminated string in the router's address space,
    /// capped at 50 characters.
    ///
    /// Returns `None` for addresses outside the dump.
    pub fn get_string(&self, address: u32) -> Option<String> {
        let index = address.checked_sub(self.address)? as usize;
        if index >= self.data.len() {
            return None;
        }
        let mut string = String::new();
        let mut iter = 0;
        while index + iter < self.data.len() && self.data[index + iter] != 0 && iter < 50 {
            string.push(self.data[index + iter] as char);
            iter += 1;
        }
        Some(string)
    }

    /// Dereferences a big-endian 32-bit word in the router's address space.
    pub fn get_u32(&self, address: u32) -> Option<u32> {
        let index = address.checked_sub(self.address)? as usize;
        let bytes = self.data.get(index..index + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_magic() {
        assert_eq!(
            CoreDump::parse(&[0u8; 64]).err(),
            Some(CoreDumpError::RegionsMagicNotFound)
        );
    }

    #[test]
    fn test_bad_version() {
        let mut data = magic::REGIONS.to_vec();
        data.extend_from_slice(&[0, 0, 0, 7]);
        data.extend_from_slice(&[0u8; 32]);
        assert_eq!(
            CoreDump::parse(&data).err(),
            Some(CoreDumpError::UnexpectedVersion(7))
        );
    }
}
