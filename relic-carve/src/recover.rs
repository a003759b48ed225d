//! Heap-driven frame recovery from IOMEM captures.
//!
//! Heap blocks allocated as `*Packet Header*` describe frames that lived in
//! the router's I/O memory. The payload carries the frame address at offset
//! 40 and the frame size at offset 72 (falling back to offset 68 when that
//! field is degenerate); the bytes themselves sit in the IOMEM capture,
//! addressed from the base the IOMEM block chain reveals.

use thiserror::Error;

use relic_coredump::MemoryBlocks;

use crate::frames::Frames;

/// An error preventing IOMEM frame recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RecoverError {
    /// The IOMEM capture does not expose a block chain with a base address.
    #[error("error parsing IOMEM")]
    IomemUnparseable,
}

/// Byte offset of the frame address within a `*Packet Header*` payload.
const FRAME_ADDRESS_OFFSET: usize = 40;
/// Byte offset of the frame size.
const FRAME_SIZE_OFFSET: usize = 72;
/// Fallback size offset used when the primary size is 0 or 1.
const FRAME_SIZE_FALLBACK_OFFSET: usize = 68;

/// A frame recovered from IOMEM, for caller-side reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredFrame {
    /// Address of the frame in the router's address space.
    pub address: u32,
    /// Offset of the frame within the IOMEM capture.
    pub index: u64,
    /// Size of the frame in bytes.
    pub size: usize,
}

/// Follows `*Packet Header*` blocks of a resolved heap into `iomem`, adding
/// every referenced frame to `frames`.
///
/// Returns descriptions of the recovered frames in heap order.
pub fn recover_iomem_frames(
    heap: &MemoryBlocks<'_>,
    iomem: &[u8],
    frames: &mut Frames,
) -> Result<Vec<RecoveredFrame>, RecoverError> {
    let iomem_chain = MemoryBlocks::parse(iomem);
    let iomem_base = iomem_chain
        .base_address
        .ok_or(RecoverError::IomemUnparseable)?;

    let mut recovered = Vec::new();
    for block in heap.blocks_named("*Packet Header*") {
        let payload = heap.block_data(block);
        let read_u16 = |offset: usize| -> u16 {
            match payload.get(offset..offset + 2) {
                Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
                None => 0,
            }
        };
        let frame_address = match payload.get(FRAME_ADDRESS_OFFSET..FRAME_ADDRESS_OFFSET + 4) {
            Some(bytes) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => continue,
        };
        let mut frame_size = read_u16(FRAME_SIZE_OFFSET);
        if frame_size <= 1 {
            frame_size = read_u16(FRAME_SIZE_FALLBACK_OFFSET);
        }
        if frame_address == 0 || frame_size == 0 {
            continue;
        }
        let start = match frame_address.checked_sub(iomem_base) {
            Some(start) => start as usize,
            None => {
                tracing::warn!(frame_address, "frame address below IOMEM base");
                continue;
            }
        };
        let end = (start + frame_size as usize).min(iomem.len());
        let data = match iomem.get(start..end) {
            Some(data) if !data.is_empty() => data,
            _ => continue,
        };
        frames.add_frame(start as u64, data, true, "");
        recovered.push(RecoveredFrame {
            address: frame_address,
            index: start as u64,
            size: data.len(),
        });
    }
    Ok(recovered)
}
