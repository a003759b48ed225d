//! libpcap file emission.
//!
//! The writer emits the classic little-endian pcap format: magic
//! `D4 C3 B2 A1`, version 2.4, Ethernet link type, snap length `0xFFFF`.
//! Carved frames have no capture clock, so the carved index doubles as the
//! timestamp: seconds take the millions, microseconds the remainder. Frames
//! are written in ascending index order, stable for equal indices.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::frames::Frames;

/// Largest per-packet payload Wireshark accepts; longer frames are
/// truncated.
pub const SNAP_LENGTH: usize = 0xFFFF;

/// The 24-byte little-endian global header.
pub const GLOBAL_HEADER: [u8; 24] = [
    0xD4, 0xC3, 0xB2, 0xA1, // magic number
    0x02, 0x00, // major version
    0x04, 0x00, // minor version
    0x00, 0x00, 0x00, 0x00, // GMT to local correction
    0x00, 0x00, 0x00, 0x00, // timestamp accuracy
    0xFF, 0xFF, 0x00, 0x00, // snap length
    0x01, 0x00, 0x00, 0x00, // link type: Ethernet
];

impl Frames {
    /// Writes the collected frames as a pcap stream.
    pub fn write_pcap<W: Write>(&self, writer: W) -> io::Result<()> {
        let mut writer = BufWriter::new(writer);
        writer.write_all(&GLOBAL_HEADER)?;

        let mut ordered: Vec<&(u64, Vec<u8>)> = self.frames().iter().collect();
        ordered.sort_by_key(|(index, _)| *index);
        for (index, data) in ordered {
            let length = data.len().min(SNAP_LENGTH);
            writer.write_all(&((index / 1_000_000) as u32).to_le_bytes())?;
            writer.write_all(&((index % 1_000_000) as u32).to_le_bytes())?;
            writer.write_all(&(length as u32).to_le_bytes())?;
            writer.write_all(&(length as u32).to_le_bytes())?;
            writer.write_all(&data[..length])?;
        }
        writer.flush()
    }

    /// Writes the collected frames to a pcap file at `path`.
    pub fn write_pcap_file(&self, path: &Path) -> io::Result<()> {
        self.write_pcap(File::create(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_header() {
        let frames = Frames::new();
        let mut out = Vec::new();
        frames.write_pcap(&mut out).unwrap();
        assert_eq!(out, GLOBAL_HEADER);
    }

    #[test]
    fn test_packet_header_math() {
        let mut frames = Frames::new();
        frames.add_frame(1_500_000, b"\xAA\xBB\xCC", true, "");
        let mut out = Vec::new();
        frames.write_pcap(&mut out).unwrap();
        let record = &out[24..];
        assert_eq!(&record[0..4], &1u32.to_le_bytes()); // seconds
        assert_eq!(&record[4..8], &500_000u32.to_le_bytes()); // microseconds
        assert_eq!(&record[8..12], &3u32.to_le_bytes()); // captured length
        assert_eq!(&record[12..16], &3u32.to_le_bytes()); // original length
        assert_eq!(&record[16..], b"\xAA\xBB\xCC");
    }

    #[test]
    fn test_frames_ordered_by_index() {
        let mut frames = Frames::new();
        frames.add_frame(500, b"\x02\x02", true, "");
        frames.add_frame(100, b"\x01\x01", true, "");
        let mut out = Vec::new();
        frames.write_pcap(&mut out).unwrap();
        // first record carries index 100
        assert_eq!(&out[24 + 4..24 + 8], &100u32.to_le_bytes());
        assert_eq!(&out[24..28], &0u32.to_le_bytes());
    }
}
