//! The per-session carving context.
//!
//! Carved frames are deduplicated two ways: by their (filename, index,
//! length) origin, so overlapping buffer reads never double-count, and by
//! SHA-1 of the bytes unless the caller asks to keep duplicates. An optional
//! OUI set restricts Ethernet frames to known vendor MAC prefixes.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;

use regex::Regex;
use sha1::{Digest, Sha1};

/// A per-session collection of carved frames.
#[derive(Debug, Default)]
pub struct Frames {
    frames: Vec<(u64, Vec<u8>)>,
    /// Number of Ethernet frames accepted.
    pub count_frames: u64,
    /// Number of bare IPv4 packets accepted.
    pub count_packets: u64,
    hashes: HashMap<[u8; 20], u32>,
    seen_origins: HashSet<(String, u64, usize)>,
    oui: HashMap<String, String>,
}

impl Frames {
    /// Creates an empty carving session.
    pub fn new() -> Self {
        Frames::default()
    }

    /// Creates a carving session restricted to the OUIs listed in a file.
    ///
    /// Lines starting with six lowercase hex digits register that OUI; other
    /// lines are ignored.
    pub fn with_oui_file(path: &Path) -> io::Result<Self> {
        let mut frames = Frames::default();
        let pattern = Regex::new("^([0-9a-f]{6})").expect("static regex");
        let content = std::fs::read_to_string(path)?;
        for line in content.lines() {
            let lowered = line.to_lowercase();
            if let Some(captures) = pattern.captures(&lowered) {
                frames.oui.insert(captures[1].to_owned(), line.to_owned());
            }
        }
        Ok(frames)
    }

    fn add_frame_inner(&mut self, index: u64, data: &[u8], duplicates: bool, filename: &str) -> bool {
        let origin = (filename.to_owned(), index, data.len());
        if !self.seen_origins.insert(origin) {
            return false;
        }
        let digest: [u8; 20] = Sha1::digest(data).into();
        let count = self.hashes.entry(digest).or_insert(0);
        *count += 1;
        if duplicates || *count == 1 {
            self.frames.push((index, data.to_vec()));
        }
        true
    }

    /// Adds an Ethernet frame, subject to the OUI filter.
    pub fn add_frame(&mut self, index: u64, data: &[u8], duplicates: bool, filename: &str) {
        let oui_hex = |bytes: Option<&[u8]>| -> String {
            bytes
                .unwrap_or_default()
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect()
        };
        if self.oui.is_empty()
            || self.oui.contains_key(&oui_hex(data.get(..3)))
            || self.oui.contains_key(&oui_hex(data.get(6..9)))
        {
            if self.add_frame_inner(index, data, duplicates, filename) {
                self.count_frames += 1;
            }
        }
    }

    /// Adds a bare IPv4 packet, wrapped in a synthesized Ethernet header
    /// (zeroed MACs, EtherType IPv4).
    pub fn add_ip_packet(&mut self, index: u64, data: &[u8], duplicates: bool, filename: &str) {
        let mut framed = Vec::with_capacity(14 + data.len());
        framed.extend_from_slice(&[0u8; 12]);
        framed.extend_from_slice(&[0x08, 0x00]);
        framed.extend_from_slice(data);
        if self.add_frame_inner(index, &framed, duplicates, filename) {
            self.count_packets += 1;
        }
    }

    /// The collected frames in insertion order.
    pub fn frames(&self) -> &[(u64, Vec<u8>)] {
        &self.frames
    }

    /// Number of frames that will be written to a PCAP file.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the session collected nothing.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether an OUI filter is active.
    pub fn has_oui_filter(&self) -> bool {
        !self.oui.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_dedup() {
        let mut frames = Frames::new();
        frames.add_frame(0, b"\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0A\x0B\x0C", false, "a");
        frames.add_frame(64, b"\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0A\x0B\x0C", false, "a");
        // the duplicate counts as identified but is not collected twice
        assert_eq!(frames.count_frames, 2);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_sha1_dedup_opt_out() {
        let mut frames = Frames::new();
        frames.add_frame(0, b"\x01\x02\x03", true, "a");
        frames.add_frame(64, b"\x01\x02\x03", true, "a");
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_origin_dedup() {
        let mut frames = Frames::new();
        frames.add_frame(0, b"\x01\x02\x03", true, "a");
        frames.add_frame(0, b"\x01\x02\x03", true, "a");
        // same file, index and length: overlap artifact, dropped entirely
        assert_eq!(frames.count_frames, 1);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_ip_packet_framing() {
        let mut frames = Frames::new();
        frames.add_ip_packet(4, b"\x45\x00", false, "");
        assert_eq!(frames.count_packets, 1);
        let (_, data) = &frames.frames()[0];
        assert_eq!(&data[..14], b"\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x08\x00");
        assert_eq!(&data[14..], b"\x45\x00");
    }
}
