//! Header-shape scanners for IPv4 packets and ARP frames.
//!
//! An IPv4 header announces itself: a version/IHL byte in `0x45..=0x4F`
//! followed by bytes whose ones-complement checksum comes out zero. Each
//! candidate is then classified by its surroundings: preceded by an EtherType
//! of `08 00` it is captured with its Ethernet (or 802.1Q) frame, otherwise
//! as a bare packet. ARP frames are found by their fixed 8-byte signature.

use crate::frames::Frames;

/// The 8-byte EtherType + header signature of an Ethernet ARP request or
/// reply.
pub const ARP_SIGNATURE: [u8; 8] = [0x08, 0x06, 0x00, 0x01, 0x08, 0x00, 0x06, 0x04];

fn carry_around_add(a: u32, b: u32) -> u32 {
    let c = a + b;
    (c & 0xFFFF) + (c >> 16)
}

/// The 16-bit ones-complement IP checksum over `data`.
///
/// A well-formed IPv4 header checksums to zero.
pub fn ip_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for pair in data.chunks_exact(2) {
        sum = carry_around_add(sum, pair[0] as u32 + ((pair[1] as u32) << 8));
    }
    !(sum as u16)
}

/// Scans `data` for IPv4 packets and adds hits to `frames`.
///
/// `base_address` offsets the carved indices (so indices stay meaningful
/// across buffered reads). With `options` set, headers carrying IP options
/// (IHL up to 15) are considered; otherwise only plain 20-byte headers.
/// Returns whether anything was found; unless `multiple` is set, scanning
/// stops at the first hit.
pub fn extract_ip_packets(
    frames: &mut Frames,
    base_address: u64,
    data: &[u8],
    options: bool,
    duplicates: bool,
    multiple: bool,
    filename: &str,
) -> bool {
    let mut found = false;
    let max_header = if options { 0x50 } else { 0x46 };
    for header_start in 0x45u8..max_header {
        for index in 0..data.len() {
            if data[index] != header_start {
                continue;
            }
            let header_len = 4 * (header_start as usize - 0x40);
            let header = match data.get(index..index + header_len) {
                Some(header) => header,
                None => continue,
            };
            if ip_checksum(header) != 0 {
                continue;
            }
            let packet_length = header[2] as usize * 0x100 + header[3] as usize;
            let end = (index + packet_length).min(data.len());
            let ethertype_ip =
                index >= 2 && data[index - 2] == 0x08 && data[index - 1] == 0x00;
            if ethertype_ip {
                // the packet sits inside an Ethernet frame; keep the frame
                let tagged =
                    index >= 6 && data[index - 6] == 0x81 && data[index - 5] == 0x00;
                let frame_start = if tagged { index.checked_sub(18) } else { index.checked_sub(14) };
                if let Some(start) = frame_start {
                    frames.add_frame(
                        base_address + start as u64,
                        &data[start..end],
                        duplicates,
                        filename,
                    );
                    found = true;
                }
            } else {
                frames.add_ip_packet(
                    base_address + index as u64,
                    &data[index..end],
                    duplicates,
                    filename,
                );
                found = true;
            }
            if found && !multiple {
                return found;
            }
        }
    }
    found
}

/// Scans `data` for Ethernet ARP frames and adds hits to `frames`.
pub fn extract_arp_frames(
    frames: &mut Frames,
    base_address: u64,
    data: &[u8],
    duplicates: bool,
    multiple: bool,
    filename: &str,
) -> bool {
    let mut found = false;
    let mut index = 0;
    while let Some(hit) = relic_common::find(data, &ARP_SIGNATURE, index) {
        if let Some(start) = hit.checked_sub(12) {
            let end = (hit + 30).min(data.len());
            frames.add_frame(
                base_address + start as u64,
                &data[start..end],
                duplicates,
                filename,
            );
            found = true;
        }
        if found && !multiple {
            return found;
        }
        index = hit + 1;
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 20-byte IPv4 header with a valid checksum (total length 20).
    pub(crate) fn valid_ip_header() -> [u8; 20] {
        let mut header = [
            0x45, 0x00, 0x00, 0x14, 0x00, 0x01, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00, 0xC0, 0xA8,
            0x00, 0x01, 0xC0, 0xA8, 0x00, 0x02,
        ];
        // patch the checksum field so the header sums to zero
        let sum = ip_checksum(&header);
        header[10] = (sum & 0xFF) as u8;
        header[11] = (sum >> 8) as u8;
        debug_assert_eq!(ip_checksum(&header), 0);
        header
    }

    #[test]
    fn test_checksum_zero_on_valid_header() {
        assert_eq!(ip_checksum(&valid_ip_header()), 0);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut header = valid_ip_header();
        for index in 0..header.len() {
            header[index] ^= 0x41;
            assert_ne!(ip_checksum(&header), 0, "flip at {index} undetected");
            header[index] ^= 0x41;
        }
    }

    #[test]
    fn test_bare_packet_carved() {
        let mut data = vec![0xEEu8; 32];
        data.extend_from_slice(&valid_ip_header());
        data.extend_from_slice(&[0xEE; 8]);
        let mut frames = Frames::new();
        assert!(extract_ip_packets(&mut frames, 0, &data, false, false, true, ""));
        assert_eq!(frames.count_packets, 1);
        let (index, frame) = &frames.frames()[0];
        assert_eq!(*index, 32);
        // synthesized Ethernet header + the 20-byte packet
        assert_eq!(frame.len(), 14 + 20);
    }

    #[test]
    fn test_ethernet_frame_carved() {
        let mut data = vec![0xEEu8; 2];
        data.extend_from_slice(&[0x02; 6]); // destination MAC
        data.extend_from_slice(&[0x04; 6]); // source MAC
        data.extend_from_slice(&[0x08, 0x00]);
        data.extend_from_slice(&valid_ip_header());
        data.extend_from_slice(&[0xEE; 4]);
        let mut frames = Frames::new();
        assert!(extract_ip_packets(&mut frames, 0, &data, false, false, true, ""));
        assert_eq!(frames.count_frames, 1);
        let (index, frame) = &frames.frames()[0];
        assert_eq!(*index, 2);
        assert_eq!(frame.len(), 14 + 20);
    }

    #[test]
    fn test_dot1q_frame_carved() {
        let mut data = vec![0xEEu8; 4];
        data.extend_from_slice(&[0x02; 6]);
        data.extend_from_slice(&[0x04; 6]);
        data.extend_from_slice(&[0x81, 0x00, 0x00, 0x2A]); // 802.1Q tag
        data.extend_from_slice(&[0x08, 0x00]);
        data.extend_from_slice(&valid_ip_header());
        let mut frames = Frames::new();
        assert!(extract_ip_packets(&mut frames, 0, &data, false, false, true, ""));
        let (index, frame) = &frames.frames()[0];
        assert_eq!(*index, 4);
        assert_eq!(frame.len(), 18 + 20);
    }

    #[test]
    fn test_arp_frame_carved() {
        let mut data = vec![0xEEu8; 12];
        data.extend_from_slice(&ARP_SIGNATURE);
        data.extend_from_slice(&[0x11; 40]);
        let mut frames = Frames::new();
        assert!(extract_arp_frames(&mut frames, 0, &data, false, true, ""));
        let (index, frame) = &frames.frames()[0];
        assert_eq!(*index, 0);
        assert_eq!(frame.len(), 42);
        // the signature sits at the EtherType offset
        assert_eq!(&frame[12..20], &ARP_SIGNATURE);
    }

    #[test]
    fn test_base_address_offsets_index() {
        let mut data = vec![0xEEu8; 8];
        data.extend_from_slice(&valid_ip_header());
        let mut frames = Frames::new();
        extract_ip_packets(&mut frames, 0x1000, &data, false, false, true, "");
        assert_eq!(frames.frames()[0].0, 0x1008);
    }
}
