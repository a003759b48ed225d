//! Packet and frame carving.
//!
//! Network evidence hides in router memory long after the packets are gone:
//! IOMEM retains transmitted frames, and arbitrary memory or disk captures
//! contain IPv4 headers recognizable by shape and checksum. This crate
//! recovers them:
//!
//!  - [`extract_ip_packets`] and [`extract_arp_frames`] scan arbitrary
//!    buffers using header heuristics,
//!  - [`recover_iomem_frames`] follows `*Packet Header*` heap blocks into an
//!    IOMEM capture,
//!  - [`Frames`] deduplicates what was found and [`Frames::write_pcap`]
//!    emits a libpcap file,
//!  - [`BufferedFile`] streams very large inputs through an overlapping
//!    window so boundary-straddling packets are still found.

#![warn(missing_docs)]

mod buffer;
mod carve;
mod frames;
mod pcap;
mod recover;

pub use crate::buffer::*;
pub use crate::carve::*;
pub use crate::frames::*;
pub use crate::pcap::*;
pub use crate::recover::*;
