//! `relic` reconstructs forensic artifacts from Cisco IOS router memory.
//!
//! The suite splits into focused crates, re-exported here under stable
//! module names:
//!
//!  - [`common`]: byte views, magic catalog, scanning primitives.
//!  - [`image`]: IOS firmware image parsing (ELF container, compressed
//!    payload, CW_ metadata, digests).
//!  - [`coredump`]: core dump region maps, heap walking, process
//!    reconstruction, integrity checks, history and event recovery.
//!  - [`carve`]: IPv4/ARP carving, IOMEM frame recovery and PCAP emission.

#![warn(missing_docs)]

/// Common types and byte-level utilities.
pub mod common {
    pub use relic_common::*;
}

/// IOS firmware image parsing.
pub mod image {
    pub use relic_image::*;
}

/// Core dump parsing and runtime-state reconstruction.
pub mod coredump {
    pub use relic_coredump::*;
}

/// Packet carving and PCAP emission.
pub mod carve {
    pub use relic_carve::*;
}
