//! Reconstruction of runtime state from Cisco IOS core dumps.
//!
//! A core dump is a flat snapshot of router RAM addressed from a known base.
//! [`CoreDump`] recovers the region table (`text`, `data`, `bss`, `heap`)
//! from the `DEAD1234` metadata record. Within the heap region,
//! [`MemoryBlocks`] walks the doubly-linked chain of allocator block headers;
//! per-block payloads then yield higher-level artifacts:
//!
//!  - [`CoreDumpAnalysis`] rebuilds the process table from the `Process
//!    Array` chain, falling back to statistical layout discovery when the
//!    process structure variant is unknown,
//!  - [`command_history`] and [`logged_events`] recover operator activity
//!    from `Init` blocks,
//!  - [`check_heap`] and [`check_text`] cross-validate the heap chain and
//!    the dump's text region against a firmware image.

#![warn(missing_docs)]

mod artifacts;
mod block;
mod integrity;
mod process;
mod region;

pub use crate::artifacts::*;
pub use crate::block::*;
pub use crate::integrity::*;
pub use crate::process::*;
pub use crate::region::*;
