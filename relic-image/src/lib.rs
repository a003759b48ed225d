//! Parsing of Cisco IOS firmware images.
//!
//! IOS images ship as a constrained big-endian 32-bit ELF container. The
//! payload of interest is spread over specially tagged sections:
//!
//!  - a compressed-image section starting with `FEEDFACE`, holding four
//!    length/checksum words and a ZIP archive with the uncompressed image,
//!  - a section carrying an embedded MD5 digest tagged `FADEFAD1`,
//!  - a section with `$`-delimited `CW_` metadata strings.
//!
//! [`Elf`] parses the container, [`IosImage`] locates and validates the
//! tagged sections, and [`CwStrings`] recovers the metadata table. All
//! parsers record malformed input as observable error codes on the parsed
//! value instead of failing the parse, so partially damaged evidence still
//! yields whatever can be recovered.

#![warn(missing_docs)]

mod cw;
mod elf;
mod image;

pub use crate::cw::*;
pub use crate::elf::*;
pub use crate::image::*;
