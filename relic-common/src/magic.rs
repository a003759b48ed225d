//! The catalog of Cisco IOS magic sequences.
//!
//! Every parser in the suite recognizes its structures by one of these
//! bit-exact markers. Integer forms are given for values that are compared
//! as big-endian words rather than byte strings.

/// Marks the region metadata record of a core dump.
pub const REGIONS: &[u8; 4] = b"\xDE\xAD\x12\x34";

/// First word of every heap block header.
pub const BLOCK_BEGIN: &[u8; 4] = b"\xAB\x12\x34\xCD";

/// [`BLOCK_BEGIN`] as a big-endian word.
pub const BLOCK_BEGIN_WORD: u32 = 0xAB12_34CD;

/// Trailing word of an in-use heap block, used to detect overflow corruption.
pub const BLOCK_CANARY_WORD: u32 = 0xFD01_10DF;

/// First word of the free-chain record inside a free heap block.
pub const BLOCK_FREE_WORD: u32 = 0xDEAD_BEEF;

/// Terminates an IOS process structure.
pub const PROCESS_END: &[u8; 4] = b"\xBE\xEF\xCA\xFE";

/// Starts the compressed-payload section of an IOS image.
pub const FEEDFACE: &[u8; 4] = b"\xFE\xED\xFA\xCE";

/// Tags the embedded MD5 digest of an IOS image; the digest follows.
pub const FADEFAD1: &[u8; 8] = b"\xFA\xDE\xFA\xD1\x00\x00\x00\x18";

/// Separates CW_ metadata keys from values and tokens from each other.
pub const CW_DELIMITER: &[u8; 1] = b"$";

/// Common prefix of every CW_ metadata token.
pub const CW_PREFIX: &[u8; 3] = b"CW_";

/// Opens the CW_ metadata region.
pub const CW_BEGIN: &[u8; 9] = b"CW_BEGIN$";

/// Closes the CW_ metadata region.
pub const CW_END: &[u8; 7] = b"CW_END$";
