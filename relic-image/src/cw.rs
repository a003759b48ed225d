//! The CW_ metadata string table.
//!
//! IOS firmware carries build metadata as `$`-delimited tokens between a
//! `CW_BEGIN$` and a `CW_END$` marker, for example
//! `CW_BEGIN$CW_VERSION$12.4$CW_END$`. Keys keep their `CW_` prefix; the
//! value runs from the delimiter after the key to the next delimiter.

use indexmap::IndexMap;
use thiserror::Error;

use relic_common::{find, find_all, magic};

/// Well-known CW_ keys, in display order.
pub const KNOWN_KEYS: &[&[u8]] = &[
    b"CW_VERSION",
    b"CW_FAMILY",
    b"CW_FEATURE",
    b"CW_IMAGE",
    b"CW_SYSDESCR",
];

/// An error observed while recovering the CW_ string table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CwError {
    /// No `CW_BEGIN$` marker found.
    #[error("CW_BEGIN not found")]
    BeginNotFound,
    /// The `CW_BEGIN$` marker occurs more than once.
    #[error("CW_BEGIN found multiple times")]
    MultipleBegin,
    /// No `CW_END$` marker found.
    #[error("CW_END not found")]
    EndNotFound,
    /// The `CW_END$` marker occurs more than once.
    #[error("CW_END found multiple times")]
    MultipleEnd,
    /// `CW_BEGIN$` does not precede `CW_END$`.
    #[error("CW_BEGIN not before CW_END")]
    BeginAfterEnd,
    /// A token is not terminated by two `$` delimiters.
    #[error("token delimiters not found")]
    MissingDelimiters,
}

/// The ordered key/value metadata recovered from a CW_ strings region.
///
/// Like the other parsers in this crate, a failed recovery is recorded in
/// [`CwStrings::error`] rather than failing construction; the table is then
/// empty.
#[derive(Clone, Debug, Default)]
pub struct CwStrings {
    table: IndexMap<Vec<u8>, Vec<u8>>,
    /// The first malformation observed, if any.
    pub error: Option<CwError>,
}

impl CwStrings {
    /// Scans `data` for the delimited CW_ region and tokenizes it.
    pub fn parse(data: &[u8]) -> Self {
        let mut strings = CwStrings::default();
        strings.error = strings.parse_inner(data).err();
        if strings.error.is_some() {
            strings.table.clear();
        }
        strings
    }

    fn parse_inner(&mut self, data: &[u8]) -> Result<(), CwError> {
        let begin = match find_all(data, magic::CW_BEGIN).as_slice() {
            [] => return Err(CwError::BeginNotFound),
            [index] => *index,
            _ => return Err(CwError::MultipleBegin),
        };
        let end = match find_all(data, magic::CW_END).as_slice() {
            [] => return Err(CwError::EndNotFound),
            [index] => *index,
            _ => return Err(CwError::MultipleEnd),
        };
        if begin >= end {
            return Err(CwError::BeginAfterEnd);
        }

        // tokens live strictly between the markers
        let tokens = &data[begin + magic::CW_BEGIN.len()..end];
        for index in find_all(tokens, magic::CW_PREFIX) {
            let token = &tokens[index..];
            let delimiters = find_all(token, magic::CW_DELIMITER);
            let (&first, &second) = match delimiters.as_slice() {
                [first, second, ..] => (first, second),
                _ => return Err(CwError::MissingDelimiters),
            };
            self.table
                .insert(token[..first].to_vec(), token[first + 1..second].to_vec());
        }
        Ok(())
    }

    /// Looks up a value by key, e.g. `b"CW_VERSION"`.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.table.get(key).map(Vec::as_slice)
    }

    /// Looks up a value and renders it as text.
    pub fn get_str(&self, key: &[u8]) -> Option<String> {
        self.get(key)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    /// Iterates over the table in recovery order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.table
            .iter()
            .map(|(key, value)| (key.as_slice(), value.as_slice()))
    }

    /// Number of recovered entries.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Returns true when the buffer contains a `CW_BEGIN$` marker at all.
pub fn contains_cw_region(data: &[u8]) -> bool {
    find(data, magic::CW_BEGIN, 0).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_pair() {
        let strings = CwStrings::parse(b"junk CW_BEGIN$CW_VERSION$12.4$CW_END$X trailer");
        assert_eq!(strings.error, None);
        assert_eq!(strings.len(), 1);
        assert_eq!(strings.get(b"CW_VERSION"), Some(&b"12.4"[..]));
    }

    #[test]
    fn test_multiple_pairs_keep_order() {
        let strings =
            CwStrings::parse(b"CW_BEGIN$CW_VERSION$12.4(13r)T$CW_FAMILY$C1700$CW_END$");
        assert_eq!(strings.error, None);
        let keys: Vec<&[u8]> = strings.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![&b"CW_VERSION"[..], &b"CW_FAMILY"[..]]);
        assert_eq!(strings.get_str(b"CW_FAMILY").as_deref(), Some("C1700"));
    }

    #[test]
    fn test_missing_begin() {
        let strings = CwStrings::parse(b"CW_VERSION$12.4$CW_END$");
        assert_eq!(strings.error, Some(CwError::BeginNotFound));
        assert!(strings.is_empty());
    }

    #[test]
    fn test_duplicate_end() {
        let strings = CwStrings::parse(b"CW_BEGIN$CW_V$1$CW_END$CW_END$");
        assert_eq!(strings.error, Some(CwError::MultipleEnd));
    }

    #[test]
    fn test_begin_after_end() {
        let strings = CwStrings::parse(b"CW_END$CW_BEGIN$");
        assert_eq!(strings.error, Some(CwError::BeginAfterEnd));
    }
}
