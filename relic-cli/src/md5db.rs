//! The MD5 reference database.
//!
//! Known-good image digests ship as CSV files with `<md5>,<filename>` lines.
//! Lookups key on the lowercase hex digest of the whole image file.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;

/// MD5 of the empty string; doubles of it usually indicate truncated rows.
const MD5_EMPTY: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// An in-memory MD5 reference database.
#[derive(Debug, Default)]
pub struct Md5Database {
    entries: HashMap<String, (String, String)>,
    /// Rows whose digest was already present.
    pub doubles: usize,
    /// Doubles that were the empty-string digest.
    pub empty_doubles: usize,
}

impl Md5Database {
    /// Loads one CSV file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut database = Md5Database::default();
        database.add_csv(path)?;
        Ok(database)
    }

    fn add_csv(&mut self, path: &Path) -> anyhow::Result<()> {
        let basename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("error reading {}", path.display()))?;
        for line in content.lines() {
            let (digest, filename) = match line.split_once(',') {
                Some(pair) => pair,
                None => continue,
            };
            let digest = digest.to_lowercase();
            if self.entries.contains_key(&digest) {
                if digest == MD5_EMPTY {
                    self.empty_doubles += 1;
                }
                self.doubles += 1;
            } else {
                self.entries
                    .insert(digest, (basename.clone(), filename.trim().to_owned()));
            }
        }
        Ok(())
    }

    /// Number of unique entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Looks up a lowercase hex digest; returns (csv basename, filename).
    pub fn find(&self, digest: &str) -> Option<(&str, &str)> {
        self.entries
            .get(digest)
            .map(|(basename, filename)| (basename.as_str(), filename.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use tempfile::NamedTempFile;

    #[test]
    fn test_load_and_find() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "AABB01,c2600-i-mz.124-13r.bin").unwrap();
        writeln!(tmp, "aabb01, duplicate.bin").unwrap();
        writeln!(tmp, "ccdd02,other.bin").unwrap();

        let database = Md5Database::load(tmp.path()).unwrap();
        assert_eq!(database.len(), 2);
        assert_eq!(database.doubles, 1);
        let (_, filename) = database.find("aabb01").unwrap();
        assert_eq!(filename, "c2600-i-mz.124-13r.bin");
        assert!(database.find("ffff99").is_none());
    }
}
