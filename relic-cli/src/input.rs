//! Evidence input.

use std::path::Path;

use anyhow::Context;

use relic_common::ByteView;

/// Opens an evidence file (raw or `.zip`-wrapped), attaching the path to any
/// failure.
pub fn read_evidence(path: &Path) -> anyhow::Result<ByteView> {
    ByteView::open_evidence(path).with_context(|| format!("error reading {}", path.display()))
}
