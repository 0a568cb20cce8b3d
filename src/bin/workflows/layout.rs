use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use sandbuild::package::{LEGACY_DESCRIPTOR, MODERN_DESCRIPTOR};

/// Find the descriptor to build in `dir`, preferring the modern format.
pub(crate) fn locate_descriptor(dir: &Path) -> Result<PathBuf> {
    for name in [MODERN_DESCRIPTOR, LEGACY_DESCRIPTOR] {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!(
        "no {} or {} found in '{}'; pass the descriptor path explicitly",
        MODERN_DESCRIPTOR,
        LEGACY_DESCRIPTOR,
        dir.display()
    )
}
