//! Staging descriptor files into the sandbox work directory.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

use super::Package;

/// Copy the descriptor and any auxiliary assets next to it into the work
/// directory of the sandbox mounted at `mount_point`.
///
/// Stops at the first failure; the partially staged work directory is
/// discarded with the rest of the overlay.
pub(crate) fn copy_assets(package: &Package, mount_point: &Path) -> Result<()> {
    let dest = package.work_dir(mount_point);
    fs::create_dir_all(&dest)
        .with_context(|| format!("Failed to create work directory: {}", dest.display()))?;

    let descriptor = package.descriptor_file_name();
    fs::copy(&package.path, dest.join(descriptor))
        .with_context(|| format!("Failed to copy descriptor: {}", package.path.display()))?;

    let tree = package.source_tree();
    for asset in package.format.auxiliary_assets() {
        let src = tree.join(asset);
        let dst = dest.join(asset);
        if src.is_dir() {
            copy_dir_recursive(&src, &dst)?;
        } else if src.is_file() {
            fs::copy(&src, &dst)
                .with_context(|| format!("Failed to copy asset: {}", src.display()))?;
        } else {
            debug!(asset, "No such asset, skipping");
            continue;
        }
        debug!(asset, dest = %dst.display(), "Staged asset");
    }
    Ok(())
}

/// Recursively copy a directory, recreating symlinks instead of following
/// them.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create directory: {}", dst.display()))?;

    for entry in
        fs::read_dir(src).with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::tests::{legacy_descriptor, modern_descriptor};
    use crate::testing::{sha1_hex, sha256_hex};
    use tempfile::TempDir;

    fn tree_with_assets(dir: &Path) {
        fs::create_dir_all(dir.join("files/patches")).unwrap();
        fs::write(dir.join("files/patches/fix.patch"), "--- a\n+++ b\n").unwrap();
        std::os::unix::fs::symlink("patches/fix.patch", dir.join("files/latest.patch"))
            .unwrap();
        fs::write(dir.join("component.xml"), "<PISI/>").unwrap();
        fs::write(dir.join("actions.py"), "def build(): pass\n").unwrap();
    }

    #[test]
    fn modern_assets_land_in_build_home() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("nano");
        let root = temp.path().join("union");
        fs::create_dir_all(&tree).unwrap();
        tree_with_assets(&tree);
        let sum = sha256_hex(b"x");
        fs::write(
            tree.join("package.yml"),
            modern_descriptor(&[("https://example.org/x.tar", &sum)]),
        )
        .unwrap();

        let package = Package::parse(&tree.join("package.yml")).unwrap();
        copy_assets(&package, &root).unwrap();

        let work = root.join("home/build/work");
        assert!(work.join("package.yml").is_file());
        assert!(work.join("files/patches/fix.patch").is_file());
        assert!(work.join("files/latest.patch").is_symlink());
        assert!(work.join("component.xml").is_file());
        assert!(!work.join("actions.py").exists());
    }

    #[test]
    fn legacy_assets_include_actions() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("nano");
        let root = temp.path().join("union");
        fs::create_dir_all(&tree).unwrap();
        tree_with_assets(&tree);
        let sum = sha1_hex(b"x");
        fs::write(
            tree.join("pspec.xml"),
            legacy_descriptor(&[("https://example.org/x.tar", &sum)]),
        )
        .unwrap();

        let package = Package::parse(&tree.join("pspec.xml")).unwrap();
        copy_assets(&package, &root).unwrap();

        let work = root.join("WORK");
        assert!(work.join("pspec.xml").is_file());
        assert!(work.join("actions.py").is_file());
        assert!(!work.join("comar").exists());
    }
}
