//! The `build_py` step: staging module source trees into the build
//! directory under their namespace paths.

use std::path::Path;

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

use crate::pipeline::BuildContext;
use crate::verbose::vprintln;

/// Directory names never copied into the build tree.
const EXCLUDED_DIRS: &[&str] = &[".git", ".svn", "CVS", "__pycache__"];

pub fn build_py(ctx: &mut BuildContext) -> Result<()> {
    for module in &ctx.pkg.manifest.modules {
        let dotted = ctx
            .pkg
            .names
            .get(&module.name)
            .cloned()
            .unwrap_or_else(|| module.name.clone());
        let dest = ctx
            .pkg
            .build_base
            .join("lib")
            .join(dotted.replace('.', "/"));
        let src = ctx.pkg.root.join(&module.path);
        copy_tree(&src, &dest)
            .with_context(|| format!("failed to stage module '{}'", module.name))?;
        vprintln!("  staged {} -> {}", module.name, dest.display());
    }
    Ok(())
}

/// Recursively copy a directory, skipping VCS and cache directories.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if !src.is_dir() {
        bail!("source directory {} does not exist", src.display());
    }
    for entry in WalkDir::new(src).into_iter().filter_entry(|e| {
        !e.path()
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| EXCLUDED_DIRS.contains(&n))
    }) {
        let entry = entry.context("failed to walk source tree")?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy to {}", target.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_skips_vcs_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::create_dir_all(src.join(".git")).unwrap();
        std::fs::write(src.join("mod.py"), "x = 1").unwrap();
        std::fs::write(src.join("sub/inner.py"), "y = 2").unwrap();
        std::fs::write(src.join(".git/config"), "").unwrap();

        let dest = dir.path().join("out");
        copy_tree(&src, &dest).unwrap();
        assert!(dest.join("mod.py").exists());
        assert!(dest.join("sub/inner.py").exists());
        assert!(!dest.join(".git").exists());
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = copy_tree(&dir.path().join("nope"), &dir.path().join("out")).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
