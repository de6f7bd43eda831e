//! The `build_doc` step: driving external documentation builders.
//!
//! Each document declares a builder command; it is invoked with the source
//! directory and the output directory appended, the convention shared by
//! sphinx-build-style tools.

use std::process::Command;

use anyhow::{Context, Result, bail};

use crate::pipeline::BuildContext;
use crate::verbose::vprintln;

pub fn build_doc(ctx: &mut BuildContext) -> Result<()> {
    for doc in &ctx.pkg.manifest.documents {
        let Some((program, args)) = doc.builder.split_first() else {
            bail!("document '{}' has an empty builder", doc.name);
        };
        let source = ctx.pkg.root.join(&doc.source_dir);
        if !source.is_dir() {
            bail!(
                "document '{}' source directory {} does not exist",
                doc.name,
                source.display()
            );
        }
        let out_dir = ctx.pkg.build_base.join("doc").join(&doc.name);
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;

        vprintln!("  building document {} via {program}", doc.name);
        let status = Command::new(program)
            .args(args)
            .arg(&source)
            .arg(&out_dir)
            .current_dir(&ctx.pkg.root)
            .status()
            .with_context(|| format!("failed to run {program}"))?;
        if !status.success() {
            bail!("document '{}' failed with {status}", doc.name);
        }
    }
    Ok(())
}
