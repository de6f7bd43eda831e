//! The `build_js` step: invoking external web-front-end transpilers.
//!
//! Transpilation itself is an external collaborator; this step only runs
//! each declared command with the output directory prepared and exported.

use std::process::Command;

use anyhow::{Context, Result, bail};

use crate::pipeline::BuildContext;
use crate::verbose::vprintln;

pub fn build_js(ctx: &mut BuildContext) -> Result<()> {
    for ext in &ctx.pkg.manifest.web_extensions {
        let Some((program, args)) = ext.command.split_first() else {
            bail!("web extension '{}' has an empty command", ext.name);
        };
        let out_dir = ctx.pkg.build_base.join("web").join(&ext.name);
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;

        vprintln!("  transpiling {} via {program}", ext.name);
        let status = Command::new(program)
            .args(args)
            .current_dir(&ctx.pkg.root)
            .env("BARYON_WEB_OUTPUT", &out_dir)
            .status()
            .with_context(|| format!("failed to run {program}"))?;
        if !status.success() {
            bail!("web extension '{}' failed with {status}", ext.name);
        }
    }
    Ok(())
}
