//! The `build_src` step: expanding `.in` source templates.
//!
//! `@KEY@` placeholders are substituted from the environment dictionary;
//! expanded files land under `<build-base>/src/` with the `.in` suffix
//! stripped, preserving their relative paths.

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::environ::Environment;
use crate::pipeline::BuildContext;
use crate::verbose::vprintln;

pub fn build_src(ctx: &mut BuildContext) -> Result<()> {
    for template in &ctx.pkg.manifest.sources {
        let src = ctx.pkg.root.join(&template.path);
        let rel = stripped_name(&template.path)?;
        let dest = ctx.pkg.build_base.join("src").join(rel);

        let contents = std::fs::read_to_string(&src)
            .with_context(|| format!("failed to read template {}", src.display()))?;
        let expanded = expand(&contents, &ctx.cache.environment)
            .with_context(|| format!("failed to expand {}", src.display()))?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, expanded)
            .with_context(|| format!("failed to write {}", dest.display()))?;
        vprintln!("  configured {}", dest.display());
    }
    Ok(())
}

/// The template's relative path without the trailing `.in`.
fn stripped_name(path: &Path) -> Result<&Path> {
    let as_str = path
        .to_str()
        .with_context(|| format!("template path {} is not UTF-8", path.display()))?;
    match as_str.strip_suffix(".in") {
        Some(stripped) if !stripped.is_empty() => Ok(Path::new(stripped)),
        _ => bail!("template '{}' must end in '.in'", path.display()),
    }
}

/// Substitute `@KEY@` placeholders. Keys are uppercase identifiers; any
/// other `@` is literal. An undefined key is an error — silently leaving
/// a placeholder behind produces artifacts that fail much later.
pub(crate) fn expand(template: &str, env: &Environment) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('@') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let key_end = after.find('@');
        match key_end {
            Some(end) if end > 0 && is_key(&after[..end]) => {
                let key = &after[..end];
                match env.get(key) {
                    Some(value) => out.push_str(&value.render()),
                    None => bail!("template references undefined key '@{key}@'"),
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('@');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn is_key(text: &str) -> bool {
    text.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
