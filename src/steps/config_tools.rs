//! Compiler discovery: the `config_cc` and `config_fc` steps.

use std::path::PathBuf;

use anyhow::{Result, bail};

use crate::environ::EnvValue;
use crate::pipeline::BuildContext;
use crate::probes::find_program;
use crate::verbose::vprintln;

/// Candidates tried when the corresponding environment variable is unset.
const CC_CANDIDATES: &[&str] = &["cc", "gcc", "clang"];
const FC_CANDIDATES: &[&str] = &["gfortran", "flang"];

fn discover(var: &str, candidates: &[&str]) -> Option<PathBuf> {
    if let Ok(name) = std::env::var(var) {
        if !name.is_empty() {
            let path = PathBuf::from(&name);
            if path.is_file() {
                return Some(path);
            }
            if let Some(found) = find_program(&name, &[]) {
                return Some(found);
            }
        }
    }
    candidates.iter().find_map(|name| find_program(name, &[]))
}

/// Locate the C compiler and record it as `CC`. A package that reaches
/// this step with no C compiler anywhere cannot build native artifacts.
pub fn config_cc(ctx: &mut BuildContext) -> Result<()> {
    if let Some(existing) = ctx.cache.environment.get_path("CC") {
        if existing.is_file() {
            vprintln!("  CC cached: {}", existing.display());
            return Ok(());
        }
    }
    let Some(cc) = discover("CC", CC_CANDIDATES) else {
        bail!("no C compiler found (tried $CC, cc, gcc, clang)");
    };
    vprintln!("  CC: {}", cc.display());
    ctx.cache.environment.insert("CC", EnvValue::Path(cc));
    Ok(())
}

/// Locate the Fortran compiler and record it as `FC`. Absence is recorded
/// rather than fatal; only packages with Fortran sources will miss it.
pub fn config_fc(ctx: &mut BuildContext) -> Result<()> {
    if let Some(existing) = ctx.cache.environment.get_path("FC") {
        if existing.is_file() {
            vprintln!("  FC cached: {}", existing.display());
            return Ok(());
        }
    }
    match discover("FC", FC_CANDIDATES) {
        Some(fc) => {
            vprintln!("  FC: {}", fc.display());
            ctx.cache.environment.insert("FC", EnvValue::Path(fc));
        }
        None => {
            vprintln!("  no Fortran compiler found");
        }
    }
    Ok(())
}
