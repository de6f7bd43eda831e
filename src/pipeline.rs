//! The fixed, ordered build-command pipeline.
//!
//! Each step is gated by a predicate over the package's declared
//! capabilities; only gated-in steps execute, and the order is never
//! rearranged because later steps consume artifacts earlier steps
//! materialize in the build directory (e.g. `build_ext` assumes
//! `build_src` already expanded any templated sources).

use anyhow::{Context, Result};

use crate::config::ResolvedPackage;
use crate::environ::EnvCache;
use crate::steps;
use crate::verbose::{dprintln, vprintln};

/// Mutable state threaded through the pipeline steps.
pub struct BuildContext<'a> {
    pub pkg: &'a ResolvedPackage,
    pub cache: &'a mut EnvCache,
}

/// One pipeline step: a name, a capability gate, and a handler.
pub struct Step {
    pub name: &'static str,
    applies: fn(&ResolvedPackage) -> bool,
    run: fn(&mut BuildContext) -> Result<()>,
}

fn always(_: &ResolvedPackage) -> bool {
    true
}

/// The pipeline. Order is load-bearing.
pub const STEPS: &[Step] = &[
    Step {
        name: "config_cc",
        applies: always,
        run: steps::config_tools::config_cc,
    },
    Step {
        name: "config_fc",
        applies: always,
        run: steps::config_tools::config_fc,
    },
    Step {
        name: "build_src",
        applies: ResolvedPackage::has_sources,
        run: steps::sources::build_src,
    },
    Step {
        name: "build_py",
        applies: ResolvedPackage::has_modules,
        run: steps::modules::build_py,
    },
    Step {
        name: "build_js",
        applies: ResolvedPackage::has_web_extensions,
        run: steps::web::build_js,
    },
    Step {
        name: "build_clib",
        applies: ResolvedPackage::has_c_libraries,
        run: steps::natives::build_clib,
    },
    Step {
        name: "build_shlib",
        applies: ResolvedPackage::has_shared_libraries,
        run: steps::natives::build_shlib,
    },
    Step {
        name: "build_ext",
        applies: ResolvedPackage::has_extensions,
        run: steps::natives::build_ext,
    },
    Step {
        name: "build_pypp_ext",
        applies: ResolvedPackage::has_pypp_extensions,
        run: steps::natives::build_pypp_ext,
    },
    Step {
        name: "build_scripts",
        applies: ResolvedPackage::has_scripts,
        run: steps::scripts::build_scripts,
    },
    Step {
        name: "build_doc",
        applies: ResolvedPackage::has_documents,
        run: steps::docs::build_doc,
    },
    Step {
        name: "build_exe",
        applies: ResolvedPackage::has_executables,
        run: steps::natives::build_exe,
    },
];

/// Run every gated-in step in order. Returns `(steps run, total steps)`.
pub fn run_pipeline(ctx: &mut BuildContext) -> Result<(usize, usize)> {
    let mut ran = 0;
    for step in STEPS {
        if !(step.applies)(ctx.pkg) {
            vprintln!("  Skipping {} (not applicable)", step.name);
            continue;
        }
        dprintln!("  Running {} ...", step.name);
        (step.run)(ctx).with_context(|| format!("step '{}' failed", step.name))?;
        ran += 1;
    }
    Ok((ran, STEPS.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_is_fixed() {
        let names: Vec<&str> = STEPS.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            [
                "config_cc",
                "config_fc",
                "build_src",
                "build_py",
                "build_js",
                "build_clib",
                "build_shlib",
                "build_ext",
                "build_pypp_ext",
                "build_scripts",
                "build_doc",
                "build_exe",
            ]
        );
    }

    #[test]
    fn gates_reflect_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(crate::config::MANIFEST_FILE),
            r#"
            [project]
            name = "demo"
            version = "1.0"
            [[scripts]]
            name = "run-demo"
            command = "demo-main"
        "#,
        )
        .unwrap();
        let pkg = crate::config::load_package(dir.path(), None).unwrap();

        let gated: Vec<&str> = STEPS
            .iter()
            .filter(|s| (s.applies)(&pkg))
            .map(|s| s.name)
            .collect();
        assert_eq!(gated, ["config_cc", "config_fc", "build_scripts"]);
    }
}
