//! Native compilation steps: `build_clib`, `build_shlib`, `build_ext`,
//! `build_pypp_ext`, and `build_exe`.
//!
//! All of them assemble direct compiler invocations from the discovered
//! `CC` and the include/lib facts in the environment, and place their
//! artifacts under the build directory (`obj/`, `lib/`, `bin/`).

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};

use crate::config::LibraryKind;
use crate::environ::Environment;
use crate::pipeline::BuildContext;
use crate::verbose::vprintln;

/// The C compiler recorded by `config_cc`.
fn cc_path(env: &Environment) -> Result<PathBuf> {
    match env.get_path("CC") {
        Some(cc) => Ok(cc.to_path_buf()),
        None => bail!("no C compiler recorded; config_cc has not run"),
    }
}

/// Include directories for a unit: its declared dirs plus any
/// `<LIB>_INCLUDE_DIR` facts for the libraries it links.
fn include_dirs(
    root: &Path,
    declared: &[PathBuf],
    libs: &[String],
    env: &Environment,
) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = declared.iter().map(|d| root.join(d)).collect();
    for lib in libs {
        let key = format!("{}_INCLUDE_DIR", lib.to_uppercase());
        if let Some(dir) = env.get_path(&key) {
            dirs.push(dir.to_path_buf());
        }
    }
    dirs
}

/// Library search directories: the build tree first, then any
/// `<LIB>_LIB_DIR` facts for the linked libraries.
fn lib_dirs(build_base: &Path, libs: &[String], env: &Environment) -> Vec<PathBuf> {
    let mut dirs = vec![build_base.join("lib")];
    for lib in libs {
        let key = format!("{}_LIB_DIR", lib.to_uppercase());
        if let Some(dir) = env.get_path(&key) {
            dirs.push(dir.to_path_buf());
        }
    }
    dirs
}

/// Run a compiler/archiver command, failing with its captured stderr.
fn run_tool(mut cmd: Command, what: &str) -> Result<()> {
    let output = cmd
        .output()
        .with_context(|| format!("failed to run {what}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{what} failed:\n{stderr}");
    }
    Ok(())
}

/// Compile one C source to an object file.
fn compile_object(
    cc: &Path,
    root: &Path,
    source: &Path,
    obj_dir: &Path,
    pic: bool,
    includes: &[PathBuf],
) -> Result<PathBuf> {
    std::fs::create_dir_all(obj_dir)?;
    let stem = source
        .file_stem()
        .with_context(|| format!("source {} has no file stem", source.display()))?;
    let obj = obj_dir.join(stem).with_extension("o");

    let mut cmd = Command::new(cc);
    cmd.arg("-c").arg(root.join(source)).arg("-o").arg(&obj);
    if pic {
        cmd.arg("-fPIC");
    }
    for dir in includes {
        cmd.arg("-I").arg(dir);
    }
    run_tool(cmd, &format!("compiling {}", source.display()))?;
    Ok(obj)
}

fn compile_all(
    ctx: &BuildContext,
    unit_name: &str,
    sources: &[PathBuf],
    pic: bool,
    includes: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let cc = cc_path(&ctx.cache.environment)?;
    let obj_dir = ctx.pkg.build_base.join("obj").join(unit_name);
    sources
        .iter()
        .map(|src| compile_object(&cc, &ctx.pkg.root, src, &obj_dir, pic, includes))
        .collect()
}

fn link_shared(
    ctx: &BuildContext,
    objects: &[PathBuf],
    out: &Path,
    libs: &[String],
) -> Result<()> {
    let cc = cc_path(&ctx.cache.environment)?;
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut cmd = Command::new(&cc);
    cmd.arg("-shared").args(objects).arg("-o").arg(out);
    for dir in lib_dirs(&ctx.pkg.build_base, libs, &ctx.cache.environment) {
        cmd.arg("-L").arg(dir);
    }
    for lib in libs {
        cmd.arg(format!("-l{lib}"));
    }
    run_tool(cmd, &format!("linking {}", out.display()))
}

/// Static libraries: compile and `ar rcs` into `build/lib/lib<name>.a`.
pub fn build_clib(ctx: &mut BuildContext) -> Result<()> {
    let libraries: Vec<_> = ctx
        .pkg
        .manifest
        .libraries
        .iter()
        .filter(|l| l.kind == LibraryKind::Static)
        .cloned()
        .collect();
    for lib in libraries {
        let includes = include_dirs(&ctx.pkg.root, &lib.include_dirs, &[], &ctx.cache.environment);
        let objects = compile_all(ctx, &lib.name, &lib.sources, false, &includes)?;
        let out = ctx
            .pkg
            .build_base
            .join("lib")
            .join(format!("lib{}.a", lib.name));
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut cmd = Command::new("ar");
        cmd.arg("rcs").arg(&out).args(&objects);
        run_tool(cmd, &format!("archiving {}", out.display()))?;
        vprintln!("  built {}", out.display());
    }
    Ok(())
}

/// Shared libraries: position-independent objects linked with `-shared`.
pub fn build_shlib(ctx: &mut BuildContext) -> Result<()> {
    let libraries: Vec<_> = ctx
        .pkg
        .manifest
        .libraries
        .iter()
        .filter(|l| l.kind == LibraryKind::Shared)
        .cloned()
        .collect();
    for lib in libraries {
        let includes = include_dirs(&ctx.pkg.root, &lib.include_dirs, &[], &ctx.cache.environment);
        let objects = compile_all(ctx, &lib.name, &lib.sources, true, &includes)?;
        let out = ctx
            .pkg
            .build_base
            .join("lib")
            .join(format!("lib{}.so", lib.name));
        link_shared(ctx, &objects, &out, &[])?;
        vprintln!("  built {}", out.display());
    }
    Ok(())
}

/// Extension modules: shared objects placed under their dotted namespace
/// path (`core._native` becomes `build/lib/core/_native.so`).
pub fn build_ext(ctx: &mut BuildContext) -> Result<()> {
    let extensions = ctx.pkg.manifest.extensions.clone();
    for ext in extensions {
        build_one_ext(
            ctx,
            &ext.name,
            &ext.sources,
            &ext.include_dirs,
            &ext.libs,
        )?;
    }
    Ok(())
}

/// Generated extensions: run the generator, then build like `build_ext`.
pub fn build_pypp_ext(ctx: &mut BuildContext) -> Result<()> {
    let extensions = ctx.pkg.manifest.pypp_extensions.clone();
    for ext in extensions {
        let Some((program, args)) = ext.generator.split_first() else {
            bail!("generated extension '{}' has an empty generator", ext.name);
        };
        vprintln!("  generating sources for {} via {program}", ext.name);
        let status = Command::new(program)
            .args(args)
            .current_dir(&ctx.pkg.root)
            .status()
            .with_context(|| format!("failed to run {program}"))?;
        if !status.success() {
            bail!("generator for '{}' failed with {status}", ext.name);
        }
        build_one_ext(
            ctx,
            &ext.name,
            &ext.sources,
            &ext.include_dirs,
            &ext.libs,
        )?;
    }
    Ok(())
}

fn build_one_ext(
    ctx: &mut BuildContext,
    name: &str,
    sources: &[PathBuf],
    declared_includes: &[PathBuf],
    libs: &[String],
) -> Result<()> {
    let includes = include_dirs(
        &ctx.pkg.root,
        declared_includes,
        libs,
        &ctx.cache.environment,
    );
    let objects = compile_all(ctx, name, sources, true, &includes)?;
    let out = ctx
        .pkg
        .build_base
        .join("lib")
        .join(name.replace('.', "/"))
        .with_extension("so");
    link_shared(ctx, &objects, &out, libs)?;
    vprintln!("  built {}", out.display());
    Ok(())
}

/// Native executables linked against built and discovered libraries into
/// `build/bin/`.
pub fn build_exe(ctx: &mut BuildContext) -> Result<()> {
    let executables = ctx.pkg.manifest.executables.clone();
    for exe in executables {
        let includes = include_dirs(
            &ctx.pkg.root,
            &exe.include_dirs,
            &exe.libs,
            &ctx.cache.environment,
        );
        let objects = compile_all(ctx, &exe.name, &exe.sources, false, &includes)?;
        let out = ctx.pkg.build_base.join("bin").join(&exe.name);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let cc = cc_path(&ctx.cache.environment)?;
        let mut cmd = Command::new(&cc);
        cmd.args(&objects).arg("-o").arg(&out);
        for dir in lib_dirs(&ctx.pkg.build_base, &exe.libs, &ctx.cache.environment) {
            cmd.arg("-L").arg(dir);
        }
        for lib in &exe.libs {
            cmd.arg(format!("-l{lib}"));
        }
        run_tool(cmd, &format!("linking {}", out.display()))?;
        vprintln!("  built {}", out.display());
    }
    Ok(())
}
