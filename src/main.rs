//! Baryon: a recursive multi-package build orchestrator.
//!
//! Reads a `baryon.toml` manifest, resolves third-party prerequisites
//! through a probe registry (caching discovered facts on disk), propagates
//! build-lifecycle verbs to nested sub-packages as independent processes,
//! and runs a fixed, capability-gated native build pipeline.

mod cli;
mod config;
mod environ;
mod fatal;
mod graph;
mod orchestrate;
mod pipeline;
mod probes;
mod resolver;
mod steps;
mod tree;
mod verbose;

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command as ProcessCommand;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command};
use config::ResolvedPackage;
use environ::EnvCache;
use fatal::FatalError;
use orchestrate::Orchestrator;
use verbose::{dprintln, vprintln};

fn main() {
    let cli = Cli::parse();
    verbose::init(cli.quiet, cli.verbose);

    if let Err(err) = run(&cli) {
        if let Some(fatal) = err.downcast_ref::<FatalError>() {
            eprintln!("FatalError: {fatal}");
            std::process::exit(fatal.exit_code);
        }
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Build => cmd_build(cli),
        Command::Install(args) => cmd_install(cli, args),
        Command::Clean => cmd_clean(cli),
        Command::Test(args) => cmd_test(cli, args),
        Command::Dependencies(args) => cmd_dependencies(cli, args),
    }
}

// ===========================================================================
// Shared helpers
// ===========================================================================

/// Locate and load the package for the current working directory.
fn load_package(cli: &Cli) -> Result<ResolvedPackage> {
    let root = config::find_project_root()?;
    config::load_package(&root, cli.build_base.as_deref())
}

/// Load the environment cache, preferring the top-level cache shared via
/// [`CACHE_DIR_VAR`] for nested invocations. Only sublevel 0 ever writes
/// the shared file; children persist to their own build directories.
fn prepare_cache(pkg: &ResolvedPackage, sublevel: u32, force: bool) -> EnvCache {
    let hash = environ::toolchain_hash();
    if force {
        return EnvCache::new(hash);
    }
    if sublevel > 0 {
        if let Ok(dir) = std::env::var(environ::CACHE_DIR_VAR) {
            if let Some(cache) = EnvCache::load(Path::new(&dir)) {
                if cache.toolchain_hash == hash {
                    vprintln!("  environment cache shared from {dir}");
                    return cache;
                }
            }
        }
    }
    match EnvCache::load(&pkg.build_base) {
        Some(cache) if cache.toolchain_hash == hash => cache,
        _ => EnvCache::new(hash),
    }
}

/// The orchestrator for this recursion level, forwarding the global flags
/// that apply one level down. The build directory is deliberately not
/// forwarded: each sub-package builds into its own tree.
fn orchestrator_for(cli: &Cli, pkg: &ResolvedPackage) -> Result<Orchestrator> {
    let program = std::env::current_exe().context("failed to locate the baryon executable")?;
    let mut common_args = Vec::new();
    if cli.quiet {
        common_args.push("--quiet".to_string());
    }
    if cli.verbose {
        common_args.push("--verbose".to_string());
    }
    if cli.local_install {
        common_args.push("--local-install".to_string());
    }
    if cli.parallel {
        common_args.push("--parallel".to_string());
    }
    if let Some(jobs) = cli.jobs {
        common_args.push(format!("--jobs={jobs}"));
    }
    if cli.force {
        common_args.push("--force".to_string());
    }
    Ok(Orchestrator {
        program,
        program_args: Vec::new(),
        build_base: pkg.build_base.clone(),
        common_args,
        sublevel: cli.sublevel,
    })
}

/// Run `verb` across the package's sub-packages, if any. `extra_args` are
/// verb-specific flags forwarded only for this invocation (e.g. the
/// install prefix).
fn run_subpackages(
    cli: &Cli,
    pkg: &ResolvedPackage,
    verb: &str,
    quit_on_error: bool,
    extra_args: &[String],
) -> Result<bool> {
    if !pkg.has_subpackages() {
        return Ok(false);
    }
    let mut orch = orchestrator_for(cli, pkg)?;
    orch.common_args.extend(extra_args.iter().cloned());
    let jobs = Orchestrator::jobs_from(pkg);
    orch.process_subpackages(
        verb,
        &jobs,
        cli.parallel || pkg.manifest.parallel,
        cli.jobs.unwrap_or(0),
        quit_on_error,
    )
}

/// Shared build logic used by the build, install, and test commands.
///
/// Returns the loaded package, the populated cache, and whether any
/// sub-package failed (with deferred aggregation).
fn do_build(cli: &Cli) -> Result<(ResolvedPackage, EnvCache, bool)> {
    let pkg = load_package(cli)?;
    let mut cache = prepare_cache(&pkg, cli.sublevel, cli.force);

    // Prerequisites resolve once, at the top of the recursion; nested
    // invocations inherit the shared cache instead of re-probing.
    if cli.sublevel == 0 {
        let _t = verbose::Timer::start("prerequisite resolution");
        let mut registry = probes::build_registry(&pkg.manifest)?;
        let opts = resolver::ResolveOptions {
            skip: false,
            install: true,
            local_install: cli.local_install,
        };
        resolver::configure_system(&pkg, &mut registry, &mut cache, &opts)?;
    }

    let failed = run_subpackages(cli, &pkg, "build", pkg.manifest.quit_on_error, &[])?;

    if pkg.has_native_work() {
        let mut ctx = pipeline::BuildContext {
            pkg: &pkg,
            cache: &mut cache,
        };
        let (ran, total) = pipeline::run_pipeline(&mut ctx)?;
        cache.save(&pkg.build_base)?;
        dprintln!("\nBuild complete. ({ran} of {total} steps run)");
    } else if !pkg.has_subpackages() {
        dprintln!("Nothing to build.");
    }

    Ok((pkg, cache, failed))
}

// ===========================================================================
// Commands
// ===========================================================================

fn cmd_build(cli: &Cli) -> Result<()> {
    let (pkg, _cache, failed) = do_build(cli)?;
    if failed {
        return Err(FatalError::new(format!(
            "sub-package build(s) failed; see logs in {}",
            pkg.build_base.display()
        ))
        .into());
    }
    Ok(())
}

fn cmd_install(cli: &Cli, args: &cli::InstallArgs) -> Result<()> {
    let (pkg, _cache, build_failed) = do_build(cli)?;

    // Resolve the prefix to an absolute path before recursing: children
    // run in their own directories and install into the same tree.
    let prefix = match (&args.prefix, cli.local_install) {
        (Some(prefix), _) if prefix.is_absolute() => prefix.clone(),
        (Some(prefix), _) => std::env::current_dir()?.join(prefix),
        (None, true) => pkg.root.join("local"),
        (None, false) => {
            return Err(FatalError::new(
                "an install prefix is required: pass --prefix <dir> or --local-install",
            )
            .into());
        }
    };

    let prefix_args = vec!["--prefix".to_string(), prefix.display().to_string()];
    let install_failed = run_subpackages(
        cli,
        &pkg,
        "install",
        pkg.manifest.quit_on_error,
        &prefix_args,
    )?;

    install_products(&pkg, &prefix)?;
    dprintln!("Installed into {}", prefix.display());

    if build_failed || install_failed {
        return Err(FatalError::new("sub-package install(s) failed").into());
    }
    Ok(())
}

/// Copy build products into the installation prefix.
fn install_products(pkg: &ResolvedPackage, prefix: &Path) -> Result<()> {
    let copies: &[(&str, &str)] = &[("lib", "lib"), ("scripts", "bin"), ("bin", "bin")];
    for (src_name, dest_name) in copies {
        let src = pkg.build_base.join(src_name);
        if src.is_dir() {
            let dest = prefix.join(dest_name);
            steps::modules::copy_tree(&src, &dest)
                .with_context(|| format!("failed to install {}", src.display()))?;
        }
    }
    Ok(())
}

fn cmd_clean(cli: &Cli) -> Result<()> {
    let pkg = load_package(cli)?;

    // Sub-package cleaning never aborts the sweep, discards child output,
    // and never touches prerequisites.
    if pkg.has_subpackages() {
        let orch = orchestrator_for(cli, &pkg)?;
        let jobs = Orchestrator::jobs_from(&pkg);
        orch.process_subpackages(
            "clean",
            &jobs,
            cli.parallel || pkg.manifest.parallel,
            cli.jobs.unwrap_or(0),
            false,
        )?;
    }

    if pkg.build_base.exists() {
        std::fs::remove_dir_all(&pkg.build_base)
            .with_context(|| format!("failed to remove {}", pkg.build_base.display()))?;
        dprintln!("Removed {}", pkg.build_base.display());
    } else {
        dprintln!("Nothing to clean.");
    }

    for path in &pkg.manifest.generated {
        let path = pkg.root.join(path);
        if path.is_dir() {
            let _ = std::fs::remove_dir_all(&path);
        } else {
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(())
}

fn cmd_test(cli: &Cli, args: &cli::TestArgs) -> Result<()> {
    let (pkg, _cache, build_failed) = do_build(cli)?;
    if build_failed {
        return Err(FatalError::new("sub-package build(s) failed").into());
    }

    let sub_failed = run_subpackages(cli, &pkg, "test", pkg.manifest.quit_on_error, &[])?;

    let mut passed = 0;
    let mut failed: Vec<String> = Vec::new();
    if pkg.has_tests() {
        dprintln!("\nRunning {} test command(s)...", pkg.manifest.tests.len());
        for test in &pkg.manifest.tests {
            let Some((program, prog_args)) = test.command.split_first() else {
                failed.push(test.name.clone());
                continue;
            };
            dprintln!("  Running test {} ...", test.name);
            let status = ProcessCommand::new(program)
                .args(prog_args)
                .args(&args.extra_args)
                .current_dir(&pkg.root)
                .env("BARYON_BUILD_BASE", &pkg.build_base)
                .env("BARYON_BUILD_LIB", pkg.build_base.join("lib"))
                .status()
                .with_context(|| format!("failed to run test '{}'", test.name))?;
            if status.success() {
                dprintln!("  {}: ok", test.name);
                passed += 1;
            } else {
                dprintln!("  {}: FAILED", test.name);
                failed.push(test.name.clone());
            }
        }
        dprintln!("\nTest results: {} passed, {} failed", passed, failed.len());
    }

    if !failed.is_empty() {
        for name in &failed {
            dprintln!("  - {name}");
        }
        anyhow::bail!("{} test(s) failed", failed.len());
    }
    if sub_failed {
        return Err(FatalError::new("sub-package test(s) failed").into());
    }
    Ok(())
}

fn cmd_dependencies(cli: &Cli, args: &cli::DepsArgs) -> Result<()> {
    let pkg = load_package(cli)?;
    let mut registry = probes::build_registry(&pkg.manifest)?;

    // Resolve in skip mode: the depth-first walk records every
    // prerequisite name without probing, installing, or touching the
    // network, and never persists anything.
    let mut cache = EnvCache::new(environ::toolchain_hash());
    let opts = resolver::ResolveOptions {
        skip: true,
        install: false,
        local_install: cli.local_install,
    };
    resolver::configure_system(&pkg, &mut registry, &mut cache, &opts)?;

    let mut prereqs: Vec<String> = Vec::new();
    let mut sub_deps: BTreeMap<String, Vec<String>> = BTreeMap::new();

    if pkg.has_subpackages() {
        let orch = orchestrator_for(cli, &pkg)?;
        for job in Orchestrator::jobs_from(&pkg) {
            let deps = orch
                .collect_subpackage_deps(std::slice::from_ref(&job), args.show_subpackages)?;
            for dep in &deps {
                if !prereqs.contains(dep) {
                    prereqs.push(dep.clone());
                }
            }
            sub_deps.insert(job.name, deps);
        }
    }

    for name in &cache.prerequisites {
        if !prereqs.contains(name) {
            prereqs.push(name.clone());
        }
    }

    if args.graph {
        let dag = resolver::dependency_graph(&pkg, &registry, &sub_deps)?;
        println!("{dag}");
    }

    // The machine-readable contract line parents parse from our stdout.
    let list = if prereqs.is_empty() {
        "None".to_string()
    } else {
        prereqs.join(",")
    };
    println!("{}{}", orchestrate::DEPS_TOKEN, list);
    Ok(())
}
