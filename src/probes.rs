//! Prerequisite probes: detection and local installation of third-party
//! libraries and programs.
//!
//! Each prerequisite name maps to a boxed [`Probe`] in an explicit
//! registry, populated from built-in entries plus the manifest's
//! `[probes.<name>]` declarations. Probing records discovered facts
//! (include/lib directories, executable paths) into a private environment
//! that the resolver merges into the shared cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};

use crate::config::{Manifest, ProbeDef, ProbeKind};
use crate::environ::{EnvValue, Environment};
use crate::verbose::vprintln;

/// Filesystem prefixes searched when nothing narrows the location.
const DEFAULT_PREFIXES: &[&str] = &["/usr", "/usr/local", "/opt/local", "/opt/homebrew"];

/// Context handed to probes for the install path.
pub struct InstallContext<'a> {
    pub build_base: &'a Path,
    /// Prefer an in-tree prefix over any system-wide location.
    pub local_install: bool,
    /// Extra directories already known to hold locally built software.
    pub search_paths: &'a [PathBuf],
}

impl InstallContext<'_> {
    /// The in-tree prefix where locally built prerequisites land.
    pub fn prefix(&self) -> PathBuf {
        self.build_base.join("prereqs")
    }
}

/// A polymorphic prerequisite configuration.
pub trait Probe {
    fn name(&self) -> &str;

    /// Prerequisites that must be resolved before this one.
    fn dependencies(&self) -> &[String];

    /// Check presence, recording discovered facts on success.
    fn is_installed(&mut self, env: &Environment, version: Option<&str>, ctx: &InstallContext)
    -> bool;

    /// Install the prerequisite locally. Returns a search path to add for
    /// the re-probe, if one was created.
    fn install(&mut self, version: Option<&str>, ctx: &InstallContext)
    -> Result<Option<PathBuf>>;

    /// Record this probe's fact keys with empty values instead of probing.
    /// Used by `clean` and `dependencies`, which must not touch the network.
    fn null(&mut self);

    /// Facts discovered by the last successful probe (or nulled).
    fn environment(&self) -> &Environment;
}

// ---------------------------------------------------------------------------
// Library probe
// ---------------------------------------------------------------------------

/// Detects a native library by header + `lib<name>` file.
pub struct LibraryProbe {
    name: String,
    lib: String,
    header: String,
    depends: Vec<String>,
    archive_url: Option<String>,
    build_commands: Vec<String>,
    env: Environment,
}

impl LibraryProbe {
    pub fn new(
        name: impl Into<String>,
        lib: impl Into<String>,
        header: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            lib: lib.into(),
            header: header.into(),
            depends: Vec::new(),
            archive_url: None,
            build_commands: Vec::new(),
            env: Environment::new(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}_{}", self.lib.to_uppercase(), suffix)
    }

    /// Candidate locations, narrowest first. When the environment already
    /// pins a lib dir, the search is limited to it.
    fn locations(&self, env: &Environment, ctx: &InstallContext) -> (Vec<PathBuf>, bool) {
        let mut locations = Vec::new();

        if let Some(dir) = env.get_path(&self.key("LIB_DIR")) {
            locations.push(dir.to_path_buf());
            if let Some(incl) = env.get_path(&self.key("INCLUDE_DIR")) {
                locations.push(incl.to_path_buf());
            }
            return (locations, true);
        }

        // --local-install narrows resolution to in-tree locations.
        if !ctx.local_install {
            for var in ["LD_LIBRARY_PATH", "CPATH"] {
                if let Ok(paths) = std::env::var(var) {
                    locations.extend(std::env::split_paths(&paths));
                }
            }
            if let Ok(root) = std::env::var(format!("{}_ROOT", self.lib.to_uppercase())) {
                locations.push(PathBuf::from(root));
            }
        }
        locations.extend(ctx.search_paths.iter().cloned());
        locations.push(ctx.prefix());
        if !ctx.local_install {
            locations.extend(DEFAULT_PREFIXES.iter().map(PathBuf::from));
        }
        (locations, false)
    }
}

impl Probe for LibraryProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.depends
    }

    fn is_installed(
        &mut self,
        env: &Environment,
        _version: Option<&str>,
        ctx: &InstallContext,
    ) -> bool {
        let (locations, limited) = self.locations(env, ctx);
        vprintln!(
            "  searching {} location(s) for lib{} (limited: {limited})",
            locations.len(),
            self.lib
        );

        let Some(incl_dir) = find_header(&self.header, &locations) else {
            return false;
        };
        let Some((lib_dir, lib_file)) = find_library(&self.lib, &locations) else {
            return false;
        };

        self.env.insert(self.key("INCLUDE_DIR"), EnvValue::Path(incl_dir));
        self.env.insert(self.key("LIB_DIR"), EnvValue::Path(lib_dir));
        self.env
            .insert(self.key("LIB_FILES"), EnvValue::List(vec![lib_file]));
        self.env
            .insert(self.key("LIBRARIES"), EnvValue::List(vec![self.lib.clone()]));
        true
    }

    fn install(&mut self, version: Option<&str>, ctx: &InstallContext) -> Result<Option<PathBuf>> {
        let Some(url) = self.archive_url.clone() else {
            bail!(
                "no installer defined for library '{}'; install it manually",
                self.name
            );
        };
        let url = match version {
            Some(v) => url.replace("{version}", v),
            None => url,
        };
        let prefix = ctx.prefix();
        let unpacked = fetch_archive(&url, &prefix)
            .with_context(|| format!("failed to fetch '{}'", self.name))?;
        run_build_commands(&self.build_commands, &unpacked, &prefix)
            .with_context(|| format!("failed to build '{}'", self.name))?;
        Ok(Some(prefix))
    }

    fn null(&mut self) {
        for suffix in ["INCLUDE_DIR", "LIB_DIR", "LIB_FILES", "LIBRARIES"] {
            self.env.insert(self.key(suffix), EnvValue::Str(String::new()));
        }
    }

    fn environment(&self) -> &Environment {
        &self.env
    }
}

// ---------------------------------------------------------------------------
// Program probe
// ---------------------------------------------------------------------------

/// Detects an executable on the search path, with an optional minimum
/// version parsed from `--version` output.
pub struct ProgramProbe {
    name: String,
    exe: String,
    depends: Vec<String>,
    env: Environment,
}

impl ProgramProbe {
    pub fn new(name: impl Into<String>, exe: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exe: exe.into(),
            depends: Vec::new(),
            env: Environment::new(),
        }
    }

    fn key(&self) -> String {
        self.exe.to_uppercase().replace('-', "_")
    }
}

impl Probe for ProgramProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.depends
    }

    fn is_installed(
        &mut self,
        env: &Environment,
        version: Option<&str>,
        ctx: &InstallContext,
    ) -> bool {
        let mut extra: Vec<PathBuf> = Vec::new();
        if let Some(known) = env.get_path(&self.key()) {
            if let Some(dir) = known.parent() {
                extra.push(dir.to_path_buf());
            }
        }
        if let Ok(root) = std::env::var(format!("{}_ROOT", self.key())) {
            extra.push(PathBuf::from(root));
        }
        extra.extend(ctx.search_paths.iter().cloned());

        let Some(program) = find_program(&self.exe, &extra) else {
            return false;
        };

        if let Some(min) = version {
            match probe_program_version(&program) {
                Some(found) => {
                    if compare_versions(&found, min) == std::cmp::Ordering::Less {
                        vprintln!(
                            "  found {} v.{found}, but v.{min} is required",
                            self.exe
                        );
                        return false;
                    }
                    self.env
                        .insert(format!("{}_VERSION", self.key()), EnvValue::Str(found));
                }
                None => {
                    // Unparseable version output is treated as absent: the
                    // install path can produce a known-good copy.
                    vprintln!("  could not determine {} version", self.exe);
                    return false;
                }
            }
        }

        self.env.insert(self.key(), EnvValue::Path(program));
        true
    }

    fn install(&mut self, _version: Option<&str>, _ctx: &InstallContext) -> Result<Option<PathBuf>> {
        bail!(
            "no installer defined for program '{}'; install it manually",
            self.name
        );
    }

    fn null(&mut self) {
        self.env.insert(self.key(), EnvValue::Str(String::new()));
    }

    fn environment(&self) -> &Environment {
        &self.env
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Probe registry keyed by prerequisite name.
pub type Registry = BTreeMap<String, Box<dyn Probe>>;

/// Built-in probes for commonly required software; manifest declarations
/// with the same name take precedence.
fn builtin_probes() -> Vec<(&'static str, Box<dyn Probe>)> {
    vec![
        ("zlib", Box::new(LibraryProbe::new("zlib", "z", "zlib.h"))),
        ("make", Box::new(ProgramProbe::new("make", "make"))),
        (
            "pkg-config",
            Box::new(ProgramProbe::new("pkg-config", "pkg-config")),
        ),
        ("curl", Box::new(ProgramProbe::new("curl", "curl"))),
    ]
}

/// Build the probe registry from builtins plus manifest declarations.
pub fn build_registry(manifest: &Manifest) -> Result<Registry> {
    let mut registry: Registry = BTreeMap::new();
    for (name, probe) in builtin_probes() {
        registry.insert(name.to_string(), probe);
    }
    for (name, def) in &manifest.probes {
        registry.insert(name.clone(), probe_from_def(name, def)?);
    }
    Ok(registry)
}

fn probe_from_def(name: &str, def: &ProbeDef) -> Result<Box<dyn Probe>> {
    match def.kind {
        ProbeKind::Library => {
            let lib = def
                .lib
                .as_ref()
                .with_context(|| format!("library probe '{name}' missing 'lib'"))?;
            let header = def
                .header
                .as_ref()
                .with_context(|| format!("library probe '{name}' missing 'header'"))?;
            let mut probe = LibraryProbe::new(name, lib, header);
            probe.depends = def.depends.clone();
            probe.archive_url = def.archive_url.clone();
            probe.build_commands = def.build_commands.clone();
            Ok(Box::new(probe))
        }
        ProbeKind::Program => {
            let exe = def
                .exe
                .as_ref()
                .with_context(|| format!("program probe '{name}' missing 'exe'"))?;
            let mut probe = ProgramProbe::new(name, exe);
            probe.depends = def.depends.clone();
            Ok(Box::new(probe))
        }
    }
}

// ---------------------------------------------------------------------------
// Search helpers
// ---------------------------------------------------------------------------

/// Find an executable by name on `PATH` plus the given extra directories
/// (and their `bin/` subdirectories).
pub fn find_program(name: &str, extra: &[PathBuf]) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for dir in extra {
        dirs.push(dir.clone());
        dirs.push(dir.join("bin"));
    }
    if let Ok(path_env) = std::env::var("PATH") {
        dirs.extend(std::env::split_paths(&path_env));
    }
    for dir in dirs {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Find the directory containing a header, trying each location directly
/// and its `include/` subdirectory.
pub fn find_header(header: &str, locations: &[PathBuf]) -> Option<PathBuf> {
    for loc in locations {
        for dir in [loc.clone(), loc.join("include")] {
            if dir.join(header).is_file() {
                return Some(dir);
            }
        }
    }
    None
}

/// Find a `lib<name>` library file, returning its directory and filename.
pub fn find_library(name: &str, locations: &[PathBuf]) -> Option<(PathBuf, String)> {
    let stems = [
        format!("lib{name}.so"),
        format!("lib{name}.a"),
        format!("lib{name}.dylib"),
    ];
    for loc in locations {
        for dir in [loc.clone(), loc.join("lib"), loc.join("lib64")] {
            for stem in &stems {
                if dir.join(stem).is_file() {
                    return Some((dir, stem.clone()));
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Version helpers
// ---------------------------------------------------------------------------

/// Extract the first dotted numeric token from `<program> --version`.
fn probe_program_version(program: &Path) -> Option<String> {
    let output = Command::new(program).arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_version_token(&text)
}

/// Pull the first `x.y[.z...]` token out of free-form version output.
pub fn parse_version_token(text: &str) -> Option<String> {
    for token in text.split_whitespace() {
        let trimmed = token.trim_matches(|c: char| !c.is_ascii_digit() && c != '.');
        if trimmed.contains('.')
            && trimmed.chars().all(|c| c.is_ascii_digit() || c == '.')
            && trimmed.chars().any(|c| c.is_ascii_digit())
        {
            return Some(trimmed.to_string());
        }
    }
    None
}

/// Numeric-aware comparison of dotted version strings.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (va, vb) = (parse(a), parse(b));
    let len = va.len().max(vb.len());
    for i in 0..len {
        let (x, y) = (
            va.get(i).copied().unwrap_or(0),
            vb.get(i).copied().unwrap_or(0),
        );
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

// ---------------------------------------------------------------------------
// Archive fetching
// ---------------------------------------------------------------------------

/// Download a gzipped tar archive with `curl` and unpack it under `dest`.
/// Returns the unpacked top-level directory.
pub fn fetch_archive(url: &str, dest: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;

    let output = Command::new("curl")
        .args(["-fsSL", url])
        .output()
        .context("failed to run curl")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("download failed for {url}: {stderr}");
    }

    // First pass over the entry list to learn the top-level directory.
    let decoder = flate2::read::GzDecoder::new(&output.stdout[..]);
    let mut archive = tar::Archive::new(decoder);
    let mut top: Option<PathBuf> = None;
    for entry in archive.entries().context("unreadable archive")? {
        let entry = entry?;
        let path = entry.path()?;
        if let Some(first) = path.components().next() {
            top = Some(PathBuf::from(first.as_os_str()));
            break;
        }
    }
    let top = top.with_context(|| format!("empty archive from {url}"))?;

    let decoder = flate2::read::GzDecoder::new(&output.stdout[..]);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest)
        .with_context(|| format!("failed to unpack archive into {}", dest.display()))?;

    Ok(dest.join(top))
}

/// Run the declared build commands inside the unpacked source directory,
/// with `$PREFIX` pointing at the local install prefix.
fn run_build_commands(commands: &[String], cwd: &Path, prefix: &Path) -> Result<()> {
    for command in commands {
        vprintln!("  running `{command}` in {}", cwd.display());
        let status = Command::new("sh")
            .args(["-c", command])
            .current_dir(cwd)
            .env("PREFIX", prefix)
            .status()
            .with_context(|| format!("failed to run `{command}`"))?;
        if !status.success() {
            bail!("build command `{command}` failed with {status}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_token_from_typical_output() {
        assert_eq!(
            parse_version_token("GNU Make 4.3\nBuilt for x86_64").as_deref(),
            Some("4.3")
        );
        assert_eq!(
            parse_version_token("cmake version 3.22.1").as_deref(),
            Some("3.22.1")
        );
        assert_eq!(parse_version_token("no digits here"), None);
    }

    #[test]
    fn version_comparison_is_numeric() {
        use std::cmp::Ordering::*;
        assert_eq!(compare_versions("1.10", "1.9"), Greater);
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Equal);
        assert_eq!(compare_versions("1.2", "1.2.1"), Less);
        assert_eq!(compare_versions("2.0", "10.0"), Less);
    }

    #[test]
    fn find_header_checks_include_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let include = dir.path().join("include/gsl");
        std::fs::create_dir_all(&include).unwrap();
        std::fs::write(include.join("gsl_types.h"), "").unwrap();
        let found = find_header("gsl/gsl_types.h", &[dir.path().to_path_buf()]);
        assert_eq!(found, Some(dir.path().join("include")));
        assert_eq!(find_header("gsl/other.h", &[dir.path().to_path_buf()]), None);
    }

    #[test]
    fn find_library_checks_lib_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib64");
        std::fs::create_dir_all(&lib).unwrap();
        std::fs::write(lib.join("libgsl.a"), "").unwrap();
        let found = find_library("gsl", &[dir.path().to_path_buf()]);
        assert_eq!(found, Some((lib, "libgsl.a".to_string())));
    }

    #[test]
    fn library_probe_records_facts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("include")).unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("include/demo.h"), "").unwrap();
        std::fs::write(dir.path().join("lib/libdemo.so"), "").unwrap();

        let search = vec![dir.path().to_path_buf()];
        let ctx = InstallContext {
            build_base: dir.path(),
            local_install: false,
            search_paths: &search,
        };
        let mut probe = LibraryProbe::new("demo", "demo", "demo.h");
        assert!(probe.is_installed(&Environment::new(), None, &ctx));
        let env = probe.environment();
        assert_eq!(
            env.get_path("DEMO_INCLUDE_DIR"),
            Some(dir.path().join("include").as_path())
        );
        assert_eq!(
            env.get_path("DEMO_LIB_DIR"),
            Some(dir.path().join("lib").as_path())
        );
    }

    #[test]
    fn null_records_empty_facts() {
        let mut probe = LibraryProbe::new("demo", "demo", "demo.h");
        probe.null();
        assert!(probe.environment().contains("DEMO_LIB_DIR"));
        assert_eq!(probe.environment().get_str("DEMO_LIB_DIR"), Some(""));
    }

    #[test]
    fn registry_builtins_and_overrides() {
        let manifest = crate::config::parse_manifest(
            r#"
            [project]
            name = "demo"
            version = "1.0"
            [probes.zlib]
            kind = "program"
            exe = "zcat"
        "#,
        )
        .unwrap();
        let registry = build_registry(&manifest).unwrap();
        assert!(registry.contains_key("make"));
        // Manifest declaration replaces the builtin library probe.
        assert!(registry.contains_key("zlib"));
        assert!(registry.get("zlib").unwrap().dependencies().is_empty());
    }

    #[test]
    fn program_install_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = InstallContext {
            build_base: dir.path(),
            local_install: true,
            search_paths: &[],
        };
        let mut probe = ProgramProbe::new("make", "make");
        assert!(probe.install(None, &ctx).is_err());
    }
}
