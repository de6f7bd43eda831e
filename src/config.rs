//! Manifest parsing and resolution for baryon.
//!
//! Parses `baryon.toml` from the package root: project metadata, the
//! package namespace tree, prerequisite declarations, sub-package
//! descriptors, and the capability sections that gate the build pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::fatal::FatalError;
use crate::tree::{Node, Tree};

/// Manifest filename marking a package root.
pub const MANIFEST_FILE: &str = "baryon.toml";

/// Top-level configuration loaded from `baryon.toml`.
#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub project: ProjectMeta,
    /// Nested-array literal describing the package namespace.
    #[serde(default, rename = "package-tree")]
    pub package_tree: Option<toml::Value>,
    /// Seed facts merged into the environment at lowest precedence.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Ordered list of required prerequisites.
    #[serde(default)]
    pub prerequisites: Vec<PrereqEntry>,
    /// Probe declarations, keyed by prerequisite name.
    #[serde(default)]
    pub probes: BTreeMap<String, ProbeDef>,
    #[serde(default)]
    pub subpackages: Vec<SubpackageDef>,
    #[serde(default)]
    pub sources: Vec<SourceTemplate>,
    #[serde(default)]
    pub modules: Vec<ModuleDef>,
    #[serde(default, rename = "web-extensions")]
    pub web_extensions: Vec<WebExtensionDef>,
    #[serde(default)]
    pub libraries: Vec<LibraryDef>,
    #[serde(default)]
    pub extensions: Vec<ExtensionDef>,
    #[serde(default, rename = "pypp-extensions")]
    pub pypp_extensions: Vec<GeneratedExtensionDef>,
    #[serde(default)]
    pub scripts: Vec<ScriptDef>,
    #[serde(default)]
    pub documents: Vec<DocumentDef>,
    #[serde(default)]
    pub executables: Vec<ExecutableDef>,
    #[serde(default)]
    pub tests: Vec<TestDef>,
    /// Files and directories removed by `clean` beyond the build base.
    #[serde(default)]
    pub generated: Vec<PathBuf>,
    /// Abort the whole run on the first failing sub-package.
    #[serde(default = "default_true", rename = "quit-on-error")]
    pub quit_on_error: bool,
    /// Dispatch sub-package builds concurrently.
    #[serde(default)]
    pub parallel: bool,
}

fn default_true() -> bool {
    true
}

/// `[project]` section.
#[derive(Debug, Deserialize)]
pub struct ProjectMeta {
    pub name: String,
    pub version: String,
    /// Semver requirement on the orchestrator itself.
    #[serde(default, rename = "requires-baryon")]
    pub requires_baryon: Option<String>,
}

/// An entry of the ordered `prerequisites` list: a bare name, or a name
/// with a minimum version.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PrereqEntry {
    Name(String),
    Versioned { name: String, version: String },
}

impl PrereqEntry {
    pub fn name(&self) -> &str {
        match self {
            PrereqEntry::Name(name) => name,
            PrereqEntry::Versioned { name, .. } => name,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            PrereqEntry::Name(_) => None,
            PrereqEntry::Versioned { version, .. } => Some(version),
        }
    }
}

/// What kind of artifact a probe looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Library,
    Program,
}

/// `[probes.<name>]` — how to detect and locally install a prerequisite.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeDef {
    pub kind: ProbeKind,
    /// Library base name (`gsl` finds `libgsl.so`/`libgsl.a`).
    pub lib: Option<String>,
    /// Header path proving the development files are present.
    pub header: Option<String>,
    /// Executable name for program probes.
    pub exe: Option<String>,
    /// Prerequisites that must resolve before this one.
    #[serde(default)]
    pub depends: Vec<String>,
    /// Source archive for the local-install fallback (gzipped tar).
    #[serde(default, rename = "archive-url")]
    pub archive_url: Option<String>,
    /// Commands run inside the unpacked archive to build it.
    #[serde(default, rename = "build-commands")]
    pub build_commands: Vec<String>,
}

/// `[[subpackages]]` — a nested project with its own build entry point.
#[derive(Debug, Clone, Deserialize)]
pub struct SubpackageDef {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// `[[sources]]` — a `.in` template expanded by `build_src`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceTemplate {
    pub path: PathBuf,
}

/// `[[modules]]` — a namespace node whose source tree is staged by
/// `build_py`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleDef {
    pub name: String,
    pub path: PathBuf,
}

/// `[[web-extensions]]` — front ends produced by an external transpiler.
#[derive(Debug, Clone, Deserialize)]
pub struct WebExtensionDef {
    pub name: String,
    pub command: Vec<String>,
}

/// Native library linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryKind {
    Static,
    Shared,
}

impl Default for LibraryKind {
    fn default() -> Self {
        Self::Static
    }
}

/// `[[libraries]]` — a native library built from C sources.
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryDef {
    pub name: String,
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub kind: LibraryKind,
    #[serde(default, rename = "include-dirs")]
    pub include_dirs: Vec<PathBuf>,
}

/// `[[extensions]]` — a loadable extension module (shared object).
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionDef {
    pub name: String,
    pub sources: Vec<PathBuf>,
    #[serde(default, rename = "include-dirs")]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub libs: Vec<String>,
}

/// `[[pypp-extensions]]` — an extension whose sources are produced by a
/// generator command first.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedExtensionDef {
    pub name: String,
    pub generator: Vec<String>,
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    #[serde(default, rename = "include-dirs")]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub libs: Vec<String>,
}

/// `[[scripts]]` — an executable wrapper written to `build/scripts`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptDef {
    pub name: String,
    pub command: String,
}

/// `[[documents]]` — documentation produced by an external builder.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentDef {
    pub name: String,
    pub builder: Vec<String>,
    #[serde(rename = "source-dir")]
    pub source_dir: PathBuf,
}

/// `[[executables]]` — a native executable linked against built libraries.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutableDef {
    pub name: String,
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub libs: Vec<String>,
    #[serde(default, rename = "include-dirs")]
    pub include_dirs: Vec<PathBuf>,
}

/// `[[tests]]` — a test command run by the `test` verb after building.
#[derive(Debug, Clone, Deserialize)]
pub struct TestDef {
    pub name: String,
    pub command: Vec<String>,
}

/// A fully loaded package: manifest plus derived name hierarchies.
#[derive(Debug)]
pub struct ResolvedPackage {
    pub root: PathBuf,
    pub build_base: PathBuf,
    pub manifest: Manifest,
    pub tree: Option<Tree>,
    /// Node → dot-joined path from the namespace root (`app.util.fmt`).
    pub names: BTreeMap<String, String>,
    /// Node → underscore-joined path (`app_util_fmt`), used for artifacts.
    pub package_names: BTreeMap<String, String>,
    /// Node → parent node, `None` for the namespace root.
    pub parents: BTreeMap<String, Option<String>>,
    /// Node → full chain of values from the root down to the node.
    pub hierarchy: BTreeMap<String, Vec<String>>,
}

impl ResolvedPackage {
    pub fn has_sources(&self) -> bool {
        !self.manifest.sources.is_empty()
    }

    pub fn has_modules(&self) -> bool {
        !self.manifest.modules.is_empty()
    }

    pub fn has_web_extensions(&self) -> bool {
        !self.manifest.web_extensions.is_empty()
    }

    pub fn has_c_libraries(&self) -> bool {
        self.manifest
            .libraries
            .iter()
            .any(|l| l.kind == LibraryKind::Static)
    }

    pub fn has_shared_libraries(&self) -> bool {
        self.manifest
            .libraries
            .iter()
            .any(|l| l.kind == LibraryKind::Shared)
    }

    pub fn has_extensions(&self) -> bool {
        !self.manifest.extensions.is_empty()
    }

    pub fn has_pypp_extensions(&self) -> bool {
        !self.manifest.pypp_extensions.is_empty()
    }

    pub fn has_scripts(&self) -> bool {
        !self.manifest.scripts.is_empty()
    }

    pub fn has_documents(&self) -> bool {
        !self.manifest.documents.is_empty()
    }

    pub fn has_executables(&self) -> bool {
        !self.manifest.executables.is_empty()
    }

    pub fn has_tests(&self) -> bool {
        !self.manifest.tests.is_empty()
    }

    pub fn has_subpackages(&self) -> bool {
        !self.manifest.subpackages.is_empty()
    }

    /// Whether any pipeline step beyond compiler discovery would run.
    pub fn has_native_work(&self) -> bool {
        self.has_sources()
            || self.has_modules()
            || self.has_web_extensions()
            || self.has_c_libraries()
            || self.has_shared_libraries()
            || self.has_extensions()
            || self.has_pypp_extensions()
            || self.has_scripts()
            || self.has_documents()
            || self.has_executables()
    }

    /// Seed facts merged at lowest precedence: package identity plus the
    /// manifest's `[environment]` section.
    pub fn seed_environment(&self) -> crate::environ::Environment {
        use crate::environ::EnvValue;
        let mut env = crate::environ::Environment::new();
        let version = &self.manifest.project.version;
        // VERSION is the major.minor prefix; RELEASE the full string.
        let short = match version.rfind('.') {
            Some(idx) => &version[..idx],
            None => version.as_str(),
        };
        if let Some(tree) = &self.tree {
            env.insert("PACKAGE", EnvValue::Str(tree.root().to_string()));
        } else {
            env.insert(
                "PACKAGE",
                EnvValue::Str(self.manifest.project.name.clone()),
            );
        }
        env.insert("NAME", EnvValue::Str(self.manifest.project.name.clone()));
        env.insert("VERSION", EnvValue::Str(short.to_string()));
        env.insert("RELEASE", EnvValue::Str(version.clone()));
        for (key, value) in &self.manifest.environment {
            env.insert(key.clone(), EnvValue::Str(value.clone()));
        }
        env
    }
}

/// Find the package root by looking for `baryon.toml` in the current
/// directory and its parents.
pub fn find_project_root() -> Result<PathBuf> {
    let mut dir = std::env::current_dir()?;
    loop {
        if dir.join(MANIFEST_FILE).exists() {
            return Ok(dir);
        }
        if !dir.pop() {
            bail!("could not find {MANIFEST_FILE} in any parent directory");
        }
    }
}

/// Load and resolve the package rooted at `root`.
pub fn load_package(root: &Path, build_base_override: Option<&Path>) -> Result<ResolvedPackage> {
    let manifest_path = root.join(MANIFEST_FILE);
    let contents = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest = parse_manifest(&contents)?;
    resolve_package(root, manifest, build_base_override)
}

/// Parse and sanity-check a manifest.
pub fn parse_manifest(contents: &str) -> Result<Manifest> {
    let manifest: Manifest =
        toml::from_str(contents).context("failed to parse baryon.toml")?;

    if manifest.project.name.is_empty() {
        bail!("project name is required");
    }
    if manifest.project.version.is_empty() {
        bail!("project version is required");
    }
    check_orchestrator_version(&manifest)?;

    for (name, probe) in &manifest.probes {
        match probe.kind {
            ProbeKind::Library => {
                if probe.lib.is_none() || probe.header.is_none() {
                    bail!("library probe '{name}' requires both 'lib' and 'header'");
                }
            }
            ProbeKind::Program => {
                if probe.exe.is_none() {
                    bail!("program probe '{name}' requires 'exe'");
                }
            }
        }
    }

    Ok(manifest)
}

/// Enforce the manifest's `requires-baryon` floor against the running
/// binary. A violation is fatal: building with the wrong orchestrator
/// would mis-resolve everything downstream.
fn check_orchestrator_version(manifest: &Manifest) -> Result<()> {
    let Some(req_str) = &manifest.project.requires_baryon else {
        return Ok(());
    };
    let req = semver::VersionReq::parse(req_str)
        .with_context(|| format!("invalid requires-baryon requirement '{req_str}'"))?;
    let current = semver::Version::parse(env!("CARGO_PKG_VERSION"))
        .context("invalid orchestrator version")?;
    if !req.matches(&current) {
        return Err(FatalError::new(format!(
            "baryon {req} is required by this package; you are running {current}"
        ))
        .into());
    }
    Ok(())
}

fn resolve_package(
    root: &Path,
    manifest: Manifest,
    build_base_override: Option<&Path>,
) -> Result<ResolvedPackage> {
    // Relative overrides anchor at the package root, so every recursion
    // level resolves its own build tree regardless of the caller's cwd.
    let build_base = match build_base_override {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => root.join(dir),
        None => root.join("build"),
    };

    let tree = match &manifest.package_tree {
        Some(value) => Some(Tree::new(Node::from_toml(value)?)?),
        None => None,
    };

    let mut names = BTreeMap::new();
    let mut package_names = BTreeMap::new();
    let mut parents = BTreeMap::new();
    let mut hierarchy = BTreeMap::new();
    if let Some(tree) = &tree {
        for node in tree.flatten() {
            let chain = tree.path_to(&node)?;
            names.insert(node.clone(), chain.join("."));
            package_names.insert(node.clone(), chain.join("_"));
            parents.insert(
                node.clone(),
                tree.parent(&node)?.map(str::to_string),
            );
            hierarchy.insert(node.clone(), chain);
        }
    }

    for module in &manifest.modules {
        if !tree.as_ref().is_some_and(|t| t.contains(&module.name)) {
            bail!(
                "module '{}' is not a node of the package tree",
                module.name
            );
        }
    }

    for sub in &manifest.subpackages {
        let entry = root.join(&sub.path).join(MANIFEST_FILE);
        if !entry.exists() {
            bail!(
                "subpackage '{}' has no build entry point: {} not found",
                sub.name,
                entry.display()
            );
        }
    }

    Ok(ResolvedPackage {
        root: root.to_path_buf(),
        build_base,
        manifest,
        tree,
        names,
        package_names,
        parents,
        hierarchy,
    })
}
