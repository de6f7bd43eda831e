//! Prerequisite resolution: depth-first configuration of required software.
//!
//! Walks the manifest's ordered prerequisite list, resolving each entry's
//! declared dependencies before the entry itself, probing for presence and
//! installing what is missing. Discovered facts accumulate in the
//! environment cache, which is saved after every successful step so a
//! crash partway through loses nothing.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, bail};

use crate::config::ResolvedPackage;
use crate::environ::EnvCache;
use crate::fatal::FatalError;
use crate::graph::Dag;
use crate::probes::{InstallContext, Registry};
use crate::verbose::{dprint, dprintln};

/// How a resolution pass behaves.
pub struct ResolveOptions {
    /// Null out probes instead of running them. Used by `clean` and
    /// `dependencies`, which must not touch the network or install
    /// anything.
    pub skip: bool,
    /// Install missing prerequisites; when false a missing prerequisite is
    /// a fatal configuration error.
    pub install: bool,
    /// Prefer in-tree resolution over system locations.
    pub local_install: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            skip: false,
            install: true,
            local_install: false,
        }
    }
}

/// Verify and install every declared prerequisite, accumulating facts in
/// the cache.
///
/// Idempotent: a second run with nothing changed on disk reports every
/// prerequisite as found and performs no installation side effects.
pub fn configure_system(
    pkg: &ResolvedPackage,
    registry: &mut Registry,
    cache: &mut EnvCache,
    opts: &ResolveOptions,
) -> Result<()> {
    if !opts.skip {
        if cache.environment.is_empty() {
            dprintln!("CONFIGURE");
        } else {
            dprintln!("CONFIGURE  (from cache)");
        }
    }

    // Identity facts are re-derived from the manifest on every run and
    // override whatever an earlier run recorded.
    cache.environment.merge(pkg.seed_environment());

    let mut configured: BTreeSet<String> = BTreeSet::new();
    for entry in pkg.manifest.prerequisites.clone() {
        resolve_one(
            pkg,
            registry,
            cache,
            &mut configured,
            opts,
            entry.name(),
            entry.version(),
        )?;
    }
    if !opts.skip {
        cache.save(&pkg.build_base)?;
    }
    Ok(())
}

/// Resolve a single prerequisite, depth-first through its declared
/// dependencies. Diamonds are visited once via the `configured` set.
fn resolve_one(
    pkg: &ResolvedPackage,
    registry: &mut Registry,
    cache: &mut EnvCache,
    configured: &mut BTreeSet<String>,
    opts: &ResolveOptions,
    name: &str,
    version: Option<&str>,
) -> Result<()> {
    if !configured.insert(name.to_string()) {
        return Ok(());
    }

    let deps = match registry.get(name) {
        Some(probe) => probe.dependencies().to_vec(),
        None => {
            return Err(FatalError::new(format!(
                "no probe configuration for prerequisite '{name}'"
            ))
            .into());
        }
    };
    for dep in deps {
        resolve_one(pkg, registry, cache, configured, opts, &dep, None)?;
    }

    let probe = registry
        .get_mut(name)
        .expect("probe existence checked above");

    if opts.skip {
        // Record the probe's fact keys without probing, so downstream
        // consumers see a complete key set, but never clobber real facts
        // a previous full run discovered.
        probe.null();
        for (key, value) in probe.environment().iter() {
            if !cache.environment.contains(key) {
                cache.environment.insert(key.clone(), value.clone());
            }
        }
        cache.record_prerequisite(name);
        return Ok(());
    }

    match version {
        Some(v) => dprint!("Checking for {name} v.{v} ... "),
        None => dprint!("Checking for {name} ... "),
    }

    let search_paths = cache.local_search_paths.clone();
    let ctx = InstallContext {
        build_base: &pkg.build_base,
        local_install: opts.local_install,
        search_paths: &search_paths,
    };

    if probe.is_installed(&cache.environment, version, &ctx) {
        dprintln!("found");
    } else if !opts.install {
        dprintln!("not found");
        return Err(FatalError::new(format!("'{name}' cannot be found")).into());
    } else {
        dprintln!("not found");
        dprintln!("Installing {name} ...");
        let added = probe
            .install(version, &ctx)
            .with_context(|| format!("failed to install '{name}'"))?;
        if let Some(path) = added {
            cache.add_search_path(path);
        }
        let search_paths = cache.local_search_paths.clone();
        let ctx = InstallContext {
            build_base: &pkg.build_base,
            local_install: opts.local_install,
            search_paths: &search_paths,
        };
        if !probe.is_installed(&cache.environment, version, &ctx) {
            bail!("'{name}' installation failed");
        }
    }

    // Most-recently-resolved facts win over earlier discoveries.
    cache.environment.merge(probe.environment().clone());
    cache.record_prerequisite(name);
    cache
        .save(&pkg.build_base)
        .context("failed to persist environment cache")?;
    Ok(())
}

/// Build the static dependency DAG for introspection: the package at the
/// head, its prerequisites (with their declared dependencies) and its
/// sub-packages (with their reported dependency lists) beneath it.
pub fn dependency_graph(
    pkg: &ResolvedPackage,
    registry: &Registry,
    sub_deps: &BTreeMap<String, Vec<String>>,
) -> Result<Dag> {
    let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let head = pkg.manifest.project.name.clone();

    let mut direct: Vec<String> = pkg
        .manifest
        .prerequisites
        .iter()
        .map(|e| e.name().to_string())
        .collect();
    direct.extend(pkg.manifest.subpackages.iter().map(|s| s.name.clone()));
    graph.insert(head.clone(), direct);

    // Prerequisites and their transitive declared dependencies.
    let mut queue: Vec<String> = pkg
        .manifest
        .prerequisites
        .iter()
        .map(|e| e.name().to_string())
        .collect();
    while let Some(name) = queue.pop() {
        if graph.contains_key(&name) {
            continue;
        }
        let deps = match registry.get(&name) {
            Some(probe) => probe.dependencies().to_vec(),
            None => Vec::new(),
        };
        queue.extend(deps.iter().cloned());
        graph.insert(name, deps);
    }

    // Sub-packages with their reported (flat) dependency lists.
    for (sub, deps) in sub_deps {
        graph.insert(sub.clone(), deps.clone());
        for dep in deps {
            graph.entry(dep.clone()).or_default();
        }
    }

    Dag::from_adjacency(graph, head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MANIFEST_FILE, load_package};
    use crate::environ::{EnvValue, Environment};
    use crate::probes::Probe;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    /// Shared log of probe/install events, in order.
    type EventLog = Rc<RefCell<Vec<String>>>;

    /// A scripted probe: reports installed after `missing_probes` failed
    /// attempts (0 = always installed).
    struct FakeProbe {
        name: String,
        deps: Vec<String>,
        missing_probes: usize,
        env: Environment,
        log: EventLog,
    }

    impl FakeProbe {
        fn new(name: &str, deps: &[&str], missing_probes: usize, log: &EventLog) -> Box<Self> {
            let mut env = Environment::new();
            env.insert(
                format!("{}_DIR", name.to_uppercase()),
                EnvValue::Str(format!("/fake/{name}")),
            );
            Box::new(Self {
                name: name.into(),
                deps: deps.iter().map(|s| s.to_string()).collect(),
                missing_probes,
                env,
                log: Rc::clone(log),
            })
        }
    }

    impl Probe for FakeProbe {
        fn name(&self) -> &str {
            &self.name
        }

        fn dependencies(&self) -> &[String] {
            &self.deps
        }

        fn is_installed(
            &mut self,
            _env: &Environment,
            _version: Option<&str>,
            _ctx: &InstallContext,
        ) -> bool {
            self.log.borrow_mut().push(format!("probe:{}", self.name));
            if self.missing_probes > 0 {
                self.missing_probes -= 1;
                return false;
            }
            true
        }

        fn install(
            &mut self,
            _version: Option<&str>,
            _ctx: &InstallContext,
        ) -> Result<Option<PathBuf>> {
            self.log.borrow_mut().push(format!("install:{}", self.name));
            Ok(None)
        }

        fn null(&mut self) {
            self.log.borrow_mut().push(format!("null:{}", self.name));
        }

        fn environment(&self) -> &Environment {
            &self.env
        }
    }

    fn package_with_prereqs(dir: &std::path::Path, prereqs: &str) -> ResolvedPackage {
        std::fs::write(
            dir.join(MANIFEST_FILE),
            format!(
                "prerequisites = {prereqs}\n\n[project]\nname = \"demo\"\nversion = \"1.0\"\n"
            ),
        )
        .unwrap();
        load_package(dir, None).unwrap()
    }

    fn new_cache() -> EnvCache {
        EnvCache::new("test-toolchain".into())
    }

    #[test]
    fn depth_first_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package_with_prereqs(dir.path(), "[\"top\"]");
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let mut registry: Registry = BTreeMap::new();
        registry.insert("top".into(), FakeProbe::new("top", &["mid"], 0, &log));
        registry.insert("mid".into(), FakeProbe::new("mid", &["leaf"], 0, &log));
        registry.insert("leaf".into(), FakeProbe::new("leaf", &[], 0, &log));

        let mut cache = new_cache();
        configure_system(&pkg, &mut registry, &mut cache, &ResolveOptions::default()).unwrap();

        assert_eq!(
            log.borrow().as_slice(),
            ["probe:leaf", "probe:mid", "probe:top"]
        );
        assert_eq!(cache.prerequisites, ["leaf", "mid", "top"]);
        assert_eq!(cache.environment.get_str("TOP_DIR"), Some("/fake/top"));
    }

    #[test]
    fn diamond_dependency_probed_once() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package_with_prereqs(dir.path(), "[\"a\", \"b\"]");
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let mut registry: Registry = BTreeMap::new();
        registry.insert("a".into(), FakeProbe::new("a", &["shared"], 0, &log));
        registry.insert("b".into(), FakeProbe::new("b", &["shared"], 0, &log));
        registry.insert("shared".into(), FakeProbe::new("shared", &[], 0, &log));

        let mut cache = new_cache();
        configure_system(&pkg, &mut registry, &mut cache, &ResolveOptions::default()).unwrap();

        let probes: Vec<_> = log
            .borrow()
            .iter()
            .filter(|e| *e == "probe:shared")
            .cloned()
            .collect();
        assert_eq!(probes.len(), 1);
        assert_eq!(cache.prerequisites, ["shared", "a", "b"]);
    }

    #[test]
    fn missing_probe_configuration_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package_with_prereqs(dir.path(), "[\"nonesuch\"]");
        let mut registry: Registry = BTreeMap::new();
        let mut cache = new_cache();
        let err = configure_system(&pkg, &mut registry, &mut cache, &ResolveOptions::default())
            .unwrap_err();
        assert!(err.downcast_ref::<FatalError>().is_some());
        assert!(err.to_string().contains("nonesuch"));
    }

    #[test]
    fn missing_prereq_without_install_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package_with_prereqs(dir.path(), "[\"gone\"]");
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let mut registry: Registry = BTreeMap::new();
        registry.insert("gone".into(), FakeProbe::new("gone", &[], 99, &log));

        let mut cache = new_cache();
        let opts = ResolveOptions {
            install: false,
            ..Default::default()
        };
        let err = configure_system(&pkg, &mut registry, &mut cache, &opts).unwrap_err();
        assert!(err.downcast_ref::<FatalError>().is_some());
        assert!(!log.borrow().iter().any(|e| e.starts_with("install:")));
    }

    #[test]
    fn install_path_runs_and_reprobes() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package_with_prereqs(dir.path(), "[\"fresh\"]");
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let mut registry: Registry = BTreeMap::new();
        // Missing on the first probe, present on the post-install re-probe.
        registry.insert("fresh".into(), FakeProbe::new("fresh", &[], 1, &log));

        let mut cache = new_cache();
        configure_system(&pkg, &mut registry, &mut cache, &ResolveOptions::default()).unwrap();
        assert_eq!(
            log.borrow().as_slice(),
            ["probe:fresh", "install:fresh", "probe:fresh"]
        );
    }

    #[test]
    fn resolution_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package_with_prereqs(dir.path(), "[\"a\"]");
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let mut registry: Registry = BTreeMap::new();
        registry.insert("a".into(), FakeProbe::new("a", &[], 0, &log));

        let mut cache = new_cache();
        configure_system(&pkg, &mut registry, &mut cache, &ResolveOptions::default()).unwrap();
        let first_env = cache.environment.clone();
        let first_prereqs = cache.prerequisites.clone();

        configure_system(&pkg, &mut registry, &mut cache, &ResolveOptions::default()).unwrap();
        assert_eq!(cache.environment, first_env);
        assert_eq!(cache.prerequisites, first_prereqs);
        assert!(!log.borrow().iter().any(|e| e.starts_with("install:")));

        // The on-disk cache reflects the same state.
        let loaded = EnvCache::load(&pkg.build_base).unwrap();
        assert_eq!(loaded.environment, first_env);
    }

    #[test]
    fn skip_mode_nulls_probes_and_preserves_facts() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package_with_prereqs(dir.path(), "[\"a\"]");
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let mut registry: Registry = BTreeMap::new();
        registry.insert("a".into(), FakeProbe::new("a", &[], 0, &log));

        let mut cache = new_cache();
        cache
            .environment
            .insert("A_DIR", EnvValue::Str("/real/a".into()));
        let opts = ResolveOptions {
            skip: true,
            ..Default::default()
        };
        configure_system(&pkg, &mut registry, &mut cache, &opts).unwrap();

        assert_eq!(log.borrow().as_slice(), ["null:a"]);
        // A previously discovered fact survives skip mode.
        assert_eq!(cache.environment.get_str("A_DIR"), Some("/real/a"));
        assert_eq!(cache.prerequisites, ["a"]);
        // Skip mode never persists.
        assert!(EnvCache::load(&pkg.build_base).is_none());
    }

    #[test]
    fn skip_mode_collects_transitive_names_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package_with_prereqs(dir.path(), "[\"a\", \"b\"]");
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let mut registry: Registry = BTreeMap::new();
        registry.insert("a".into(), FakeProbe::new("a", &["shared"], 0, &log));
        registry.insert("b".into(), FakeProbe::new("b", &["shared"], 0, &log));
        registry.insert("shared".into(), FakeProbe::new("shared", &[], 0, &log));

        let mut cache = new_cache();
        let opts = ResolveOptions {
            skip: true,
            install: false,
            local_install: false,
        };
        configure_system(&pkg, &mut registry, &mut cache, &opts).unwrap();
        assert_eq!(cache.prerequisites, ["shared", "a", "b"]);
        // Nothing was probed or installed.
        assert!(log.borrow().iter().all(|e| e.starts_with("null:")));
    }

    #[test]
    fn dependency_graph_spans_prereqs_and_subpackages() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package_with_prereqs(dir.path(), "[\"a\"]");
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let mut registry: Registry = BTreeMap::new();
        registry.insert("a".into(), FakeProbe::new("a", &["shared"], 0, &log));
        registry.insert("shared".into(), FakeProbe::new("shared", &[], 0, &log));

        let mut sub_deps = BTreeMap::new();
        sub_deps.insert("engine".to_string(), vec!["shared".to_string()]);

        let dag = dependency_graph(&pkg, &registry, &sub_deps).unwrap();
        assert_eq!(dag.head(), "demo");
        let order = dag.topological_sort().unwrap();
        let pos = |k: &str| order.iter().position(|n| n == k).unwrap();
        assert!(pos("shared") < pos("a"));
        assert!(pos("a") < pos("demo"));
    }
}
