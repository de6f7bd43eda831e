//! Recursive sub-package orchestration.
//!
//! Propagates a build-lifecycle verb to every declared sub-package by
//! re-invoking the orchestrator binary in the sub-package's directory as
//! an independent process, optionally fanning out across a bounded worker
//! pool. Output is captured to per-sub-package log files; results are
//! aggregated or escalated fail-fast depending on configuration.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::config::ResolvedPackage;
use crate::fatal::FatalError;
use crate::verbose::{dprint, dprintln};

/// The marker line sub-packages print for the `dependencies` verb.
pub const DEPS_TOKEN: &str = "Package dependencies: ";

/// A (name, directory) sub-package descriptor with extra CLI arguments.
#[derive(Debug, Clone)]
pub struct SubpackageJob {
    pub name: String,
    pub dir: PathBuf,
    pub args: Vec<String>,
}

/// Shared invocation state for one recursion level.
pub struct Orchestrator {
    /// The build entry point to run (the orchestrator binary itself).
    pub program: PathBuf,
    /// Arguments inserted before the verb (used by tests to interpose a
    /// shell; empty in production).
    pub program_args: Vec<String>,
    /// Where per-sub-package log files land.
    pub build_base: PathBuf,
    /// Global flags forwarded to children (verbosity, parallelism, ...).
    pub common_args: Vec<String>,
    /// Current recursion depth; children run at `sublevel + 1`.
    pub sublevel: u32,
}

impl Orchestrator {
    /// Sub-package jobs for a resolved package, with directories anchored
    /// at the package root.
    pub fn jobs_from(pkg: &ResolvedPackage) -> Vec<SubpackageJob> {
        pkg.manifest
            .subpackages
            .iter()
            .map(|sub| SubpackageJob {
                name: sub.name.clone(),
                dir: pkg.root.join(&sub.path),
                args: sub.args.clone(),
            })
            .collect()
    }

    /// The cache directory children read: the one shared with us by our
    /// own parent, or our build directory when we are the top level.
    fn shared_cache_dir(&self) -> PathBuf {
        std::env::var_os(crate::environ::CACHE_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.build_base.clone())
    }

    /// Argument vector for a child invocation. Verbs and flags that do not
    /// apply one level down are stripped; the sublevel marker is always
    /// re-injected incremented so nested builds can detect depth.
    fn child_args(&self, verb: &str, job: &SubpackageJob) -> Vec<String> {
        let mut args = self.program_args.clone();
        args.push(verb.to_string());
        args.extend(
            self.common_args
                .iter()
                .filter(|a| a.as_str() != "clean" && !a.starts_with("--sublevel"))
                .cloned(),
        );
        args.extend(job.args.iter().cloned());
        args.push(format!("--sublevel={}", self.sublevel + 1));
        args
    }

    /// Run one sub-package's build entry point for `verb`.
    ///
    /// Output is captured to `<build_base>/<name>_<verb>.log`, except for
    /// `clean`, whose output is discarded. Returns the sub-package name
    /// and the child's exit status.
    pub fn process_package(&self, verb: &str, job: &SubpackageJob) -> Result<(String, i32)> {
        dprint!("{} {} in {} ", gerund(verb), job.name, job.dir.display());

        let logging = verb != "clean";
        let log_path = self.build_base.join(format!("{}_{}.log", job.name, verb));

        let mut cmd = Command::new(&self.program);
        cmd.args(self.child_args(verb, job))
            .current_dir(&job.dir)
            .env(crate::environ::CACHE_DIR_VAR, self.shared_cache_dir());
        if logging {
            std::fs::create_dir_all(&self.build_base)
                .with_context(|| format!("failed to create {}", self.build_base.display()))?;
            let log = File::create(&log_path)
                .with_context(|| format!("failed to create {}", log_path.display()))?;
            let log_err = log
                .try_clone()
                .context("failed to duplicate log handle")?;
            cmd.stdout(log).stderr(log_err);
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn build for '{}'", job.name))?;
        // The guard reaps the child if this thread unwinds (e.g. on an
        // interrupt), so no orphaned build keeps running.
        let mut guard = ChildGuard::new(child);
        let status = process_progress(guard.child_mut())?;
        guard.disarm();

        if status != 0 {
            if logging {
                dprint!(" failed; see {}", log_path.display());
            } else {
                dprint!(" failed");
            }
        } else {
            dprint!(" done");
        }
        dprintln!("");
        Ok((job.name.clone(), status))
    }

    /// Run `verb` across all sub-packages, serially or on a bounded worker
    /// pool. Returns whether any sub-package failed.
    ///
    /// With `quit_on_error`, the first failure escalates as a
    /// [`FatalError`] carrying the child's exit status; jobs not yet
    /// started are never invoked.
    pub fn process_subpackages(
        &self,
        verb: &str,
        jobs: &[SubpackageJob],
        parallel: bool,
        workers: usize,
        quit_on_error: bool,
    ) -> Result<bool> {
        if jobs.is_empty() {
            return Ok(false);
        }
        if parallel && jobs.len() > 1 {
            self.process_parallel(verb, jobs, workers, quit_on_error)
        } else {
            self.process_serial(verb, jobs, quit_on_error)
        }
    }

    fn process_serial(
        &self,
        verb: &str,
        jobs: &[SubpackageJob],
        quit_on_error: bool,
    ) -> Result<bool> {
        let mut failed = false;
        for job in jobs {
            let (name, status) = self.process_package(verb, job)?;
            if status != 0 {
                failed = true;
                if quit_on_error {
                    return Err(FatalError::with_code(
                        format!("sub-package '{name}' {verb} failed"),
                        status,
                    )
                    .into());
                }
            }
        }
        Ok(failed)
    }

    fn process_parallel(
        &self,
        verb: &str,
        jobs: &[SubpackageJob],
        workers: usize,
        quit_on_error: bool,
    ) -> Result<bool> {
        let workers = match workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            n => n,
        }
        .min(jobs.len());

        let queue: Mutex<VecDeque<&SubpackageJob>> = Mutex::new(jobs.iter().collect());
        let abort = AtomicBool::new(false);
        let (result_tx, result_rx) = mpsc::channel::<Result<(String, i32)>>();

        let mut failed = false;
        let mut first_failure: Option<(String, i32)> = None;

        std::thread::scope(|s| {
            for _ in 0..workers {
                let tx = result_tx.clone();
                let queue = &queue;
                let abort = &abort;
                s.spawn(move || {
                    loop {
                        if abort.load(Ordering::Relaxed) {
                            break;
                        }
                        let job = queue.lock().unwrap().pop_front();
                        let Some(job) = job else { break };
                        let result = self.process_package(verb, job);
                        if tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for result in result_rx {
                match result {
                    Ok((name, status)) => {
                        if status != 0 {
                            failed = true;
                            if first_failure.is_none() {
                                first_failure = Some((name, status));
                            }
                            if quit_on_error {
                                // Stop handing out new jobs; in-flight
                                // children run to completion.
                                abort.store(true, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(err) => {
                        failed = true;
                        eprintln!("sub-package {verb} error: {err:#}");
                        if first_failure.is_none() {
                            first_failure = Some((String::new(), 1));
                        }
                        if quit_on_error {
                            abort.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
        });

        if quit_on_error {
            if let Some((name, status)) = first_failure {
                return Err(FatalError::with_code(
                    format!("sub-package '{name}' {verb} failed"),
                    status,
                )
                .into());
            }
        }
        Ok(failed)
    }

    /// Query each sub-package for its own prerequisite list by running its
    /// `dependencies` verb and parsing the marker line from stdout.
    pub fn collect_subpackage_deps(
        &self,
        jobs: &[SubpackageJob],
        show: bool,
    ) -> Result<Vec<String>> {
        let mut prereqs: Vec<String> = Vec::new();
        for job in jobs {
            let output = Command::new(&self.program)
                .args(self.child_args("dependencies", job))
                .current_dir(&job.dir)
                .env(crate::environ::CACHE_DIR_VAR, self.shared_cache_dir())
                .output()
                .with_context(|| format!("failed to query dependencies of '{}'", job.name))?;
            if !output.status.success() {
                bail!("dependency check failed for '{}'", job.name);
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            let list = stdout
                .lines()
                .rev()
                .find_map(|line| line.split_once(DEPS_TOKEN).map(|(_, rest)| rest.trim()))
                .with_context(|| {
                    format!("no '{DEPS_TOKEN}' line in output of '{}'", job.name)
                })?;
            if show {
                println!("{}:  {list}", job.name.to_uppercase());
            }
            for item in list.split(',') {
                let item = item.trim();
                if !item.is_empty() && item != "None" && !prereqs.iter().any(|p| p == item) {
                    prereqs.push(item.to_string());
                }
            }
        }
        Ok(prereqs)
    }
}

/// `build` → `BUILDING`, `install` → `INSTALLING`, and so on.
fn gerund(verb: &str) -> String {
    format!("{}ING", verb.to_uppercase())
}

/// Poll a child to completion, animating a rotating dot indicator in
/// verbose mode. Returns the exit status (signal deaths count as 1).
fn process_progress(child: &mut Child) -> Result<i32> {
    const MAX_DOTS: usize = 10;
    let mut dots = 0;
    loop {
        match child.try_wait().context("failed to poll child process")? {
            Some(status) => {
                if crate::verbose::is_verbose() {
                    let mut out = std::io::stdout();
                    let _ = write!(out, "{}{}", "\u{8}".repeat(dots), ".".repeat(MAX_DOTS));
                    let _ = out.flush();
                }
                return Ok(status.code().unwrap_or(1));
            }
            None => {
                if crate::verbose::is_verbose() {
                    let prev = dots;
                    dots = (dots + 1) % MAX_DOTS;
                    let mut out = std::io::stdout();
                    let _ = write!(out, "{}{}", "\u{8}".repeat(prev), ".".repeat(dots));
                    let _ = out.flush();
                }
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

/// Kills the wrapped child on drop unless disarmed, so interrupted or
/// failing orchestrations never leave build processes behind.
struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    fn child_mut(&mut self) -> &mut Child {
        self.child.as_mut().expect("guard not disarmed")
    }

    fn disarm(mut self) {
        self.child = None;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    /// An orchestrator whose "entry point" is a per-directory shell
    /// script, standing in for the real binary.
    fn script_orchestrator(build_base: &Path, sublevel: u32) -> Orchestrator {
        Orchestrator {
            program: PathBuf::from("/bin/sh"),
            program_args: vec!["-c".into(), "exec ./entry.sh \"$@\"".into(), "entry".into()],
            build_base: build_base.to_path_buf(),
            common_args: Vec::new(),
            sublevel,
        }
    }

    /// Create a sub-package directory whose entry script runs `body`.
    fn fake_subpackage(root: &Path, name: &str, body: &str) -> SubpackageJob {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("entry.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        SubpackageJob {
            name: name.to_string(),
            dir,
            args: Vec::new(),
        }
    }

    #[test]
    fn process_package_captures_log() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        let orch = script_orchestrator(&build, 0);
        let job = fake_subpackage(dir.path(), "alpha", "echo hello-from-alpha");

        let (name, status) = orch.process_package("build", &job).unwrap();
        assert_eq!((name.as_str(), status), ("alpha", 0));
        let log = std::fs::read_to_string(build.join("alpha_build.log")).unwrap();
        assert!(log.contains("hello-from-alpha"));
    }

    #[test]
    fn clean_discards_output() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        let orch = script_orchestrator(&build, 0);
        let job = fake_subpackage(dir.path(), "alpha", "echo noisy");

        let (_, status) = orch.process_package("clean", &job).unwrap();
        assert_eq!(status, 0);
        assert!(!build.join("alpha_clean.log").exists());
    }

    #[test]
    fn children_receive_verb_and_sublevel() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        let orch = script_orchestrator(&build, 2);
        let job = fake_subpackage(dir.path(), "alpha", "echo \"$@\" > args.txt");

        orch.process_package("build", &job).unwrap();
        let args = std::fs::read_to_string(job.dir.join("args.txt")).unwrap();
        assert!(args.starts_with("build"), "args were: {args}");
        assert!(args.contains("--sublevel=3"), "args were: {args}");
    }

    #[test]
    fn fail_fast_stops_before_later_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        let orch = script_orchestrator(&build, 0);
        let jobs = vec![
            fake_subpackage(dir.path(), "one", "touch ran"),
            fake_subpackage(dir.path(), "two", "exit 3"),
            fake_subpackage(dir.path(), "three", "touch ran"),
        ];

        let err = orch
            .process_subpackages("build", &jobs, false, 1, true)
            .unwrap_err();
        let fatal = err.downcast_ref::<FatalError>().unwrap();
        assert_eq!(fatal.exit_code, 3);
        assert!(jobs[0].dir.join("ran").exists());
        assert!(!jobs[2].dir.join("ran").exists(), "job three must not run");
    }

    #[test]
    fn deferred_aggregation_runs_everything() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        let orch = script_orchestrator(&build, 0);
        let jobs = vec![
            fake_subpackage(dir.path(), "one", "touch ran"),
            fake_subpackage(dir.path(), "two", "exit 3"),
            fake_subpackage(dir.path(), "three", "touch ran"),
        ];

        let failed = orch
            .process_subpackages("build", &jobs, false, 1, false)
            .unwrap();
        assert!(failed);
        assert!(jobs[0].dir.join("ran").exists());
        assert!(jobs[2].dir.join("ran").exists());
    }

    #[test]
    fn parallel_mode_aggregates_results() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        let orch = script_orchestrator(&build, 0);
        let jobs = vec![
            fake_subpackage(dir.path(), "one", "touch ran"),
            fake_subpackage(dir.path(), "two", "touch ran"),
            fake_subpackage(dir.path(), "three", "exit 2"),
        ];

        let failed = orch
            .process_subpackages("build", &jobs, true, 2, false)
            .unwrap();
        assert!(failed);
        assert!(jobs[0].dir.join("ran").exists());
        assert!(jobs[1].dir.join("ran").exists());
    }

    #[test]
    fn collect_dependencies_parses_marker_line() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        let orch = script_orchestrator(&build, 0);
        let jobs = vec![
            fake_subpackage(
                dir.path(),
                "one",
                "echo 'some noise'; echo 'Package dependencies: gsl,hdf5'",
            ),
            fake_subpackage(dir.path(), "two", "echo 'Package dependencies: hdf5,None'"),
        ];

        let deps = orch.collect_subpackage_deps(&jobs, false).unwrap();
        assert_eq!(deps, ["gsl", "hdf5"]);
    }

    #[test]
    fn failing_dependency_query_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        let orch = script_orchestrator(&build, 0);
        let jobs = vec![fake_subpackage(dir.path(), "one", "exit 1")];

        let err = orch.collect_subpackage_deps(&jobs, false).unwrap_err();
        assert!(err.to_string().contains("one"), "unexpected error: {err}");
    }

    #[test]
    fn child_args_strip_and_reinject_sublevel() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = script_orchestrator(dir.path(), 1);
        orch.program_args.clear();
        orch.common_args = vec!["--quiet".into(), "--sublevel=1".into(), "clean".into()];
        let job = SubpackageJob {
            name: "x".into(),
            dir: dir.path().to_path_buf(),
            args: vec!["--local-install".into()],
        };
        let args = orch.child_args("build", &job);
        assert_eq!(
            args,
            ["build", "--quiet", "--local-install", "--sublevel=2"]
        );
    }
}
