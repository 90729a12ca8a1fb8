mod rpc;

pub use rpc::{RpcClient, RpcResult};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use fab_domain::{EngineConfig, SandboxKind};

use crate::effects::CommandRunner;
use crate::fetch::DigestLocks;
use crate::process::RunOutput;
use crate::project::ProjectNode;

/// Interpreter flags isolating sandboxed executions from the host
/// environment and user site-packages.
const INTERPRETER_FLAGS: &[&str] = &["-sOOIu"];

const INSTALL_GUARD_PREFIX: &str = ".fab.installed.";
const SESSION_ENV_PREFIX: &str = "v-env-";

/// Provisions isolated interpreter environments and executes build
/// workers inside them.
///
/// Runtimes are memoized per `(sandbox kind, version)` and owned by the
/// resolver, never by module-level state, so independent resolvers in one
/// process cannot observe each other.
pub struct RuntimeManager {
    sandbox_dir: PathBuf,
    default_kind: SandboxKind,
    runner: Arc<dyn CommandRunner>,
    remote: Option<(String, u16)>,
    runtimes: Mutex<HashMap<(SandboxKind, String), Arc<RuntimeHandle>>>,
}

impl RuntimeManager {
    #[must_use]
    pub fn new(config: &EngineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            sandbox_dir: config.state_dir.join("sandbox"),
            default_kind: config.sandbox,
            runner,
            remote: None,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    /// Points every runtime at a remote executor endpoint instead of local
    /// subprocesses.
    #[must_use]
    pub fn with_remote(mut self, host: impl Into<String>, port: u16) -> Self {
        self.remote = Some((host.into(), port));
        self
    }

    /// Returns the lazily-created runtime for `(kind, version)`.
    pub fn get_runtime(&self, version: &str, kind: Option<SandboxKind>) -> Arc<RuntimeHandle> {
        let kind = kind.unwrap_or(self.default_kind);
        let mut runtimes = self
            .runtimes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        runtimes
            .entry((kind, version.to_string()))
            .or_insert_with(|| {
                Arc::new(RuntimeHandle::new(
                    &self.sandbox_dir,
                    kind,
                    version,
                    self.runner.clone(),
                    self.remote.clone(),
                ))
            })
            .clone()
    }
}

/// One isolated interpreter environment of a specific kind and version.
pub struct RuntimeHandle {
    pub kind: SandboxKind,
    pub version: String,
    /// Base environment directory; also hosts the per-session venvs.
    path: PathBuf,
    base_lock: Mutex<()>,
    session_locks: DigestLocks,
    runner: Arc<dyn CommandRunner>,
    remote: Option<RpcClient>,
}

/// Venv-session descriptor: dependencies accumulate here until the first
/// `run` materializes the environment and installs them once.
pub struct RuntimeSession {
    pub name: String,
    pub hash: String,
    pub path: PathBuf,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    /// The isolated environment does not exist on disk yet.
    dirty: bool,
    deps: Vec<String>,
}

impl RuntimeSession {
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .dirty
    }

    #[must_use]
    pub fn dependencies(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .deps
            .clone()
    }

    fn accumulate(&self, spec: &str, needs_install: bool) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !state.deps.iter().any(|dep| dep == spec) {
            state.deps.push(spec.to_string());
        }
        if needs_install {
            state.dirty = true;
        }
    }

    fn drain_dirty(&self) -> Option<Vec<String>> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !state.dirty {
            return None;
        }
        state.dirty = false;
        Some(state.deps.clone())
    }

    fn mark_dirty(&self) {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .dirty = true;
    }
}

impl RuntimeHandle {
    fn new(
        sandbox_dir: &Path,
        kind: SandboxKind,
        version: &str,
        runner: Arc<dyn CommandRunner>,
        remote: Option<(String, u16)>,
    ) -> Self {
        Self {
            kind,
            version: version.to_string(),
            path: sandbox_dir.join(format!("fab-{}-{version}", kind.as_str())),
            base_lock: Mutex::new(()),
            session_locks: DigestLocks::default(),
            runner,
            remote: remote.map(|(host, port)| RpcClient::new(host, port)),
        }
    }

    /// Creates a session descriptor for an isolated environment named
    /// `name`. Nothing touches the disk until the first `run`.
    #[must_use]
    pub fn session(&self, name: &str) -> Arc<RuntimeSession> {
        let hash = hex::encode(Sha256::digest(name.as_bytes()));
        let path = self.path.join(format!("{SESSION_ENV_PREFIX}{hash}"));
        Arc::new(RuntimeSession {
            name: name.to_string(),
            hash,
            path,
            state: Mutex::new(SessionState::default()),
        })
    }

    fn install_guard(env: &Path, spec: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(spec.as_bytes()));
        env.join(format!("{INSTALL_GUARD_PREFIX}{digest}"))
    }

    /// Makes `spec` available: immediately in the base environment, or
    /// accumulated into `session` for installation on its first `run`.
    ///
    /// Repeat calls are free thanks to the per-dependency guard marker.
    ///
    /// # Errors
    ///
    /// Returns an error when a direct install fails.
    pub fn ensure(&self, spec: &str, session: Option<&RuntimeSession>) -> Result<()> {
        let guard = Self::install_guard(&self.path, spec);
        if let Some(session) = session {
            session.accumulate(spec, !guard.is_file());
            return Ok(());
        }
        if guard.is_file() {
            return Ok(());
        }
        self.ensure_base()?;
        self.install(&self.path, spec)
    }

    /// Ensures the dependency specs a package declares for its producers.
    ///
    /// # Errors
    ///
    /// See [`RuntimeHandle::ensure`].
    pub fn prepare_for_package(
        &self,
        node: &ProjectNode,
        session: Option<&RuntimeSession>,
    ) -> Result<()> {
        let mut specs = node.manifest.requirements.clone();
        if specs.is_empty() {
            let requirements = node.path.join("requirements.txt");
            if let Ok(text) = fs::read_to_string(&requirements) {
                specs = text
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(ToString::to_string)
                    .collect();
            }
        }
        for spec in &specs {
            self.ensure(spec, session)?;
        }
        Ok(())
    }

    /// Runs an interpreter command, materializing the session environment
    /// first when it is dirty.
    ///
    /// The deadline is enforced by killing the child on expiry.
    ///
    /// # Errors
    ///
    /// Returns an error when provisioning fails, the subprocess cannot be
    /// spawned, the deadline expires, or the remote endpoint fails.
    pub fn run(
        &self,
        args: &[String],
        stdin: Option<&str>,
        cwd: Option<&Path>,
        session: Option<&RuntimeSession>,
        timeout: Option<Duration>,
    ) -> Result<RunOutput> {
        if let Some(session) = session {
            if session.is_dirty() {
                // The lock serializes concurrent first runs: one constructs
                // the environment, the rest wait and then observe it.
                let lock = self.session_locks.get(&session.hash);
                let _guard = lock
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(deps) = session.drain_dirty() {
                    if let Err(err) = self.materialize_session(session, &deps) {
                        session.mark_dirty();
                        return Err(err);
                    }
                }
            }
        }

        let env = session.and_then(|session| {
            session.path.exists().then(|| session.path.clone())
        });
        self.exec(env.as_deref(), args, stdin, cwd, timeout)
    }

    fn exec(
        &self,
        env: Option<&Path>,
        args: &[String],
        stdin: Option<&str>,
        cwd: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<RunOutput> {
        let interpreter = self.interpreter(env)?;
        let mut full_args: Vec<String> =
            INTERPRETER_FLAGS.iter().map(ToString::to_string).collect();
        full_args.extend_from_slice(args);

        if let Some(remote) = &self.remote {
            let mut command = vec![interpreter.display().to_string()];
            command.extend_from_slice(&full_args);
            let result = remote.execute(
                &command,
                stdin,
                cwd.map(|cwd| cwd.display().to_string()).as_deref(),
            )?;
            return Ok(RunOutput {
                code: 0,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }

        debug!("running {} {:?}", interpreter.display(), full_args);
        self.runner
            .run(&interpreter, &full_args, stdin, cwd, timeout)
    }

    /// Constructs the session's isolated environment exactly once and
    /// installs its accumulated dependency list. Runs under the session's
    /// per-hash lock, held by the caller.
    fn materialize_session(&self, session: &RuntimeSession, deps: &[String]) -> Result<()> {
        if !session.path.exists() {
            self.ensure_base()?;
            info!(
                "creating the isolated environment for {}",
                session.name
            );
            let args: Vec<String> = [
                "-m",
                "venv",
                "--upgrade-deps",
                &session.path.display().to_string(),
            ]
            .iter()
            .map(ToString::to_string)
            .collect();
            let output = self.exec(None, &args, None, None, None)?;
            if !output.success() {
                return Err(anyhow::anyhow!(
                    "failed to create the environment for {}: {}",
                    session.name,
                    output.stderr.trim()
                ));
            }
        }
        for spec in deps {
            let guard = Self::install_guard(&session.path, spec);
            if guard.is_file() {
                continue;
            }
            self.install(&session.path, spec)?;
        }
        Ok(())
    }

    /// Provisions the base environment once, under the base lock.
    fn ensure_base(&self) -> Result<()> {
        let _guard = self
            .base_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.path.exists() {
            return Ok(());
        }
        match self.kind {
            SandboxKind::None => {
                // No isolation: the directory only carries guard markers.
                fs::create_dir_all(&self.path)
                    .with_context(|| format!("creating {}", self.path.display()))?;
            }
            SandboxKind::Venv => {
                info!("creating the {} base environment", self.version);
                let base = base_interpreter()?;
                let args: Vec<String> =
                    ["-m", "venv", "--upgrade-deps", &self.path.display().to_string()]
                        .iter()
                        .map(ToString::to_string)
                        .collect();
                let output = self.runner.run(&base, &args, None, None, None)?;
                if !output.success() {
                    return Err(anyhow::anyhow!(
                        "failed to create the base environment: {}",
                        output.stderr.trim()
                    ));
                }
            }
            SandboxKind::Conda => {
                info!("creating the {} conda environment", self.version);
                let conda = which::which("conda").context("conda is not installed")?;
                let args: Vec<String> = [
                    "create",
                    "-y",
                    "-p",
                    &self.path.display().to_string(),
                    &format!("python={}", self.version),
                ]
                .iter()
                .map(ToString::to_string)
                .collect();
                let output = self.runner.run(&conda, &args, None, None, None)?;
                if !output.success() {
                    return Err(anyhow::anyhow!(
                        "failed to create the conda environment: {}",
                        output.stderr.trim()
                    ));
                }
            }
        }
        Ok(())
    }

    /// Installs one dependency spec into `env` and leaves a guard marker
    /// so repeat calls are free.
    fn install(&self, env: &Path, spec: &str) -> Result<()> {
        info!("installing {spec} into {}", env.display());
        let target = (env != self.path).then(|| env.to_path_buf());
        let args: Vec<String> = ["-m", "pip", "install", spec]
            .iter()
            .map(ToString::to_string)
            .collect();
        let output = self.exec(target.as_deref(), &args, None, None, None)?;
        if !output.success() {
            return Err(anyhow::anyhow!(
                "failed to install {spec}: {}",
                output.stderr.trim()
            ));
        }
        fs::write(Self::install_guard(env, spec), b"")
            .with_context(|| format!("writing the install marker for {spec}"))?;
        Ok(())
    }

    /// Path of the interpreter to execute: the environment's own when one
    /// is given, otherwise the base environment's (or the system
    /// interpreter for unsandboxed runtimes).
    fn interpreter(&self, env: Option<&Path>) -> Result<PathBuf> {
        match env {
            Some(env) => Ok(env_interpreter(env)),
            None => match self.kind {
                SandboxKind::None => base_interpreter(),
                SandboxKind::Venv | SandboxKind::Conda => Ok(env_interpreter(&self.path)),
            },
        }
    }
}

fn env_interpreter(env: &Path) -> PathBuf {
    if cfg!(windows) {
        env.join("Scripts").join("python.exe")
    } else {
        env.join("bin").join("python")
    }
}

fn base_interpreter() -> Result<PathBuf> {
    which::which("python3")
        .or_else(|_| which::which("python"))
        .context("no python interpreter found on PATH")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    /// Records every invocation; creates the venv directory when asked to.
    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
        installs: AtomicU64,
        venvs: AtomicU64,
    }

    impl RecordingRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                installs: AtomicU64::new(0),
                venvs: AtomicU64::new(0),
            })
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(
            &self,
            _program: &Path,
            args: &[String],
            _stdin: Option<&str>,
            _cwd: Option<&Path>,
            _timeout: Option<Duration>,
        ) -> Result<RunOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            if args.iter().any(|arg| arg == "venv") {
                self.venvs.fetch_add(1, Ordering::SeqCst);
                if let Some(path) = args.last() {
                    fs::create_dir_all(path)?;
                }
            }
            if args.iter().any(|arg| arg == "install") {
                self.installs.fetch_add(1, Ordering::SeqCst);
            }
            Ok(RunOutput {
                code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn manager(state: &Path, runner: Arc<RecordingRunner>) -> RuntimeManager {
        let config = EngineConfig {
            state_dir: state.to_path_buf(),
            sandbox: SandboxKind::None,
            ..EngineConfig::default()
        };
        RuntimeManager::new(&config, runner)
    }

    #[test]
    fn runtimes_are_memoized_per_kind_and_version() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), RecordingRunner::new());
        let a = manager.get_runtime("3.11", None);
        let b = manager.get_runtime("3.11", None);
        let c = manager.get_runtime("3.12", None);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn direct_ensure_installs_once_per_spec() -> Result<()> {
        let dir = tempdir().unwrap();
        let runner = RecordingRunner::new();
        let manager = manager(dir.path(), runner.clone());
        let runtime = manager.get_runtime("3.11", None);

        runtime.ensure("numpy==1.24.1", None)?;
        runtime.ensure("numpy==1.24.1", None)?;
        assert_eq!(runner.installs.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn session_accumulates_once_and_installs_on_first_run() -> Result<()> {
        let dir = tempdir().unwrap();
        let runner = RecordingRunner::new();
        let manager = manager(dir.path(), runner.clone());
        let runtime = manager.get_runtime("3.11", None);
        let session = runtime.session("cube-build");

        runtime.ensure("shapely", Some(&session))?;
        runtime.ensure("shapely", Some(&session))?;
        assert_eq!(session.dependencies(), vec!["shapely".to_string()]);
        assert!(session.is_dirty());
        assert_eq!(runner.installs.load(Ordering::SeqCst), 0);

        runtime.run(
            &["-c".to_string(), "pass".to_string()],
            None,
            None,
            Some(&session),
            None,
        )?;
        assert_eq!(runner.venvs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.installs.load(Ordering::SeqCst), 1);
        assert!(!session.is_dirty());

        // The environment exists and the guard is in place: nothing more
        // to install on later runs.
        runtime.run(
            &["-c".to_string(), "pass".to_string()],
            None,
            None,
            Some(&session),
            None,
        )?;
        assert_eq!(runner.venvs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.installs.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn clean_sessions_run_against_the_base_interpreter() -> Result<()> {
        let dir = tempdir().unwrap();
        let runner = RecordingRunner::new();
        let manager = manager(dir.path(), runner.clone());
        let runtime = manager.get_runtime("3.11", None);
        let session = runtime.session("nothing-needed");

        runtime.run(
            &["-c".to_string(), "pass".to_string()],
            None,
            None,
            Some(&session),
            None,
        )?;
        assert_eq!(runner.venvs.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
