use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use fab_domain::FetchError;

use crate::fetch::git::classify_failure;
use crate::process::{run_command, RunOutput};

/// Version-control operations the git fetcher depends on.
///
/// Kept behind a trait so tests can count fetches or inject failures
/// without a network.
pub trait GitClient: Send + Sync {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), FetchError>;
    fn fetch_origin(&self, repo: &Path) -> Result<(), FetchError>;
    fn checkout(&self, repo: &Path, revision: &str) -> Result<(), FetchError>;
    fn pull_default_branch(&self, repo: &Path) -> Result<(), FetchError>;
    fn head_commit(&self, repo: &Path) -> Result<String, FetchError>;
}

/// Subprocess execution used by the runtime manager.
pub trait CommandRunner: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the program cannot be spawned or exceeds the
    /// deadline; a non-zero exit is reported through [`RunOutput::code`].
    fn run(
        &self,
        program: &Path,
        args: &[String],
        stdin: Option<&str>,
        cwd: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<RunOutput>;
}

pub trait Effects: Send + Sync {
    fn git(&self) -> Arc<dyn GitClient>;
    fn runner(&self) -> Arc<dyn CommandRunner>;
}

pub type SharedEffects = Arc<dyn Effects>;

pub struct SystemEffects {
    git: Arc<SystemGit>,
    runner: Arc<SystemRunner>,
}

impl SystemEffects {
    #[must_use]
    pub fn new() -> Self {
        Self {
            git: Arc::new(SystemGit),
            runner: Arc::new(SystemRunner),
        }
    }
}

impl Default for SystemEffects {
    fn default() -> Self {
        Self::new()
    }
}

impl Effects for SystemEffects {
    fn git(&self) -> Arc<dyn GitClient> {
        self.git.clone()
    }

    fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        stdin: Option<&str>,
        cwd: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<RunOutput> {
        run_command(program, args, stdin, cwd, timeout)
    }
}

/// Drives the system `git` binary.
pub struct SystemGit;

fn git_binary() -> &'static Path {
    static GIT: OnceLock<PathBuf> = OnceLock::new();
    GIT.get_or_init(|| which::which("git").unwrap_or_else(|_| PathBuf::from("git")))
}

impl SystemGit {
    fn git(&self, cwd: Option<&Path>, args: &[&str]) -> Result<RunOutput, FetchError> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        debug!("running git {}", args.join(" "));
        let output = run_command(git_binary(), &args, None, cwd, None)
            .map_err(|err| FetchError::Failed(err.to_string()))?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_failure(&output.stderr))
        }
    }
}

impl GitClient for SystemGit {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let dest = dest.to_string_lossy();
        self.git(None, &["clone", url, dest.as_ref()]).map(|_| ())
    }

    fn fetch_origin(&self, repo: &Path) -> Result<(), FetchError> {
        self.git(Some(repo), &["fetch", "origin"]).map(|_| ())
    }

    fn checkout(&self, repo: &Path, revision: &str) -> Result<(), FetchError> {
        self.git(Some(repo), &["checkout", "--force", revision])
            .map(|_| ())
    }

    fn pull_default_branch(&self, repo: &Path) -> Result<(), FetchError> {
        self.git(Some(repo), &["pull", "--ff-only"]).map(|_| ())
    }

    fn head_commit(&self, repo: &Path) -> Result<String, FetchError> {
        self.git(Some(repo), &["rev-parse", "HEAD"])
            .map(|output| output.stdout.trim().to_string())
    }
}
