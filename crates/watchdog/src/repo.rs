//! Repository and branch lookup for a process working directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

/// Upper bound on each git invocation.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Git origin and current branch of a directory. Either may be unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoInfo {
    pub repository: Option<String>,
    pub branch: Option<String>,
}

/// Resolves working directories to [`RepoInfo`], caching each directory's
/// answer for the life of the process.
pub struct RepoResolver {
    git: String,
    timeout: Duration,
    cache: Mutex<HashMap<PathBuf, RepoInfo>>,
}

impl Default for RepoResolver {
    fn default() -> Self {
        Self::new("git", GIT_TIMEOUT)
    }
}

impl RepoResolver {
    #[must_use]
    pub fn new(git: impl Into<String>, timeout: Duration) -> Self {
        Self {
            git: git.into(),
            timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Look up `cwd`. Missing directories and git failures resolve to an
    /// empty [`RepoInfo`].
    pub async fn resolve(&self, cwd: Option<&Path>) -> RepoInfo {
        let Some(cwd) = cwd else {
            return RepoInfo::default();
        };

        if let Some(cached) = self.cache.lock().await.get(cwd) {
            return cached.clone();
        }

        let info = RepoInfo {
            repository: self.git(cwd, &["remote", "get-url", "origin"]).await,
            branch: self
                .git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"])
                .await
                .filter(|b| b != "HEAD"),
        };
        debug!(
            cwd = %cwd.display(),
            repository = ?info.repository,
            branch = ?info.branch,
            "Resolved repository"
        );

        self.cache
            .lock()
            .await
            .insert(cwd.to_path_buf(), info.clone());
        info
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Option<String> {
        let mut cmd = Command::new(&self.git);
        cmd.args(args)
            .current_dir(cwd)
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!(cwd = %cwd.display(), error = %e, "git unavailable");
                return None;
            }
            Err(_) => {
                debug!(cwd = %cwd.display(), ?args, "git timed out");
                return None;
            }
        };

        if !output.status.success() {
            return None;
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!value.is_empty()).then_some(value)
    }

    #[cfg(test)]
    async fn cached_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}
