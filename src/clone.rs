use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::run_git;

/// Branch names reach `git` command lines verbatim. Only names that start
/// with an ASCII alphanumeric and continue with alphanumerics, `/`, `_`,
/// `.` or `-` get through; fully-qualified refs are refused outright.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.starts_with("refs/") {
        return Err(Error::Clone(format!(
            "refusing fully-qualified ref as a branch name: {name}"
        )));
    }
    let safe = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9/_.-]*$").expect("valid regex");
    if !safe.is_match(name) {
        return Err(Error::Clone(format!(
            "branch name rejected by safety rule: {name:?}"
        )));
    }
    Ok(())
}

/// A completed shallow clone.
#[derive(Debug, Clone)]
pub struct CloneResult {
    pub path: PathBuf,
    pub branch: String,
    pub commit: String,
}

/// Release handle for a clone's scratch directory.
///
/// `release` is idempotent: the directory is removed at most once no matter
/// how many paths race to clean up.
#[derive(Debug)]
pub struct CloneHandle {
    path: PathBuf,
    released: AtomicBool,
}

impl CloneHandle {
    /// Wrap an existing directory for tests that fabricate fix jobs.
    #[cfg(test)]
    pub(crate) fn new_for_tests(path: PathBuf) -> Self {
        Self::new(path)
    }

    fn new(path: PathBuf) -> Self {
        Self {
            path,
            released: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the scratch directory. Returns true on the call that actually
    /// performed the removal.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            // Already-gone is fine; anything else is worth a warning.
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove clone dir");
            }
        }
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Shallow-clones repositories into per-job scratch directories.
pub struct CloneManager {
    scratch_root: PathBuf,
}

impl CloneManager {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
        }
    }

    fn scratch_dir(&self, owner: &str, repo: &str) -> PathBuf {
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        self.scratch_root.join(format!("{owner}-{repo}-{nanos}"))
    }

    /// Perform a depth-1 single-branch clone of `clone_url` (HEAD when
    /// `branch` is None), resolve the checked-out branch and commit, and
    /// return the result with a release handle. The scratch directory is
    /// removed on any error.
    pub async fn clone_shallow(
        &self,
        clone_url: &str,
        owner: &str,
        repo: &str,
        branch: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(CloneResult, Arc<CloneHandle>)> {
        if let Some(b) = branch {
            validate_branch_name(b)?;
        }

        std::fs::create_dir_all(&self.scratch_root).map_err(|e| {
            Error::Clone(format!(
                "failed to create scratch root {}: {e}",
                self.scratch_root.display()
            ))
        })?;

        let dest = self.scratch_dir(owner, repo);
        let handle = Arc::new(CloneHandle::new(dest.clone()));

        let result = self
            .clone_into(clone_url, &dest, branch, cancel)
            .await;

        match result {
            Ok(clone) => {
                info!(
                    owner,
                    repo,
                    branch = %clone.branch,
                    commit = %clone.commit,
                    "cloned"
                );
                Ok((clone, handle))
            }
            Err(e) => {
                handle.release();
                Err(e)
            }
        }
    }

    async fn clone_into(
        &self,
        clone_url: &str,
        dest: &Path,
        branch: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CloneResult> {
        let dest_str = dest.display().to_string();
        let mut args = vec!["clone", "--depth", "1", "--single-branch"];
        if let Some(b) = branch {
            args.push("--branch");
            args.push(b);
        }
        args.push(clone_url);
        args.push(&dest_str);

        debug!(dest = %dest.display(), "cloning (shallow)");
        run_git(&self.scratch_root, &args, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                other => Error::Clone(other.to_string()),
            })?;

        let commit = run_git(dest, &["rev-parse", "HEAD"], cancel)
            .await
            .map_err(|e| Error::Clone(format!("rev-parse failed: {e}")))?
            .trim()
            .to_string();

        let branch = match branch {
            Some(b) => b.to_string(),
            None => run_git(dest, &["rev-parse", "--abbrev-ref", "HEAD"], cancel)
                .await
                .map_err(|e| Error::Clone(format!("branch resolve failed: {e}")))?
                .trim()
                .to_string(),
        };

        Ok(CloneResult {
            path: dest.to_path_buf(),
            branch,
            commit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Build a local git repo with one commit to clone from.
    async fn fixture_repo(dir: &Path) -> String {
        let cancel = CancellationToken::new();
        std::fs::create_dir_all(dir).unwrap();
        run_git(dir, &["init", "-b", "main"], &cancel).await.unwrap();
        run_git(dir, &["config", "user.email", "t@t"], &cancel).await.unwrap();
        run_git(dir, &["config", "user.name", "t"], &cancel).await.unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        run_git(dir, &["add", "-A"], &cancel).await.unwrap();
        run_git(dir, &["commit", "-m", "init"], &cancel).await.unwrap();
        dir.display().to_string()
    }

    #[test]
    fn test_validate_branch_name() {
        assert!(validate_branch_name("ctrlscan/fix-1-2").is_ok());
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("refs/heads/main").is_err());
        assert!(validate_branch_name("bad branch").is_err());
        assert!(validate_branch_name("b;rm -rf").is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("clone");
        std::fs::create_dir_all(&dir).unwrap();
        let handle = CloneHandle::new(dir.clone());
        assert!(handle.release());
        assert!(!dir.exists());
        // Second release is a no-op
        assert!(!handle.release());
        assert!(handle.is_released());
    }

    #[tokio::test]
    async fn test_clone_shallow_resolves_commit_and_branch() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let url = fixture_repo(&src).await;

        let mgr = CloneManager::new(tmp.path().join("scratch"));
        let cancel = CancellationToken::new();
        let (clone, handle) = mgr
            .clone_shallow(&url, "octo", "webapp", None, &cancel)
            .await
            .unwrap();
        assert!(clone.path.join("README.md").exists());
        assert_eq!(clone.branch, "main");
        assert_eq!(clone.commit.len(), 40);
        handle.release();
        assert!(!clone.path.exists());
    }

    #[tokio::test]
    async fn test_clone_failure_removes_scratch_dir() {
        let tmp = TempDir::new().unwrap();
        let mgr = CloneManager::new(tmp.path().join("scratch"));
        let cancel = CancellationToken::new();
        let err = mgr
            .clone_shallow(
                &tmp.path().join("nonexistent").display().to_string(),
                "octo",
                "gone",
                None,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Clone(_)));
        // No scratch dirs left behind
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("scratch"))
            .map(|rd| rd.collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_clone_rejects_bad_branch() {
        let tmp = TempDir::new().unwrap();
        let mgr = CloneManager::new(tmp.path().join("scratch"));
        let cancel = CancellationToken::new();
        let err = mgr
            .clone_shallow("https://example.invalid/r.git", "o", "r", Some("bad branch"), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected by safety rule"));
    }
}
