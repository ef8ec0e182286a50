use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::{ChangedFile, FileStatus};

/// Maximum number of push attempts before giving up.
const MAX_PUSH_ATTEMPTS: u32 = 3;

/// Validate that a branch name is safe: matches `^[a-zA-Z0-9/_.-]+$` and does not start with `refs/`.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Git("branch name must not be empty".to_string()));
    }
    if name.starts_with("refs/") || name.starts_with('-') {
        return Err(Error::Git(format!(
            "branch name must not start with 'refs/' or '-': {name}"
        )));
    }
    if name.contains("..") || name.ends_with('/') || name.ends_with(".lock") {
        return Err(Error::Git(format!("branch name is not a valid ref: {name}")));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '/' || c == '_' || c == '.' || c == '-')
    {
        return Err(Error::Git(format!(
            "branch name contains invalid characters (allowed: a-zA-Z0-9/_.-): {name}"
        )));
    }
    Ok(())
}

/// Run a git command in `dir`, returning stdout or stderr.
pub fn git_in_dir(dir: &Path, args: &[&str]) -> std::result::Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| format!("failed to run git: {e}"))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).to_string())
    }
}

/// Run a git operation on the blocking pool.
pub async fn blocking<G, T, F>(git: &Arc<G>, op: F) -> Result<T>
where
    G: GitOperations + 'static,
    T: Send + 'static,
    F: FnOnce(&G) -> Result<T> + Send + 'static,
{
    let git = Arc::clone(git);
    tokio::task::spawn_blocking(move || op(&*git))
        .await
        .map_err(|e| Error::Git(format!("git task failed: {e}")))?
}

/// Version-control operations the pipeline needs. Each call either fully
/// succeeds or reports a single error.
pub trait GitOperations: Send + Sync {
    /// Working tree the fix phase mutates.
    fn workdir(&self) -> &Path;

    /// Unified diff of `target` against its merge base with `base`.
    fn diff(&self, base: &str, target: &str) -> Result<String>;

    fn changed_files(&self, base: &str, target: &str) -> Result<Vec<ChangedFile>>;

    /// File content at `rev`, or `None` when the path does not exist there.
    fn show_file(&self, rev: &str, path: &str) -> Result<Option<String>>;

    /// Check out an existing branch or revision.
    fn checkout(&self, rev: &str) -> Result<()>;

    /// Check out `branch`, creating it from `start` when missing. Returns
    /// `true` when the branch was created.
    fn prepare_branch(&self, branch: &str, start: &str) -> Result<bool>;

    /// Stage everything and commit. `None` when there was nothing to commit.
    fn commit_all(&self, message: &str) -> Result<Option<String>>;

    fn commit_empty(&self, message: &str) -> Result<String>;

    /// Most recent commit on HEAD whose message contains every pattern.
    fn find_commit(&self, patterns: &[&str]) -> Result<Option<String>>;

    /// Drop uncommitted changes in the working tree.
    fn discard_changes(&self) -> Result<()>;

    fn push(&self, branch: &str) -> Result<()>;
}

/// [`GitOperations`] backed by the `git` CLI.
pub struct GitCli {
    repo_root: PathBuf,
}

impl GitCli {
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    /// Locate the repository containing `dir`.
    pub fn discover(dir: &Path) -> Result<Self> {
        let root = git_in_dir(dir, &["rev-parse", "--show-toplevel"])
            .map_err(|e| Error::Git(format!("not a git repository: {}", e.trim())))?;
        Ok(Self::new(PathBuf::from(root.trim())))
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "git");
        git_in_dir(&self.repo_root, args)
            .map_err(|e| Error::Git(format!("git {} failed: {}", args.join(" "), e.trim())))
    }

    fn head(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }
}

impl GitOperations for GitCli {
    fn workdir(&self) -> &Path {
        &self.repo_root
    }

    fn diff(&self, base: &str, target: &str) -> Result<String> {
        let range = format!("{base}...{target}");
        self.git(&["diff", "--no-color", &range])
    }

    fn changed_files(&self, base: &str, target: &str) -> Result<Vec<ChangedFile>> {
        let range = format!("{base}...{target}");
        let statuses = self.git(&["diff", "--name-status", "-M", &range])?;
        let numstat = self.git(&["diff", "--numstat", "-M", &range])?;
        Ok(parse_changed_files(&statuses, &numstat))
    }

    fn show_file(&self, rev: &str, path: &str) -> Result<Option<String>> {
        let spec = format!("{rev}:{path}");
        match git_in_dir(&self.repo_root, &["show", &spec]) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.contains("does not exist") || e.contains("exists on disk, but not in") => {
                Ok(None)
            }
            Err(e) => Err(Error::Git(format!("git show {spec} failed: {}", e.trim()))),
        }
    }

    fn checkout(&self, rev: &str) -> Result<()> {
        validate_branch_name(rev)?;
        self.git(&["checkout", "-q", rev, "--"])?;
        info!(rev, "checked out");
        Ok(())
    }

    fn prepare_branch(&self, branch: &str, start: &str) -> Result<bool> {
        validate_branch_name(branch)?;
        let exists = git_in_dir(
            &self.repo_root,
            &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
        )
        .is_ok();
        if exists {
            self.git(&["checkout", branch])?;
            info!(branch, "checked out existing fix branch");
        } else {
            self.git(&["checkout", "-b", branch, start])?;
            info!(branch, start, "created fix branch");
        }
        Ok(!exists)
    }

    fn commit_all(&self, message: &str) -> Result<Option<String>> {
        self.git(&["add", "-A"])?;
        if git_in_dir(&self.repo_root, &["diff", "--cached", "--quiet"]).is_ok() {
            return Ok(None);
        }
        self.git(&["commit", "--no-verify", "-m", message])?;
        self.head().map(Some)
    }

    fn commit_empty(&self, message: &str) -> Result<String> {
        self.git(&["commit", "--allow-empty", "--no-verify", "-m", message])?;
        self.head()
    }

    fn find_commit(&self, patterns: &[&str]) -> Result<Option<String>> {
        let greps: Vec<String> = patterns.iter().map(|p| format!("--grep={p}")).collect();
        let mut args = vec!["log", "--format=%H", "--fixed-strings", "--all-match", "-n", "1"];
        args.extend(greps.iter().map(String::as_str));
        let out = self.git(&args)?;
        let sha = out.trim();
        Ok((!sha.is_empty()).then(|| sha.to_string()))
    }

    fn discard_changes(&self) -> Result<()> {
        self.git(&["reset", "--hard", "HEAD"])?;
        self.git(&["clean", "-fd"])?;
        Ok(())
    }

    fn push(&self, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        let mut last_err = String::new();
        for attempt in 1..=MAX_PUSH_ATTEMPTS {
            match git_in_dir(&self.repo_root, &["push", "-u", "origin", branch]) {
                Ok(_) => {
                    info!(branch, attempt, "pushed fix branch");
                    return Ok(());
                }
                Err(stderr) => {
                    warn!(
                        attempt,
                        max = MAX_PUSH_ATTEMPTS,
                        error = %stderr.trim(),
                        "git push failed"
                    );
                    last_err = stderr;
                    if attempt < MAX_PUSH_ATTEMPTS {
                        std::thread::sleep(std::time::Duration::from_secs(1));
                    }
                }
            }
        }
        Err(Error::Git(format!(
            "git push origin {branch} failed after {MAX_PUSH_ATTEMPTS} attempts: {}",
            last_err.trim()
        )))
    }
}

/// Combine `--name-status` and `--numstat` output. Renamed entries are keyed
/// by their new path; their line counts are left at zero.
fn parse_changed_files(statuses: &str, numstat: &str) -> Vec<ChangedFile> {
    let mut files: Vec<ChangedFile> = statuses
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let code = parts.next()?.trim();
            let status = match code.chars().next()? {
                'A' => FileStatus::Added,
                'D' => FileStatus::Deleted,
                'R' => FileStatus::Renamed,
                'M' | 'C' | 'T' => FileStatus::Modified,
                _ => return None,
            };
            let path = parts.last()?.trim().to_string();
            Some(ChangedFile {
                path,
                status,
                additions: 0,
                deletions: 0,
            })
        })
        .collect();

    for line in numstat.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(add), Some(del), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if path.contains(" => ") {
            continue;
        }
        if let Some(file) = files.iter_mut().find(|f| f.path == path) {
            file.additions = add.parse().unwrap_or(0);
            file.deletions = del.parse().unwrap_or(0);
        }
    }
    files
}
