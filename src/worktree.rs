//! Git worktree management.
//!
//! Each agent runs in an isolated worktree under a declared base directory.
//! Creation applies the repo's include rules (globs in
//! `.botster/workspace_include`, for untracked files like `.env`);
//! destruction runs the repo's teardown commands
//! (`.botster/workspace_teardown`) under a hard timeout before
//! `git worktree remove --force`.
//!
//! Every destination path is validated to be a child of the base directory.
//! Attempts to escape are rejected before any git command runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use globset::{Glob, GlobSetBuilder};
use thiserror::Error;

use crate::constants::TEARDOWN_TIMEOUT;

/// Relative path of the include-patterns file inside a repo.
const INCLUDE_FILE: &str = ".botster/workspace_include";
/// Relative path of the teardown-commands file inside a repo.
const TEARDOWN_FILE: &str = ".botster/workspace_teardown";

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The destination path is not a child of the managed base directory.
    #[error("path {path} escapes worktree base {base}")]
    PathEscape {
        /// Offending path.
        path: PathBuf,
        /// Managed base directory.
        base: PathBuf,
    },
    /// A git command failed.
    #[error("git {command} failed: {stderr}")]
    Git {
        /// The git subcommand that failed.
        command: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Filesystem failure.
    #[error("worktree I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Manages git worktrees for agent sessions.
#[derive(Debug)]
pub struct WorktreeManager {
    /// Base directory all managed worktrees live under.
    base_dir: PathBuf,
}

impl WorktreeManager {
    /// Creates a manager rooted at `base_dir`.
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// The managed base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Creates a worktree of `repo_path` at `dest`, checked out to `branch`.
    ///
    /// The branch is created (from the repo's current HEAD) if it does not
    /// exist. After checkout, files matching the repo's include globs are
    /// copied in. Returns the worktree path.
    pub fn create(
        &self,
        repo_path: &Path,
        branch: &str,
        dest: &Path,
    ) -> Result<PathBuf, WorktreeError> {
        let dest = self.validate_dest(dest)?;
        fs::create_dir_all(&self.base_dir)?;

        // A stale worktree at the destination blocks `worktree add`.
        if dest.exists() {
            self.remove_registered_worktree(repo_path, &dest);
        }

        let dest_str = dest.to_string_lossy();
        if branch_exists(repo_path, branch) {
            log::info!("Using existing branch: {}", branch);
            run_git(repo_path, &["worktree", "add", &dest_str, branch])?;
        } else {
            log::info!("Creating new branch: {}", branch);
            run_git(repo_path, &["worktree", "add", "-b", branch, &dest_str])?;
        }

        self.apply_include_rules(repo_path, &dest);

        Ok(dest)
    }

    /// Destroys the worktree at `dest`: runs teardown commands (30 s cap
    /// each), removes the worktree, deletes `branch`.
    pub fn destroy(
        &self,
        repo_path: &Path,
        dest: &Path,
        branch: &str,
    ) -> Result<(), WorktreeError> {
        let dest = self.validate_dest(dest)?;

        if !dest.exists() {
            log::warn!("worktree {} already gone, skipping", dest.display());
            return Ok(());
        }

        // Worktrees have a `.git` *file* pointing at the main repo; a main
        // repo has a `.git` *directory*. Never delete the latter.
        if !dest.join(".git").is_file() {
            return Err(WorktreeError::Git {
                command: "worktree remove".to_string(),
                stderr: format!("{} is not a worktree", dest.display()),
            });
        }

        self.run_teardown(repo_path, &dest, branch);

        run_git(
            repo_path,
            &["worktree", "remove", &dest.to_string_lossy(), "--force"],
        )?;

        if let Err(e) = run_git(repo_path, &["branch", "-D", branch]) {
            log::warn!("failed to delete branch {}: {}", branch, e);
        }

        log::info!("deleted worktree at {}", dest.display());
        Ok(())
    }

    /// Lists worktrees of `repo_path` as `(path, branch)` pairs, excluding
    /// the main checkout. Used by the TUI worktree picker.
    pub fn list(&self, repo_path: &Path) -> Result<Vec<(PathBuf, String)>, WorktreeError> {
        let output = git_output(repo_path, &["worktree", "list", "--porcelain"])?;

        let mut worktrees = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch = String::new();

        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                current_branch = branch.to_string();
            } else if line.is_empty() {
                if let Some(path) = current_path.take() {
                    if path.join(".git").is_file() {
                        worktrees.push((path, std::mem::take(&mut current_branch)));
                    } else {
                        current_branch.clear();
                    }
                }
            }
        }
        if let Some(path) = current_path {
            if path.join(".git").is_file() {
                worktrees.push((path, current_branch));
            }
        }

        Ok(worktrees)
    }

    /// Verify `dest` lives under the base directory without requiring it to
    /// exist yet (canonicalize the base, compare lexically on the dest).
    fn validate_dest(&self, dest: &Path) -> Result<PathBuf, WorktreeError> {
        let base = self
            .base_dir
            .canonicalize()
            .unwrap_or_else(|_| self.base_dir.clone());

        let candidate = if dest.is_absolute() {
            dest.to_path_buf()
        } else {
            base.join(dest)
        };

        // Resolve what exists; normalize the rest lexically so `..` cannot
        // sneak out of the base.
        let resolved = candidate
            .canonicalize()
            .unwrap_or_else(|_| normalize_lexically(&candidate));

        if !resolved.starts_with(&base) {
            return Err(WorktreeError::PathEscape {
                path: dest.to_path_buf(),
                base,
            });
        }
        Ok(resolved)
    }

    /// Copy files matching the repo's include globs into the worktree.
    ///
    /// Missing or empty pattern files are fine; individual copy failures are
    /// logged and skipped so one unreadable file never aborts a spawn.
    fn apply_include_rules(&self, repo_path: &Path, dest: &Path) {
        let patterns_file = repo_path.join(INCLUDE_FILE);
        let Ok(content) = fs::read_to_string(&patterns_file) else {
            return;
        };

        let patterns: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();
        if patterns.is_empty() {
            return;
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => log::warn!("invalid include glob '{}': {}", pattern, e),
            }
        }
        let Ok(globset) = builder.build() else {
            return;
        };

        log::info!(
            "copying {} include pattern(s) into {}",
            patterns.len(),
            dest.display()
        );
        copy_matching_files(repo_path, dest, repo_path, &globset);
    }

    /// Run each teardown command under [`TEARDOWN_TIMEOUT`] with the
    /// standard `BOTSTER_*` environment. Failures are logged, never fatal.
    fn run_teardown(&self, repo_path: &Path, dest: &Path, branch: &str) {
        let commands = match read_teardown_commands(repo_path) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("failed to read teardown commands: {}", e);
                return;
            }
        };
        if commands.is_empty() {
            return;
        }

        log::info!("running {} teardown command(s)", commands.len());
        for cmd in commands {
            log::info!("teardown: {}", cmd);

            let spawned = Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .current_dir(dest)
                .env("BOTSTER_BRANCH_NAME", branch)
                .env("BOTSTER_WORKTREE_PATH", dest)
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn();

            let mut child = match spawned {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("teardown spawn failed: {}", e);
                    continue;
                }
            };

            let deadline = Instant::now() + TEARDOWN_TIMEOUT;
            let mut finished = false;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        if !status.success() {
                            log::warn!("teardown command exited with {}", status);
                        }
                        finished = true;
                        break;
                    }
                    Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                    Err(e) => {
                        log::warn!("teardown wait failed: {}", e);
                        finished = true;
                        break;
                    }
                }
            }

            if !finished {
                log::warn!("teardown command timed out, killing: {}", cmd);
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }

    /// Best-effort removal of a worktree left over from a previous run.
    fn remove_registered_worktree(&self, repo_path: &Path, dest: &Path) {
        log::info!("removing stale worktree at {}", dest.display());
        let removed = run_git(
            repo_path,
            &["worktree", "remove", &dest.to_string_lossy(), "--force"],
        );
        if removed.is_err() {
            let _ = run_git(repo_path, &["worktree", "prune"]);
            if dest.exists() {
                let _ = fs::remove_dir_all(dest);
            }
        }
    }
}

/// Detect the repository the hub is running in.
///
/// Returns the repo root and its `owner/name`. Name resolution order:
/// `BOTSTER_REPO` env var (tests and explicit override), then the origin
/// remote URL, then the directory name.
pub fn detect_current_repo() -> Result<(PathBuf, String), WorktreeError> {
    let current_dir = std::env::current_dir()?;

    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(&current_dir)
        .output()?;
    if !output.status.success() {
        return Err(WorktreeError::Git {
            command: "rev-parse --show-toplevel".to_string(),
            stderr: "not in a git repository".to_string(),
        });
    }
    let repo_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());

    let repo_name = if let Ok(env_repo) = std::env::var("BOTSTER_REPO") {
        env_repo
    } else if let Ok(url) = git_output(&repo_path, &["remote", "get-url", "origin"]) {
        // "https://github.com/owner/repo.git" or "git@github.com:owner/repo.git"
        let trimmed = url.trim().trim_end_matches(".git");
        let tail = trimmed.rsplit(['/', ':']).take(2).collect::<Vec<_>>();
        tail.into_iter().rev().collect::<Vec<_>>().join("/")
    } else {
        repo_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    };

    Ok((repo_path, repo_name))
}

/// Read non-empty, non-comment lines from the repo's teardown file.
fn read_teardown_commands(repo_path: &Path) -> std::io::Result<Vec<String>> {
    let path = repo_path.join(TEARDOWN_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

/// Recursively copy files under `current` matching the globset, preserving
/// paths relative to `source_root`. Shallow: file contents only, symlinks
/// and `.git/` skipped.
fn copy_matching_files(
    source_root: &Path,
    dest_root: &Path,
    current: &Path,
    globset: &globset::GlobSet,
) {
    let Ok(entries) = fs::read_dir(current) else {
        log::warn!("failed to read directory {}", current.display());
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();

        if path.file_name().and_then(|n| n.to_str()) == Some(".git") {
            continue;
        }
        if path.is_symlink() {
            continue;
        }

        let Ok(rel_path) = path.strip_prefix(source_root) else {
            continue;
        };

        if path.is_dir() {
            copy_matching_files(source_root, dest_root, &path, globset);
        } else if globset.is_match(rel_path) {
            let dest_path = dest_root.join(rel_path);
            if let Some(parent) = dest_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    log::warn!("mkdir {} failed: {}", parent.display(), e);
                    continue;
                }
            }
            match fs::copy(&path, &dest_path) {
                Ok(_) => log::debug!("copied {}", rel_path.display()),
                Err(e) => log::warn!("copy {} failed: {}", rel_path.display(), e),
            }
        }
    }
}

/// Run a git command in `repo_path`, discarding stdout.
fn run_git(repo_path: &Path, args: &[&str]) -> Result<(), WorktreeError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(WorktreeError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run a git command in `repo_path`, returning stdout.
fn git_output(repo_path: &Path, args: &[&str]) -> Result<String, WorktreeError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(WorktreeError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Checks whether a local branch exists in the repo at `path`.
fn branch_exists(path: &Path, branch: &str) -> bool {
    Command::new("git")
        .args([
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])
        .current_dir(path)
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Lexical path normalization: resolves `.` and `..` without touching the
/// filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_escape_rejected() {
        let base = TempDir::new().unwrap();
        let manager = WorktreeManager::new(base.path().to_path_buf());

        let outside = base.path().join("../elsewhere/wt");
        let err = manager.validate_dest(&outside).unwrap_err();
        assert!(matches!(err, WorktreeError::PathEscape { .. }));

        let sneaky = base.path().join("ok/../../etc");
        let err = manager.validate_dest(&sneaky).unwrap_err();
        assert!(matches!(err, WorktreeError::PathEscape { .. }));
    }

    #[test]
    fn test_relative_dest_resolves_under_base() {
        let base = TempDir::new().unwrap();
        let manager = WorktreeManager::new(base.path().to_path_buf());

        let resolved = manager.validate_dest(Path::new("acme-demo-42")).unwrap();
        assert!(resolved.starts_with(base.path().canonicalize().unwrap()));
    }

    #[test]
    fn test_destroy_missing_worktree_is_ok() {
        let base = TempDir::new().unwrap();
        let manager = WorktreeManager::new(base.path().to_path_buf());
        let gone = base.path().join("never-existed");
        assert!(manager
            .destroy(base.path(), &gone, "botster-issue-1")
            .is_ok());
    }

    #[test]
    fn test_destroy_refuses_main_repo() {
        let base = TempDir::new().unwrap();
        let manager = WorktreeManager::new(base.path().to_path_buf());

        // Simulate a main repo inside the base: .git is a directory.
        let repo = base.path().join("mainrepo");
        fs::create_dir_all(repo.join(".git")).unwrap();

        let err = manager.destroy(base.path(), &repo, "main").unwrap_err();
        assert!(matches!(err, WorktreeError::Git { .. }));
        assert!(repo.exists());
    }

    #[test]
    fn test_read_teardown_commands_filters_comments() {
        let repo = TempDir::new().unwrap();
        fs::create_dir_all(repo.path().join(".botster")).unwrap();
        fs::write(
            repo.path().join(TEARDOWN_FILE),
            "# comment\n\n  docker compose down  \necho done\n",
        )
        .unwrap();

        let commands = read_teardown_commands(repo.path()).unwrap();
        assert_eq!(commands, vec!["docker compose down", "echo done"]);
    }

    #[test]
    fn test_copy_matching_files_respects_globs() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();

        fs::write(src.path().join(".env"), "SECRET=1").unwrap();
        fs::create_dir_all(src.path().join("config")).unwrap();
        fs::write(src.path().join("config/local.yml"), "a: 1").unwrap();
        fs::write(src.path().join("README.md"), "nope").unwrap();

        let mut builder = GlobSetBuilder::new();
        builder.add(Glob::new(".env").unwrap());
        builder.add(Glob::new("config/*.yml").unwrap());
        let globset = builder.build().unwrap();

        copy_matching_files(src.path(), dst.path(), src.path(), &globset);

        assert!(dst.path().join(".env").exists());
        assert!(dst.path().join("config/local.yml").exists());
        assert!(!dst.path().join("README.md").exists());
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}
