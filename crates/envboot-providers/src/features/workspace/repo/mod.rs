use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("git clone failed: {0}")]
    Clone(String),
}

impl WorkspaceError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        WorkspaceError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type WorkspaceResult<T> = std::result::Result<T, WorkspaceError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutState {
    Running,
    Finished,
    Failed(String),
}

/// A checkout running in the background.
pub trait CheckoutJob: Send {
    fn state(&mut self) -> WorkspaceResult<CheckoutState>;
    fn kill(&mut self) -> WorkspaceResult<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait WorkspaceRepository: Send + Sync {
    /// Removes `workdir` if present and creates it empty.
    fn reset(&self, workdir: &Path) -> WorkspaceResult<()>;
    fn copy_tree(&self, source: &Path, dest: &Path) -> WorkspaceResult<()>;
    fn spawn_clone(&self, repo: &str, branch: &str, dest: &Path) -> WorkspaceResult<Box<dyn CheckoutJob>>;
    fn write_json(&self, path: &Path, value: &Value) -> WorkspaceResult<()>;
}

/// Local filesystem plus the `git` binary on `PATH`.
pub struct LocalWorkspaceRepository {
    git: PathBuf,
}

impl LocalWorkspaceRepository {
    pub fn new() -> Self {
        Self::with_git("git")
    }

    pub fn with_git(git: impl Into<PathBuf>) -> Self {
        Self { git: git.into() }
    }
}

impl Default for LocalWorkspaceRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceRepository for LocalWorkspaceRepository {
    fn reset(&self, workdir: &Path) -> WorkspaceResult<()> {
        if workdir.exists() {
            fs::remove_dir_all(workdir).map_err(|e| WorkspaceError::io("remove", workdir, e))?;
        }
        fs::create_dir_all(workdir).map_err(|e| WorkspaceError::io("create", workdir, e))
    }

    fn copy_tree(&self, source: &Path, dest: &Path) -> WorkspaceResult<()> {
        fs::create_dir_all(dest).map_err(|e| WorkspaceError::io("create", dest, e))?;
        let entries = fs::read_dir(source).map_err(|e| WorkspaceError::io("read", source, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| WorkspaceError::io("read", source, e))?;
            let from = entry.path();
            let to = dest.join(entry.file_name());
            // Symlinks are followed; the copy holds their targets.
            let metadata = fs::metadata(&from).map_err(|e| WorkspaceError::io("stat", &from, e))?;
            if metadata.is_dir() {
                self.copy_tree(&from, &to)?;
            } else {
                fs::copy(&from, &to).map_err(|e| WorkspaceError::io("copy", &from, e))?;
            }
        }
        Ok(())
    }

    fn spawn_clone(&self, repo: &str, branch: &str, dest: &Path) -> WorkspaceResult<Box<dyn CheckoutJob>> {
        let child = Command::new(&self.git)
            .args(["clone", "--branch", branch, "--single-branch", repo])
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WorkspaceError::io("spawn", &self.git, e))?;
        Ok(Box::new(GitCheckout { child }))
    }

    fn write_json(&self, path: &Path, value: &Value) -> WorkspaceResult<()> {
        let body = serde_json::to_string_pretty(value)
            .map_err(|e| WorkspaceError::io("encode", path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        fs::write(path, body).map_err(|e| WorkspaceError::io("write", path, e))
    }
}

struct GitCheckout {
    child: Child,
}

impl CheckoutJob for GitCheckout {
    fn state(&mut self) -> WorkspaceResult<CheckoutState> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| WorkspaceError::Clone(e.to_string()))?;
        Ok(match status {
            None => CheckoutState::Running,
            Some(status) if status.success() => CheckoutState::Finished,
            Some(status) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = self.child.stderr.take() {
                    let _ = io::Read::read_to_string(&mut pipe, &mut stderr);
                }
                let stderr = stderr.trim();
                CheckoutState::Failed(if stderr.is_empty() {
                    format!("git exited with {status}")
                } else {
                    stderr.to_string()
                })
            }
        })
    }

    fn kill(&mut self) -> WorkspaceResult<()> {
        self.child
            .kill()
            .map_err(|e| WorkspaceError::Clone(e.to_string()))?;
        let _ = self.child.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reset_clears_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("work");
        fs::create_dir_all(workdir.join("stale")).unwrap();
        fs::write(workdir.join("stale/file.txt"), "old").unwrap();

        LocalWorkspaceRepository::new().reset(&workdir).unwrap();

        assert!(workdir.is_dir());
        assert_eq!(fs::read_dir(&workdir).unwrap().count(), 0);
    }

    #[test]
    fn test_copy_tree_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("project");
        fs::create_dir_all(source.join("src")).unwrap();
        fs::write(source.join("README.md"), "# project").unwrap();
        fs::write(source.join("src/main.py"), "print('hi')").unwrap();

        let dest = dir.path().join("out/project");
        LocalWorkspaceRepository::new().copy_tree(&source, &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("src/main.py")).unwrap(), "print('hi')");
        assert!(dest.join("README.md").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared");
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("environment.yml"), "name: demo").unwrap();

        let source = dir.path().join("project");
        fs::create_dir_all(&source).unwrap();
        std::os::unix::fs::symlink(&shared, source.join("conf")).unwrap();
        std::os::unix::fs::symlink(shared.join("environment.yml"), source.join("environment.yml")).unwrap();

        let dest = dir.path().join("out/project");
        LocalWorkspaceRepository::new().copy_tree(&source, &dest).unwrap();

        assert!(dest.join("conf").is_dir());
        assert!(!fs::symlink_metadata(dest.join("conf")).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(dest.join("conf/environment.yml")).unwrap(), "name: demo");
        assert_eq!(fs::read_to_string(dest.join("environment.yml")).unwrap(), "name: demo");
    }

    #[test]
    fn test_write_json_is_pretty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provision.json");
        LocalWorkspaceRepository::new()
            .write_json(&path, &json!({ "repo": "x" }))
            .unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "{\n  \"repo\": \"x\"\n}");
    }

    #[test]
    fn test_missing_git_binary_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalWorkspaceRepository::with_git(dir.path().join("no-such-git"));
        let err = repo
            .spawn_clone("https://example.invalid/repo.git", "main", &dir.path().join("w"))
            .err()
            .unwrap();
        assert!(matches!(err, WorkspaceError::Io { action: "spawn", .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_clone_reports_failed_state() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalWorkspaceRepository::with_git("false");
        let mut job = repo.spawn_clone("unused", "main", &dir.path().join("w")).unwrap();

        let mut state = job.state().unwrap();
        for _ in 0..50 {
            if state != CheckoutState::Running {
                break;
            }
            thread::sleep(Duration::from_millis(20));
            state = job.state().unwrap();
        }
        assert!(matches!(state, CheckoutState::Failed(_)));
    }
}
