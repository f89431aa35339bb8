use crate::features::workspace::repo::{CheckoutState, WorkspaceError, WorkspaceRepository};
use chrono::Utc;
use envboot_core::payload::{ProvisionData, ProvisionStatus, PROVISION_DESCRIPTOR};
use envboot_core::timefmt::format_utc;
use envboot_core::{
    simulation, Clock, CoreError, OperationError, PollExit, PollSettings, PollingReport,
    ProvisionRequest, StatusPoller,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CHECKOUT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Files that describe how a project expects to be run.
pub const ENVIRONMENT_FILES: [&str; 11] = [
    "README.md",
    "README.rst",
    "requirements.txt",
    "pyproject.toml",
    "setup.py",
    "environment.yml",
    "Dockerfile",
    ".python-version",
    "poetry.lock",
    "Pipfile",
    "package.json",
];

pub const ENVIRONMENT_FILE_LIMIT: usize = 10_000;

impl From<WorkspaceError> for OperationError {
    fn from(error: WorkspaceError) -> Self {
        OperationError::new(CoreError::Backend(error.to_string()))
    }
}

/// Outcome of a real provisioning run, with the path the sources landed in.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub data: ProvisionData,
    pub checkout: PathBuf,
}

pub struct WorkspaceService {
    repo: Arc<dyn WorkspaceRepository>,
    clock: Arc<dyn Clock>,
}

impl WorkspaceService {
    pub fn new(repo: Arc<dyn WorkspaceRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub fn provision(&self, request: &ProvisionRequest, dry_run: bool) -> Result<ProvisionData, OperationError> {
        request.validate()?;
        if dry_run {
            return Ok(simulation::provision(request));
        }
        Ok(self.checkout(request)?.data)
    }

    /// Recreates the workdir, fetches the sources into it and writes the
    /// provisioning descriptor.
    pub fn checkout(&self, request: &ProvisionRequest) -> Result<Provisioned, OperationError> {
        request.validate()?;
        let workdir = Path::new(&request.workdir);
        self.repo.reset(workdir)?;

        let local = Path::new(&request.repo);
        let (checkout, report) = if local.is_dir() {
            let name = local.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("repo"));
            let dest = workdir.join(name);
            self.repo.copy_tree(local, &dest)?;
            info!(source = %local.display(), dest = %dest.display(), "local repository copied");
            (dest, None)
        } else {
            let report = self.clone_repo(request, workdir)?;
            (workdir.to_path_buf(), Some(report))
        };

        let descriptor = workdir.join(PROVISION_DESCRIPTOR);
        self.repo.write_json(
            &descriptor,
            &json!({
                "reservation_id": request.reservation_id,
                "repo": request.repo,
                "branch": request.branch,
                "workdir": request.workdir,
                "checkout": checkout.display().to_string(),
                "timestamp": format_utc(&Utc::now()),
            }),
        )?;

        Ok(Provisioned {
            data: ProvisionData {
                reservation_id: request.reservation_id.clone(),
                repo: request.repo.clone(),
                branch: request.branch.clone(),
                workdir: request.workdir.clone(),
                status: ProvisionStatus::Prepared,
                artifacts: vec![descriptor.display().to_string()],
                dry_run: false,
                checkout: report,
            },
            checkout,
        })
    }

    fn clone_repo(&self, request: &ProvisionRequest, workdir: &Path) -> Result<PollingReport, OperationError> {
        let settings = PollSettings {
            timeout: Duration::from_secs(request.timeout_seconds),
            interval: CHECKOUT_POLL_INTERVAL,
        };
        let mut job = self.repo.spawn_clone(&request.repo, &request.branch, workdir)?;
        info!(repo = %request.repo, branch = %request.branch, "git clone started");

        let result = StatusPoller::new(self.clock.as_ref(), settings).poll(
            || job.state(),
            |state| *state == CheckoutState::Finished,
            |state| matches!(state, CheckoutState::Failed(_)),
        );
        let report = result.report(&settings);

        match (result.exit, result.final_status) {
            (PollExit::Reached, _) => {
                info!(repo = %request.repo, elapsed = report.elapsed_seconds, "git clone finished");
                Ok(report)
            }
            (PollExit::Terminal, Some(CheckoutState::Failed(message))) => {
                Err(OperationError::from(WorkspaceError::Clone(message))
                    .with_detail("repo", request.repo.clone()))
            }
            (PollExit::FetchFailed, _) => Err(result
                .error
                .map(OperationError::from)
                .unwrap_or_else(|| CoreError::Backend("git clone status unavailable".to_string()).into())
                .with_detail("repo", request.repo.clone())),
            _ => {
                if let Err(e) = job.kill() {
                    warn!(error = %e, "failed to stop git clone");
                }
                warn!(repo = %request.repo, timeout = request.timeout_seconds, "git clone timed out");
                Err(OperationError::new(CoreError::Timeout(format!(
                    "git clone of {} did not finish within {}s",
                    request.repo, request.timeout_seconds
                )))
                .with_detail("repo", request.repo.clone()))
            }
        }
    }
}

/// Reads the environment files present at the top of `root`, truncating each
/// to [`ENVIRONMENT_FILE_LIMIT`] characters.
pub fn environment_files(root: &Path) -> BTreeMap<String, String> {
    ENVIRONMENT_FILES
        .iter()
        .filter_map(|name| {
            let bytes = fs::read(root.join(name)).ok()?;
            let content = String::from_utf8_lossy(&bytes);
            let content = if content.chars().count() > ENVIRONMENT_FILE_LIMIT {
                let head: String = content.chars().take(ENVIRONMENT_FILE_LIMIT).collect();
                format!("{head}\n... (truncated)")
            } else {
                content.into_owned()
            };
            Some((name.to_string(), content))
        })
        .collect()
}
