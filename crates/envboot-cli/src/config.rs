use envboot_providers::features::forge::service::ForgeDefaults;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_LEVEL: &str = "warn";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
pub const HTTP_TIMEOUT_VAR: &str = "ENVBOOT_HTTP_TIMEOUT_SECS";

pub type StartupError = Box<dyn std::error::Error + Send + Sync>;

/// Everything `main` resolves once and hands to the controllers.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_timeout: Duration,
    pub defaults: ForgeDefaults,
}

impl Settings {
    /// Read after the env file is loaded, so its values count.
    pub fn from_env(http_timeout_flag: Option<u64>) -> Self {
        Self::from_lookup(http_timeout_flag, |key| std::env::var(key).ok())
    }

    /// `--http-timeout-secs` wins over `ENVBOOT_HTTP_TIMEOUT_SECS`.
    pub fn from_lookup<F>(http_timeout_flag: Option<u64>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = http_timeout_flag
            .or_else(|| {
                let raw = lookup(HTTP_TIMEOUT_VAR)?;
                match raw.trim().parse::<u64>() {
                    Ok(secs) => Some(secs),
                    Err(e) => {
                        warn!(value = %raw, error = %e, "ignoring invalid {HTTP_TIMEOUT_VAR}");
                        None
                    }
                }
            })
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        Self {
            http_timeout: Duration::from_secs(secs.max(1)),
            defaults: ForgeDefaults::from_lookup(lookup),
        }
    }
}

/// Logs go to stderr so stdout carries only the envelope. An explicit
/// `--log-level` wins over `RUST_LOG`.
pub fn init_logging(level: Option<&str>) -> Result<(), StartupError> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_LEVEL))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .try_init()
}

/// Outcome of the env file step. It runs before logging exists, so the
/// outcome is logged once the subscriber is up.
#[derive(Debug)]
pub enum EnvFile {
    Loaded(PathBuf),
    Absent(dotenvy::Error),
    Failed(PathBuf, dotenvy::Error),
}

impl EnvFile {
    pub fn log(&self) {
        match self {
            EnvFile::Loaded(path) => info!(path = %path.display(), "environment file loaded"),
            EnvFile::Absent(e) => debug!(error = %e, "no .env file"),
            EnvFile::Failed(path, e) => {
                warn!(path = %path.display(), error = %e, "env file not loaded")
            }
        }
    }
}

/// Loads `path`, or `./.env` when no path is given. Variables already set in
/// the process are kept.
pub fn load_env_file(path: Option<&Path>) -> EnvFile {
    match path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => EnvFile::Loaded(path.to_path_buf()),
            Err(e) => EnvFile::Failed(path.to_path_buf(), e),
        },
        None => match dotenvy::dotenv() {
            Ok(found) => EnvFile::Loaded(found),
            Err(e) => EnvFile::Absent(e),
        },
    }
}
