pub mod repo;
pub mod service;

use repo::{AdvisorConfig, OpenAiAdvisorRepository};
use service::AdvisorService;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Advisor backed by the OpenAI-compatible endpoint in `OPENAI_*`, or a
/// defaults-only advisor when none is configured.
pub fn openai_service(timeout: Duration) -> AdvisorService {
    let Some(config) = AdvisorConfig::from_env() else {
        info!("OPENAI_API_KEY not set, advisor uses defaults");
        return AdvisorService::disabled();
    };
    match OpenAiAdvisorRepository::new(config, timeout) {
        Ok(repo) => AdvisorService::new(Arc::new(repo)),
        Err(e) => {
            warn!(error = %e, "advisor client unavailable, using defaults");
            AdvisorService::disabled()
        }
    }
}
