use crate::features::advisor::repo::{parse_json_reply, AdvisorError, AdvisorRepository};
use crate::features::compute::repo::ImageRecord;
use envboot_core::payload::{Decision, DecisionSource, Requirements};
use envboot_core::timefmt::MAX_DURATION_MINUTES;
use envboot_core::{CoreError, OperationError};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const IMAGE_PREFIX: &str = "CC-";
pub const DEFAULT_IMAGE: &str = "CC-Ubuntu22.04";
pub const DEFAULT_GPU_NODE_TYPE: &str = "gpu_rtx_6000";
pub const DEFAULT_NODE_TYPE: &str = "compute_cascadelake_r640";
pub const DEFAULT_DURATION_HOURS: u32 = 24;
pub const MAX_DURATION_HOURS: u32 = MAX_DURATION_MINUTES / 60;

const REQUIREMENTS_PROMPT: &str = "You are a DevOps engineer. Infer the hardware and software \
needed to run a project from its configuration files. Reply with a JSON object with the fields \
cpu_cores (integer or null), ram_gb (integer or null), gpu_required (boolean), gpu_memory_gb \
(integer or null), disk_gb (integer or null), os_type (e.g. \"ubuntu\"), os_version (e.g. \
\"22.04\"), cuda_required (boolean), python_version (string or null) and special_requirements \
(array of strings). Use null for anything you cannot determine.";

const IMAGE_PROMPT: &str = "You are a Linux administrator choosing a bare-metal image. Images \
named CC-Ubuntu22.04-CUDA carry CUDA; date suffixes mark snapshots. Pick at most five images \
from the list that fit the requirements, best first. Reply with JSON: \
{\"candidates\": [names], \"reasoning\": string}.";

const NODE_TYPE_PROMPT: &str = "You are a cloud capacity planner. compute_* node types are \
general purpose, gpu_* carry GPUs, storage_* are storage optimized. Choose the single best node \
type for the requirements, copying its name exactly from the list. Reply with JSON: \
{\"node_type\": string, \"reasoning\": string}.";

const DURATION_PROMPT: &str = "You size cloud reservations. Suggest how many hours the project \
needs a machine for; use 24 when nothing suggests otherwise. Reply with JSON: \
{\"duration_hours\": integer, \"reasoning\": string}.";

/// A value chosen for one decision step, with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advice<T> {
    pub value: T,
    pub source: DecisionSource,
    pub reasoning: Option<String>,
}

impl<T: Display> Advice<T> {
    fn fallback(value: T, reasoning: impl Into<String>) -> Self {
        Self {
            value,
            source: DecisionSource::Default,
            reasoning: Some(reasoning.into()),
        }
    }

    pub fn decision(&self, step: &str) -> Decision {
        Decision {
            step: step.to_string(),
            value: self.value.to_string(),
            source: self.source,
            reasoning: self.reasoning.clone(),
        }
    }
}

/// Optional AI pre-step. Every question has a fixed default, so a missing or
/// failing endpoint never blocks the caller.
pub struct AdvisorService {
    repo: Option<Arc<dyn AdvisorRepository>>,
}

impl AdvisorService {
    pub fn new(repo: Arc<dyn AdvisorRepository>) -> Self {
        Self { repo: Some(repo) }
    }

    pub fn disabled() -> Self {
        Self { repo: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.repo.is_some()
    }

    /// Infers requirements from repository files. The advice is sourced
    /// `Ai` only when the endpoint answered with usable requirements.
    pub fn analyze(&self, files: &BTreeMap<String, String>) -> Advice<Requirements> {
        let defaults = |reasoning: &str| Advice {
            value: Requirements::default(),
            source: DecisionSource::Default,
            reasoning: Some(reasoning.to_string()),
        };
        if files.is_empty() {
            return defaults("no environment files found");
        }
        let listing = files
            .iter()
            .map(|(name, content)| format!("=== {name} ===\n{content}"))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!(
            "Analyze these repository files and infer the requirements:\n\n{listing}"
        );
        let Some(reply) = self.ask(REQUIREMENTS_PROMPT, &prompt, 0.3) else {
            return defaults("advisor unavailable");
        };
        match serde_json::from_value::<Requirements>(reply) {
            Ok(requirements) => {
                info!(gpu = requirements.gpu_required, cuda = requirements.cuda_required, "requirements inferred");
                Advice {
                    value: requirements,
                    source: DecisionSource::Ai,
                    reasoning: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "advisor requirements did not parse, using defaults");
                defaults("advisor reply unusable")
            }
        }
    }

    /// Picks an image among the active `CC-` images.
    pub fn select_image(
        &self,
        requirements: &Requirements,
        images: &[ImageRecord],
    ) -> Result<Advice<String>, OperationError> {
        let candidates: BTreeSet<&str> = images
            .iter()
            .map(|image| image.name.as_str())
            .filter(|name| name.starts_with(IMAGE_PREFIX))
            .collect();
        let Some(first) = candidates.iter().next().copied() else {
            return Err(CoreError::Validation(format!(
                "no active {IMAGE_PREFIX}* images are available"
            ))
            .into());
        };

        let prompt = format!(
            "{}\n\nAvailable images:\n{}",
            describe(requirements),
            candidates.iter().map(|name| format!("- {name}")).collect::<Vec<_>>().join("\n")
        );
        if let Some(reply) = self.ask(IMAGE_PROMPT, &prompt, 0.3) {
            let picked = reply
                .get("candidates")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .find(|name| candidates.contains(name));
            match picked {
                Some(name) => {
                    return Ok(Advice {
                        value: name.to_string(),
                        source: DecisionSource::Ai,
                        reasoning: reasoning(&reply),
                    })
                }
                None => warn!("advisor suggested no available image"),
            }
        }

        Ok(if candidates.contains(DEFAULT_IMAGE) {
            Advice::fallback(DEFAULT_IMAGE.to_string(), "default image")
        } else {
            Advice::fallback(first.to_string(), format!("{DEFAULT_IMAGE} unavailable, first {IMAGE_PREFIX} image"))
        })
    }

    /// `requested` wins; then the advisor, restricted to `available`; then a
    /// GPU or general-purpose default.
    pub fn choose_node_type(
        &self,
        requested: Option<&str>,
        requirements: &Requirements,
        available: &BTreeSet<String>,
    ) -> Advice<String> {
        if let Some(node_type) = requested.filter(|s| !s.trim().is_empty()) {
            return Advice {
                value: node_type.to_string(),
                source: DecisionSource::Operator,
                reasoning: None,
            };
        }

        if !available.is_empty() {
            let prompt = format!(
                "{}\n\nAvailable node types: {}",
                describe(requirements),
                available.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
            );
            if let Some(reply) = self.ask(NODE_TYPE_PROMPT, &prompt, 0.3) {
                match reply.get("node_type").and_then(Value::as_str) {
                    Some(node_type) if available.contains(node_type) => {
                        return Advice {
                            value: node_type.to_string(),
                            source: DecisionSource::Ai,
                            reasoning: reasoning(&reply),
                        }
                    }
                    other => warn!(suggested = ?other, "advisor node type is not offered"),
                }
            }
        }

        if requirements.gpu_required {
            Advice::fallback(DEFAULT_GPU_NODE_TYPE.to_string(), "GPU required")
        } else {
            Advice::fallback(DEFAULT_NODE_TYPE.to_string(), "general purpose default")
        }
    }

    /// Lease length in hours, clamped to the reservation service maximum.
    pub fn lease_duration(&self, requirements: &Requirements) -> Advice<u32> {
        let prompt = describe(requirements);
        if let Some(reply) = self.ask(DURATION_PROMPT, &prompt, 0.3) {
            let hours = match reply.get("duration_hours") {
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            if let Some(hours) = hours.filter(|h| h.is_finite() && *h >= 1.0) {
                return Advice {
                    value: (hours.round() as u32).min(MAX_DURATION_HOURS),
                    source: DecisionSource::Ai,
                    reasoning: reasoning(&reply),
                };
            }
            warn!("advisor duration unusable, using default");
        }
        Advice::fallback(DEFAULT_DURATION_HOURS, "default lease length")
    }

    fn ask(&self, system: &str, user: &str, temperature: f32) -> Option<Value> {
        let repo = self.repo.as_ref()?;
        let reply = repo
            .complete(system, user, temperature)
            .and_then(|text| parse_json_reply(&text));
        match reply {
            Ok(value) => {
                debug!(reply = %value, "advisor replied");
                Some(value)
            }
            Err(e) => {
                log_fallback(&e);
                None
            }
        }
    }
}

fn log_fallback(error: &AdvisorError) {
    warn!(error = %error, "advisor unavailable, falling back to defaults");
}

fn reasoning(reply: &Value) -> Option<String> {
    reply
        .get("reasoning")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn describe(requirements: &Requirements) -> String {
    let or_na = |value: Option<String>| value.unwrap_or_else(|| "N/A".to_string());
    format!(
        "Requirements:\n- OS: {} {}\n- CPU cores: {}\n- RAM: {} GB\n- GPU required: {}\n- GPU memory: {} GB\n- CUDA required: {}\n- Disk: {} GB",
        requirements.os_type.as_deref().unwrap_or("ubuntu"),
        requirements.os_version.as_deref().unwrap_or("22.04"),
        or_na(requirements.cpu_cores.map(|v| v.to_string())),
        or_na(requirements.ram_gb.map(|v| v.to_string())),
        requirements.gpu_required,
        or_na(requirements.gpu_memory_gb.map(|v| v.to_string())),
        requirements.cuda_required,
        or_na(requirements.disk_gb.map(|v| v.to_string())),
    )
}
