pub mod envelope;
pub mod payload;
pub mod poller;
pub mod simulation;
pub mod timefmt;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use envelope::{EnvelopeBuilder, ErrorBody, OperationEnvelope, OperationError, ENVELOPE_VERSION};
pub use poller::{Clock, PollExit, PollResult, PollSettings, PollingReport, StatusPoller, SystemClock, VirtualClock};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::Backend(_) => ErrorKind::Backend,
        }
    }

    /// Human message without the kind prefix, as surfaced in `error.message`.
    pub fn message(&self) -> &str {
        match self {
            CoreError::Validation(msg)
            | CoreError::NotFound(msg)
            | CoreError::Timeout(msg)
            | CoreError::Backend(msg) => msg,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Error taxonomy exposed to envelope consumers through `error.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "NotFoundError")]
    NotFound,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "BackendError")]
    Backend,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Backend => "BackendError",
        }
    }

    /// Process exit code: 1 for rejected input, 2 for anything the backend caused.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Validation => 1,
            ErrorKind::NotFound | ErrorKind::Timeout | ErrorKind::Backend => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "virtual:instance")]
    VirtualInstance,
    #[default]
    #[serde(rename = "physical:host")]
    PhysicalHost,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::VirtualInstance => "virtual:instance",
            ResourceType::PhysicalHost => "physical:host",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "virtual:instance" => Ok(ResourceType::VirtualInstance),
            "physical:host" => Ok(ResourceType::PhysicalHost),
            other => Err(CoreError::Validation(format!(
                "unsupported resource type '{other}' (expected virtual:instance or physical:host)"
            ))),
        }
    }
}

/// Lease lifecycle as reported by the reservation service. ERROR is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Active,
    Complete,
    Error,
    Terminated,
    Unknown,
}

impl ReservationStatus {
    pub fn from_blazar(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "STARTING" | "CREATING" | "UPDATING" => ReservationStatus::Pending,
            "ACTIVE" | "STARTED" => ReservationStatus::Active,
            "COMPLETE" | "COMPLETED" => ReservationStatus::Complete,
            "ERROR" => ReservationStatus::Error,
            "TERMINATING" | "TERMINATED" | "DELETED" => ReservationStatus::Terminated,
            _ => ReservationStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Complete => "COMPLETE",
            ReservationStatus::Error => "ERROR",
            ReservationStatus::Terminated => "TERMINATED",
            ReservationStatus::Unknown => "UNKNOWN",
        }
    }

    /// Statuses after which waiting for any other target is pointless.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Complete | ReservationStatus::Error | ReservationStatus::Terminated
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match ReservationStatus::from_blazar(s) {
            ReservationStatus::Unknown if !s.eq_ignore_ascii_case("UNKNOWN") => Err(
                CoreError::Validation(format!("unknown reservation status '{s}'")),
            ),
            status => Ok(status),
        }
    }
}

/// Nova server state. Anything outside BUILD/ACTIVE/ERROR is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServerStatus {
    Build,
    Active,
    Error,
    Simulated,
    Other(String),
}

impl ServerStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ServerStatus::Build => "BUILD",
            ServerStatus::Active => "ACTIVE",
            ServerStatus::Error => "ERROR",
            ServerStatus::Simulated => "simulated",
            ServerStatus::Other(raw) => raw,
        }
    }
}

impl From<String> for ServerStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "BUILD" | "build" => ServerStatus::Build,
            "ACTIVE" | "active" => ServerStatus::Active,
            "ERROR" | "error" => ServerStatus::Error,
            "simulated" => ServerStatus::Simulated,
            _ => ServerStatus::Other(raw),
        }
    }
}

impl From<ServerStatus> for String {
    fn from(status: ServerStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input of the create-reservation operation. `start` stays raw until validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub zone: String,
    pub start: String,
    pub duration_minutes: u32,
    pub node_count: u32,
    pub resource_type: ResourceType,
    pub name: Option<String>,
    /// Blazar resource filter, e.g. `["=", "$node_type", "gpu_rtx_6000"]`.
    pub resource_properties: Option<String>,
}

/// Foreign reference to a lease; never authoritative state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationHandle {
    pub reservation_id: String,
    pub zone: Option<String>,
}

impl ReservationHandle {
    pub fn new(reservation_id: impl Into<String>, zone: Option<String>) -> Self {
        Self {
            reservation_id: reservation_id.into(),
            zone,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.reservation_id.trim().is_empty() {
            return Err(CoreError::Validation(
                "reservation_id is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// A lease as observed through the reservation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub id: String,
    pub name: Option<String>,
    pub status: ReservationStatus,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub resource_type: Option<ResourceType>,
    pub allocated: bool,
    /// IDs of the reservations inside the lease (`reservations[].id`).
    pub reservation_ids: Vec<String>,
    /// Ironic node IDs held by the lease's `physical:host` reservations.
    #[serde(default)]
    pub reserved_hosts: Vec<String>,
}

impl LeaseRecord {
    /// Scheduler hint for Nova: physical host leases are addressed by their
    /// first reservation, everything else by the lease itself.
    pub fn scheduler_hint(&self) -> &str {
        match (self.resource_type, self.reservation_ids.first()) {
            (Some(ResourceType::PhysicalHost), Some(reservation)) => reservation,
            _ => &self.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusQuery {
    pub handle: ReservationHandle,
    pub wait_seconds: u64,
    pub interval_seconds: u64,
    pub target: ReservationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub handle: ReservationHandle,
    pub confirm: bool,
    pub wait_seconds: u64,
    pub interval_seconds: u64,
    pub treat_not_found_as_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityQuery {
    pub zone: String,
    pub start: String,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub reservation_id: String,
    pub repo: String,
    pub branch: String,
    pub workdir: String,
    pub timeout_seconds: u64,
}

impl ProvisionRequest {
    pub fn validate(&self) -> Result<()> {
        if self.reservation_id.trim().is_empty() || self.repo.trim().is_empty() {
            return Err(CoreError::Validation(
                "reservation_id and repo are required".to_string(),
            ));
        }
        if self.workdir.trim().is_empty() {
            return Err(CoreError::Validation("workdir is required".to_string()));
        }
        Ok(())
    }
}

/// Consumed once per launch call; partial failures are not retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLaunchRequest {
    pub reservation_id: String,
    pub image: String,
    pub flavor: String,
    pub network: String,
    pub key_name: String,
    pub security_groups: BTreeSet<String>,
    pub count: u32,
    pub assign_floating_ip: bool,
    pub name_prefix: String,
    pub user_data: Option<String>,
    pub wait_seconds: u64,
    pub interval_seconds: u64,
    /// Deploy the lease's Ironic nodes directly instead of booting through Nova.
    #[serde(default)]
    pub bare_metal: Option<BareMetalOptions>,
}

/// Direct Ironic deployment of `physical:host` reservations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BareMetalOptions {
    /// Glance image written to each node.
    pub image: String,
    pub ssh_user: String,
}

impl ServerLaunchRequest {
    pub fn validate(&self) -> Result<()> {
        let required = [
            &self.reservation_id,
            &self.image,
            &self.flavor,
            &self.network,
            &self.key_name,
        ];
        if required.iter().any(|value| value.trim().is_empty()) {
            return Err(CoreError::Validation(
                "reservation_id, image, flavor, network, and key_name are required".to_string(),
            ));
        }
        if self.count < 1 {
            return Err(CoreError::Validation(
                "count must be at least 1".to_string(),
            ));
        }
        if let Some(options) = &self.bare_metal {
            if options.image.trim().is_empty() {
                return Err(CoreError::Validation(
                    "bm_image is required when force_ironic is set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Login user for the launched machines: the bare metal override when
    /// present, otherwise a guess from the image name.
    pub fn ssh_user(&self, image_name: &str) -> String {
        match &self.bare_metal {
            Some(options) if !options.ssh_user.trim().is_empty() => options.ssh_user.clone(),
            _ => guess_ssh_user(image_name).to_string(),
        }
    }

    /// `prefix` for a single server, `prefix-N` (1-based) when launching several.
    pub fn server_name(&self, index: u32) -> String {
        if self.count > 1 {
            format!("{}-{}", self.name_prefix, index + 1)
        } else {
            self.name_prefix.clone()
        }
    }

    pub fn security_groups_or_default(&self) -> Vec<String> {
        if self.security_groups.is_empty() {
            vec!["default".to_string()]
        } else {
            self.security_groups.iter().cloned().collect()
        }
    }
}

/// One launched instance, shaped for SSH consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server_id: String,
    pub name: String,
    pub status: ServerStatus,
    pub fixed_ip: Option<String>,
    pub floating_ip: Option<String>,
    pub ssh_user: String,
    pub key_name: String,
}

/// Best guess of the login user baked into a cloud image.
pub fn guess_ssh_user(image_name: &str) -> &'static str {
    let name = image_name.to_ascii_lowercase();
    if name.contains("ubuntu") {
        "ubuntu"
    } else if name.contains("centos") {
        "centos"
    } else if name.contains("rocky") || name.contains("alma") {
        "cloud-user"
    } else if name.contains("debian") {
        "debian"
    } else if name.contains("fedora") {
        "fedora"
    } else {
        "unknown"
    }
}
