//! `data` payloads of every operation. Live and dry-run paths build the same types.

use crate::poller::PollingReport;
use crate::{ReservationStatus, ResourceType, ServerRecord};
use serde::{Deserialize, Deserializer, Serialize};

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityNode {
    pub uuid: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityData {
    pub zone: String,
    pub start: String,
    pub end: String,
    pub duration_minutes: u32,
    pub available_nodes: usize,
    pub nodes: Vec<CapacityNode>,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseCreateStatus {
    Created,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseData {
    pub reservation_id: String,
    pub name: String,
    pub zone: String,
    pub start: String,
    pub end: String,
    pub duration_minutes: u32,
    pub nodes_requested: u32,
    pub resource_type: ResourceType,
    pub status: LeaseCreateStatus,
    /// Backend lease status after creation, or after the optional wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_status: Option<ReservationStatus>,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling: Option<PollingReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseStatusData {
    pub reservation_id: String,
    pub status: ReservationStatus,
    pub name: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub allocated: bool,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling: Option<PollingReport>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub simulated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    Simulated,
    Requested,
    Deleted,
    NotFoundOk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteData {
    pub reservation_id: String,
    pub action: String,
    pub status: DeleteStatus,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<PollingReport>,
}

pub const DELETE_ACTION: &str = "delete";

/// Written into the workdir by every successful provisioning run.
pub const PROVISION_DESCRIPTOR: &str = "provision.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStatus {
    Prepared,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionData {
    pub reservation_id: String,
    pub repo: String,
    pub branch: String,
    pub workdir: String,
    pub status: ProvisionStatus,
    pub artifacts: Vec<String>,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout: Option<PollingReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchData {
    pub reservation_id: String,
    pub servers: Vec<ServerRecord>,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<PollingReport>,
}

fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_default())
}

/// Hardware and software needs inferred from a repository. Unknown fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub ram_gb: Option<u32>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub gpu_required: bool,
    #[serde(default)]
    pub gpu_memory_gb: Option<u32>,
    #[serde(default)]
    pub disk_gb: Option<u32>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub cuda_required: bool,
    #[serde(default)]
    pub python_version: Option<String>,
    #[serde(default)]
    pub special_requirements: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Ai,
    Default,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub step: String,
    pub value: String,
    pub source: DecisionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgeData {
    pub repo: String,
    pub requirements: Requirements,
    pub decisions: Vec<Decision>,
    pub image: String,
    pub node_type: String,
    pub duration_hours: u32,
    pub lease: LeaseData,
    pub server: ServerRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floating_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_command: Option<String>,
    pub dry_run: bool,
}
