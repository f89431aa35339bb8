use crate::cloud::{CloudError, CloudResult, OpenStackSession, ServiceType};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    /// Blazar's own host ID, referenced by allocations.
    pub id: String,
    /// Ironic node UUID (`hypervisor_hostname`), falling back to the Blazar ID.
    pub uuid: String,
    pub hostname: String,
    pub node_type: Option<String>,
    pub zone: Option<String>,
}

/// Reserved windows of one host, as raw backend timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAllocation {
    pub resource_id: String,
    pub windows: Vec<(String, String)>,
}

#[cfg_attr(test, mockall::automock)]
pub trait CapacityRepository: Send + Sync {
    fn list_hosts(&self) -> CloudResult<Vec<HostRecord>>;
    fn list_allocations(&self) -> CloudResult<Vec<HostAllocation>>;
}

pub struct BlazarCapacityRepository {
    session: Arc<OpenStackSession>,
}

impl BlazarCapacityRepository {
    pub fn new(session: Arc<OpenStackSession>) -> Self {
        Self { session }
    }
}

impl CapacityRepository for BlazarCapacityRepository {
    fn list_hosts(&self) -> CloudResult<Vec<HostRecord>> {
        let body = self.session.get(ServiceType::Reservation, "/os-hosts")?;
        let hosts = body
            .get("hosts")
            .and_then(Value::as_array)
            .ok_or_else(|| CloudError::Decode("os-hosts response has no 'hosts' list".to_string()))?;
        Ok(hosts.iter().filter_map(host_from_json).collect())
    }

    fn list_allocations(&self) -> CloudResult<Vec<HostAllocation>> {
        let body = self
            .session
            .get(ServiceType::Reservation, "/os-hosts/allocations")?;
        let allocations = body
            .get("allocations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(allocations.iter().filter_map(allocation_from_json).collect())
    }
}

fn text(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn host_from_json(value: &Value) -> Option<HostRecord> {
    let id = text(value, "id")?;
    let uuid = text(value, "hypervisor_hostname").unwrap_or_else(|| id.clone());
    let hostname = text(value, "node_name").unwrap_or_else(|| uuid.clone());
    Some(HostRecord {
        id,
        uuid,
        hostname,
        node_type: text(value, "node_type"),
        zone: text(value, "availability_zone").or_else(|| text(value, "site")),
    })
}

fn allocation_from_json(value: &Value) -> Option<HostAllocation> {
    let resource_id = text(value, "resource_id")?;
    let windows = value
        .get("reservations")
        .and_then(Value::as_array)
        .map(|reservations| {
            reservations
                .iter()
                .filter_map(|r| Some((text(r, "start_date")?, text(r, "end_date")?)))
                .collect()
        })
        .unwrap_or_default();
    Some(HostAllocation {
        resource_id,
        windows,
    })
}
