use crate::cloud::{CloudError, CloudResult, OpenStackSession, ServiceType};
use chrono::{DateTime, Utc};
use envboot_core::timefmt::{format_blazar, normalize};
use envboot_core::{LeaseRecord, ReservationStatus, ResourceType};
use serde_json::{json, Value};
use std::sync::Arc;

/// What gets submitted to Blazar on lease creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSpec {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resource_type: ResourceType,
    pub node_count: u32,
    pub resource_properties: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
pub trait ReservationRepository: Send + Sync {
    fn create_lease(&self, spec: &LeaseSpec) -> CloudResult<LeaseRecord>;
    fn get_lease(&self, lease_id: &str) -> CloudResult<LeaseRecord>;
    fn delete_lease(&self, lease_id: &str) -> CloudResult<()>;
}

pub struct BlazarReservationRepository {
    session: Arc<OpenStackSession>,
}

impl BlazarReservationRepository {
    pub fn new(session: Arc<OpenStackSession>) -> Self {
        Self { session }
    }
}

impl ReservationRepository for BlazarReservationRepository {
    fn create_lease(&self, spec: &LeaseSpec) -> CloudResult<LeaseRecord> {
        let body = json!({
            "name": spec.name,
            "start_date": format_blazar(&spec.start),
            "end_date": format_blazar(&spec.end),
            "reservations": [{
                "resource_type": spec.resource_type.as_str(),
                "min": spec.node_count,
                "max": spec.node_count,
                "resource_properties": spec.resource_properties.clone().unwrap_or_default(),
                "hypervisor_properties": ""
            }],
            "events": []
        });
        let response = self.session.post(ServiceType::Reservation, "/leases", &body)?;
        lease_from_json(&response)
    }

    fn get_lease(&self, lease_id: &str) -> CloudResult<LeaseRecord> {
        let response = self
            .session
            .get(ServiceType::Reservation, &format!("/leases/{lease_id}"))?;
        lease_from_json(&response)
    }

    fn delete_lease(&self, lease_id: &str) -> CloudResult<()> {
        self.session
            .delete(ServiceType::Reservation, &format!("/leases/{lease_id}"))
    }
}

fn opt_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Accepts both `{"lease": {...}}` and a bare lease object.
pub(crate) fn lease_from_json(body: &Value) -> CloudResult<LeaseRecord> {
    let lease = body.get("lease").unwrap_or(body);
    let id = opt_str(lease, "id")
        .ok_or_else(|| CloudError::Decode("lease response has no 'id'".to_string()))?;

    let reservations = lease
        .get("reservations")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let first = reservations.first();

    Ok(LeaseRecord {
        id,
        name: opt_str(lease, "name"),
        status: opt_str(lease, "status")
            .map(|s| ReservationStatus::from_blazar(&s))
            .unwrap_or(ReservationStatus::Unknown),
        start_date: opt_str(lease, "start_date").map(|s| normalize(&s)),
        end_date: opt_str(lease, "end_date").map(|s| normalize(&s)),
        created_at: opt_str(lease, "created_at").map(|s| normalize(&s)),
        updated_at: opt_str(lease, "updated_at").map(|s| normalize(&s)),
        resource_type: first
            .and_then(|r| opt_str(r, "resource_type"))
            .and_then(|s| s.parse().ok()),
        allocated: first
            .and_then(|r| opt_str(r, "status"))
            .is_some_and(|s| s.eq_ignore_ascii_case("active")),
        reservation_ids: reservations.iter().filter_map(|r| opt_str(r, "id")).collect(),
        reserved_hosts: reservations
            .iter()
            .filter(|r| opt_str(r, "resource_type").as_deref() == Some(ResourceType::PhysicalHost.as_str()))
            .filter_map(|r| opt_str(r, "resource_id"))
            .collect(),
    })
}
