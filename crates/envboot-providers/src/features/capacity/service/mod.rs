use crate::features::capacity::repo::{CapacityRepository, HostRecord};
use chrono::{DateTime, Utc};
use envboot_core::payload::{CapacityData, CapacityNode};
use envboot_core::timefmt::{parse_utc, ReservationWindow};
use envboot_core::{simulation, CapacityQuery, CoreError, OperationError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

pub struct CapacityService {
    repo: Arc<dyn CapacityRepository>,
    default_zone: String,
}

impl CapacityService {
    pub fn new(repo: Arc<dyn CapacityRepository>, default_zone: impl Into<String>) -> Self {
        Self {
            repo,
            default_zone: default_zone.into(),
        }
    }

    pub fn check_capacity(
        &self,
        query: &CapacityQuery,
        dry_run: bool,
    ) -> Result<CapacityData, OperationError> {
        if query.zone.trim().is_empty() {
            return Err(CoreError::Validation("zone is required".to_string()).into());
        }
        let window = ReservationWindow::parse(&query.start, query.duration_minutes)?;

        if dry_run {
            return Ok(simulation::capacity(&query.zone, &window));
        }

        let hosts = self.repo.list_hosts()?;
        let known_zones: BTreeSet<String> = hosts.iter().map(|h| self.zone_of(h)).collect();
        if !known_zones.contains(&query.zone) {
            let known: Vec<&str> = known_zones.iter().map(String::as_str).collect();
            return Err(CoreError::Validation(format!(
                "unknown zone '{}' (known zones: {})",
                query.zone,
                if known.is_empty() { "none".to_string() } else { known.join(", ") }
            ))
            .into());
        }

        let busy = self.busy_windows()?;
        let nodes: Vec<CapacityNode> = hosts
            .iter()
            .filter(|host| self.zone_of(host) == query.zone)
            .filter(|host| {
                busy.get(&host.id)
                    .map_or(true, |windows| !windows.iter().any(|(s, e)| window.overlaps(s, e)))
            })
            .map(|host| CapacityNode {
                uuid: host.uuid.clone(),
                hostname: host.hostname.clone(),
                node_type: host.node_type.clone(),
                zone: self.zone_of(host),
            })
            .collect();

        Ok(CapacityData {
            zone: query.zone.clone(),
            start: window.start_str(),
            end: window.end_str(),
            duration_minutes: window.duration_minutes,
            available_nodes: nodes.len(),
            nodes,
            dry_run: false,
            status: None,
        })
    }

    /// Distinct node types offered by the reservation service.
    pub fn node_types(&self) -> Result<BTreeSet<String>, OperationError> {
        Ok(self
            .repo
            .list_hosts()?
            .into_iter()
            .filter_map(|host| host.node_type)
            .collect())
    }

    fn zone_of(&self, host: &HostRecord) -> String {
        host.zone.clone().unwrap_or_else(|| self.default_zone.clone())
    }

    fn busy_windows(&self) -> Result<HashMap<String, Vec<(DateTime<Utc>, DateTime<Utc>)>>, OperationError> {
        let mut busy: HashMap<String, Vec<(DateTime<Utc>, DateTime<Utc>)>> = HashMap::new();
        for allocation in self.repo.list_allocations()? {
            for (start, end) in &allocation.windows {
                match (parse_utc(start), parse_utc(end)) {
                    (Ok(start), Ok(end)) => busy
                        .entry(allocation.resource_id.clone())
                        .or_default()
                        .push((start, end)),
                    _ => debug!(resource_id = %allocation.resource_id, "skipping allocation with unparseable dates"),
                }
            }
        }
        Ok(busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudError;
    use crate::features::capacity::repo::{HostAllocation, MockCapacityRepository};
    use envboot_core::ErrorKind;

    struct StubRepo {
        hosts: Vec<HostRecord>,
        allocations: Vec<HostAllocation>,
    }

    impl CapacityRepository for StubRepo {
        fn list_hosts(&self) -> Result<Vec<HostRecord>, CloudError> {
            Ok(self.hosts.clone())
        }

        fn list_allocations(&self) -> Result<Vec<HostAllocation>, CloudError> {
            Ok(self.allocations.clone())
        }
    }

    fn host(id: &str, zone: Option<&str>, node_type: &str) -> HostRecord {
        HostRecord {
            id: id.to_string(),
            uuid: format!("uuid-{id}"),
            hostname: format!("node-{id}"),
            node_type: Some(node_type.to_string()),
            zone: zone.map(ToString::to_string),
        }
    }

    fn query(zone: &str) -> CapacityQuery {
        CapacityQuery {
            zone: zone.to_string(),
            start: "2026-01-01T00:00:00Z".to_string(),
            duration_minutes: 60,
        }
    }

    fn service() -> CapacityService {
        CapacityService::new(
            Arc::new(StubRepo {
                hosts: vec![
                    host("1", Some("uc"), "gpu_rtx_6000"),
                    host("2", None, "compute_cascadelake_r640"),
                    host("3", Some("tacc"), "compute_skylake"),
                ],
                allocations: vec![HostAllocation {
                    resource_id: "1".to_string(),
                    windows: vec![(
                        "2025-12-31T23:30:00.000000".to_string(),
                        "2026-01-01T00:30:00.000000".to_string(),
                    )],
                }],
            }),
            "uc",
        )
    }

    #[test]
    fn test_overlapping_hosts_are_not_free() {
        let data = service().check_capacity(&query("uc"), false).unwrap();

        assert_eq!(data.available_nodes, 1);
        assert_eq!(data.nodes[0].uuid, "uuid-2");
        assert_eq!(data.nodes[0].zone, "uc");
        assert_eq!(data.end, "2026-01-01T01:00:00Z");
        assert!(!data.dry_run);
    }

    #[test]
    fn test_unknown_zone_lists_known_zones() {
        let err = service().check_capacity(&query("mars"), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.error.message().contains("tacc, uc"));
    }

    #[test]
    fn test_invalid_duration_is_rejected_before_backend() {
        let mut repo = MockCapacityRepository::new();
        repo.expect_list_hosts().never();
        let service = CapacityService::new(Arc::new(repo), "uc");
        let mut bad = query("uc");
        bad.duration_minutes = 0;

        let err = service.check_capacity(&bad, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_dry_run_never_calls_backend() {
        let mut repo = MockCapacityRepository::new();
        repo.expect_list_hosts().never();
        repo.expect_list_allocations().never();
        let service = CapacityService::new(Arc::new(repo), "uc");

        let data = service.check_capacity(&query("uc"), true).unwrap();
        assert_eq!(data.available_nodes, 5);
        assert!(data.dry_run);
    }

    #[test]
    fn test_backend_failure_is_backend_error() {
        let mut repo = MockCapacityRepository::new();
        repo.expect_list_hosts().returning(|| {
            Err(CloudError::Http {
                status: 503,
                message: "unavailable".to_string(),
            })
        });
        let service = CapacityService::new(Arc::new(repo), "uc");

        let err = service.check_capacity(&query("uc"), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(err.details["reason"], serde_json::json!("server_error"));
    }

    #[test]
    fn test_node_types_are_distinct() {
        let types = service().node_types().unwrap();
        assert_eq!(types.len(), 3);
        assert!(types.contains("gpu_rtx_6000"));
    }
}
