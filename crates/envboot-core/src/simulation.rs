//! Dry-run results. Nothing here touches a backend; waits run the real
//! [`StatusPoller`] on a [`VirtualClock`] so reports look like live ones
//! without sleeping.

use crate::payload::{
    CapacityData, CapacityNode, DeleteData, DeleteStatus, LaunchData, LeaseCreateStatus, LeaseData,
    LeaseStatusData, ProvisionData, ProvisionStatus, DELETE_ACTION, PROVISION_DESCRIPTOR,
};
use crate::poller::{Clock, PollResult, PollSettings, StatusPoller, VirtualClock};
use crate::timefmt::{format_utc, ReservationWindow};
use crate::{
    ProvisionRequest, ReservationHandle, ReservationRequest, ReservationStatus,
    ResourceType, ServerLaunchRequest, ServerRecord, ServerStatus,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::convert::Infallible;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

pub const LEASE_ID_PREFIX: &str = "sim-lease-";
const LEASE_ID_FORMAT: &str = "%Y%m%d%H%M%S";
const SIMULATED_NODES: usize = 5;
/// A simulated lease is PENDING for this long after creation.
const ACTIVATION_DELAY_SECS: i64 = 10;
/// ...then ACTIVE for an hour, then COMPLETE.
const ACTIVE_SPAN_SECS: i64 = 3600;

pub fn lease_id(now: &DateTime<Utc>) -> String {
    format!("{LEASE_ID_PREFIX}{}", now.format(LEASE_ID_FORMAT))
}

fn chrono_offset(offset: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(offset.as_millis()).unwrap_or(i64::MAX))
}

/// Runs the poller against a status that is a pure function of virtual time.
fn run_virtual<S, O, T, X>(
    settings: PollSettings,
    observe: O,
    is_target: T,
    is_terminal: X,
) -> PollResult<S, Infallible>
where
    S: Debug,
    O: Fn(Duration) -> S,
    T: Fn(&S) -> bool,
    X: Fn(&S) -> bool,
{
    let clock = VirtualClock::new();
    let poller = StatusPoller::new(&clock, settings);
    poller.poll(|| Ok(observe(clock.now())), is_target, is_terminal)
}

/// A lease whose status depends only on its age. IDs minted by [`lease_id`]
/// carry their creation time; any other ID is treated as created "now".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedLease {
    pub id: String,
    pub created: DateTime<Utc>,
}

impl SimulatedLease {
    pub fn from_id(id: &str, now: DateTime<Utc>) -> Self {
        let created = id
            .strip_prefix(LEASE_ID_PREFIX)
            .and_then(|stamp| NaiveDateTime::parse_from_str(stamp, LEASE_ID_FORMAT).ok())
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(now);
        Self {
            id: id.to_string(),
            created,
        }
    }

    pub fn status_at(&self, at: DateTime<Utc>) -> ReservationStatus {
        let age = (at - self.created).num_seconds();
        if age < ACTIVATION_DELAY_SECS {
            ReservationStatus::Pending
        } else if age < ACTIVE_SPAN_SECS {
            ReservationStatus::Active
        } else {
            ReservationStatus::Complete
        }
    }
}

pub fn capacity(zone: &str, window: &ReservationWindow) -> CapacityData {
    let nodes: Vec<CapacityNode> = (1..=SIMULATED_NODES)
        .map(|n| CapacityNode {
            uuid: format!("sim-uuid-{n}"),
            hostname: format!("sim-node-{n}"),
            node_type: None,
            zone: zone.to_string(),
        })
        .collect();

    CapacityData {
        zone: zone.to_string(),
        start: window.start_str(),
        end: window.end_str(),
        duration_minutes: window.duration_minutes,
        available_nodes: nodes.len(),
        nodes,
        dry_run: true,
        status: Some("simulated".to_string()),
    }
}

pub fn create_lease(
    request: &ReservationRequest,
    window: &ReservationWindow,
    name: String,
    now: DateTime<Utc>,
    wait: Option<PollSettings>,
) -> LeaseData {
    let reservation_id = lease_id(&now);
    let (lease_status, polling) = match wait {
        Some(settings) => {
            let lease = SimulatedLease::from_id(&reservation_id, now);
            let result = run_virtual(
                settings,
                |offset| lease.status_at(now + chrono_offset(offset)),
                |status| *status == ReservationStatus::Active,
                ReservationStatus::is_final,
            );
            (result.final_status, Some(result.report(&settings)))
        }
        None => (None, None),
    };

    LeaseData {
        reservation_id,
        name,
        zone: request.zone.clone(),
        start: window.start_str(),
        end: window.end_str(),
        duration_minutes: window.duration_minutes,
        nodes_requested: request.node_count,
        resource_type: request.resource_type,
        status: LeaseCreateStatus::Simulated,
        lease_status,
        dry_run: true,
        polling,
    }
}

pub fn lease_status(
    handle: &ReservationHandle,
    target: ReservationStatus,
    settings: PollSettings,
    now: DateTime<Utc>,
) -> LeaseStatusData {
    let lease = SimulatedLease::from_id(&handle.reservation_id, now);
    let result = run_virtual(
        settings,
        |offset| lease.status_at(now + chrono_offset(offset)),
        |status| *status == target,
        |status| status.is_final() && *status != target,
    );
    let status = result.final_status.unwrap_or(ReservationStatus::Unknown);
    let observed_at = now + chrono_offset(result.elapsed);

    LeaseStatusData {
        reservation_id: handle.reservation_id.clone(),
        status,
        name: Some(format!("simulated-{}", handle.reservation_id)),
        start_date: Some(format_utc(
            &(lease.created + chrono::Duration::seconds(ACTIVATION_DELAY_SECS)),
        )),
        end_date: Some(format_utc(
            &(lease.created + chrono::Duration::seconds(ACTIVE_SPAN_SECS)),
        )),
        created_at: Some(format_utc(&lease.created)),
        updated_at: Some(format_utc(&observed_at)),
        allocated: status != ReservationStatus::Pending,
        dry_run: true,
        zone: handle.zone.clone(),
        resource_type: Some(ResourceType::PhysicalHost),
        polling: (!settings.is_peek()).then(|| result.report(&settings)),
        simulated: true,
    }
}

pub fn delete_lease(handle: &ReservationHandle, settings: PollSettings) -> DeleteData {
    let wait = (!settings.is_peek()).then(|| {
        // Present on the first read, gone on every later one.
        let result = run_virtual(settings, |offset| offset.is_zero(), |present| !present, |_| false);
        result.report(&settings)
    });

    DeleteData {
        reservation_id: handle.reservation_id.clone(),
        action: DELETE_ACTION.to_string(),
        status: DeleteStatus::Simulated,
        dry_run: true,
        zone: handle.zone.clone(),
        wait,
    }
}

pub fn provision(request: &ProvisionRequest) -> ProvisionData {
    let descriptor = Path::new(&request.workdir).join(PROVISION_DESCRIPTOR);
    ProvisionData {
        reservation_id: request.reservation_id.clone(),
        repo: request.repo.clone(),
        branch: request.branch.clone(),
        workdir: request.workdir.clone(),
        status: ProvisionStatus::Simulated,
        artifacts: vec![descriptor.display().to_string()],
        dry_run: true,
        checkout: None,
    }
}

pub fn launch_servers(request: &ServerLaunchRequest, settings: PollSettings) -> LaunchData {
    let servers = (0..request.count)
        .map(|i| ServerRecord {
            server_id: format!("sim-server-{}", i + 1),
            name: request.server_name(i),
            status: ServerStatus::Simulated,
            fixed_ip: Some(format!("10.0.0.{}", 100 + i)),
            floating_ip: request
                .assign_floating_ip
                .then(|| format!("203.0.113.{}", 10 + i)),
            ssh_user: request.ssh_user(&request.image),
            key_name: request.key_name.clone(),
        })
        .collect();

    let wait = (!settings.is_peek()).then(|| {
        let result = run_virtual(
            settings,
            |offset| {
                if offset.is_zero() {
                    ServerStatus::Build
                } else {
                    ServerStatus::Active
                }
            },
            |status| *status == ServerStatus::Active,
            |status| *status == ServerStatus::Error,
        );
        result.report(&settings)
    });

    LaunchData {
        reservation_id: request.reservation_id.clone(),
        servers,
        dry_run: true,
        wait,
    }
}
