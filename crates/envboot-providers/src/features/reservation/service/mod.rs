use crate::cloud::CloudError;
use crate::features::reservation::repo::{LeaseSpec, ReservationRepository};
use chrono::{DateTime, Utc};
use envboot_core::payload::{
    DeleteData, DeleteStatus, LeaseCreateStatus, LeaseData, LeaseStatusData, DELETE_ACTION,
};
use envboot_core::timefmt::ReservationWindow;
use envboot_core::{
    simulation, Clock, CoreError, DeleteRequest, LeaseRecord, OperationError, PollExit,
    PollSettings, PollingReport, ReservationRequest, ReservationStatus, StatusPoller, StatusQuery,
};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_NAME_PREFIX: &str = "envboot-api2";

pub fn default_lease_name(now: &DateTime<Utc>) -> String {
    format!("{DEFAULT_NAME_PREFIX}-{}", now.format("%Y%m%d-%H%M%S"))
}

pub struct ReservationService {
    repo: Arc<dyn ReservationRepository>,
    clock: Arc<dyn Clock>,
}

impl ReservationService {
    pub fn new(repo: Arc<dyn ReservationRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub fn create_reservation(
        &self,
        request: &ReservationRequest,
        wait: PollSettings,
        dry_run: bool,
    ) -> Result<LeaseData, OperationError> {
        if request.zone.trim().is_empty() {
            return Err(CoreError::Validation("zone is required".to_string()).into());
        }
        if request.node_count < 1 {
            return Err(
                CoreError::Validation("Number of nodes must be at least 1".to_string()).into(),
            );
        }
        let window = ReservationWindow::parse(&request.start, request.duration_minutes)?;
        let now = Utc::now();
        let name = request
            .name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| default_lease_name(&now));

        if dry_run {
            let wait = (!wait.is_peek()).then_some(wait);
            return Ok(simulation::create_lease(request, &window, name, now, wait));
        }

        if window.start <= now {
            return Err(CoreError::Validation(
                "Start date must be later than current UTC time".to_string(),
            )
            .into());
        }

        let spec = LeaseSpec {
            name: name.clone(),
            start: window.start,
            end: window.end,
            resource_type: request.resource_type,
            node_count: request.node_count,
            resource_properties: request.resource_properties.clone(),
        };
        let lease = self.repo.create_lease(&spec).map_err(|e| {
            OperationError::from(e).with_detail("lease_name", name.clone())
        })?;
        info!(reservation_id = %lease.id, name = %name, zone = %request.zone, "lease created");

        let (lease_status, polling) = if wait.is_peek() {
            (Some(lease.status), None)
        } else {
            let (observed, report) = self
                .await_lease(&lease.id, ReservationStatus::Active, wait)
                .map_err(|failure| failure.with_detail("reservation_id", lease.id.clone()))?;
            (Some(observed.status), Some(report))
        };

        Ok(LeaseData {
            reservation_id: lease.id,
            name,
            zone: request.zone.clone(),
            start: window.start_str(),
            end: window.end_str(),
            duration_minutes: window.duration_minutes,
            nodes_requested: request.node_count,
            resource_type: request.resource_type,
            status: LeaseCreateStatus::Created,
            lease_status,
            dry_run: false,
            polling,
        })
    }

    pub fn reservation_status(
        &self,
        query: &StatusQuery,
        dry_run: bool,
    ) -> Result<LeaseStatusData, OperationError> {
        query.handle.validate()?;
        let settings = PollSettings::from_secs(query.wait_seconds, query.interval_seconds)?;

        if dry_run {
            return Ok(simulation::lease_status(
                &query.handle,
                query.target,
                settings,
                Utc::now(),
            ));
        }

        let (lease, report) = self.await_lease(&query.handle.reservation_id, query.target, settings)?;
        Ok(LeaseStatusData {
            reservation_id: lease.id,
            status: lease.status,
            name: lease.name,
            start_date: lease.start_date,
            end_date: lease.end_date,
            created_at: lease.created_at,
            updated_at: lease.updated_at,
            allocated: lease.allocated,
            dry_run: false,
            zone: query.handle.zone.clone(),
            resource_type: lease.resource_type,
            polling: (!settings.is_peek()).then_some(report),
            simulated: false,
        })
    }

    pub fn delete_reservation(
        &self,
        request: &DeleteRequest,
        dry_run: bool,
    ) -> Result<DeleteData, OperationError> {
        request.handle.validate()?;
        let settings = PollSettings::from_secs(request.wait_seconds, request.interval_seconds)?;
        let lease_id = request.handle.reservation_id.as_str();

        if dry_run {
            return Ok(simulation::delete_lease(&request.handle, settings));
        }
        if !request.confirm {
            return Err(CoreError::Validation(
                "confirm is required to delete a reservation in real mode".to_string(),
            )
            .into());
        }

        let data = |status, wait| DeleteData {
            reservation_id: lease_id.to_string(),
            action: DELETE_ACTION.to_string(),
            status,
            dry_run: false,
            zone: request.handle.zone.clone(),
            wait,
        };

        match self.repo.delete_lease(lease_id) {
            Ok(()) => info!(reservation_id = %lease_id, "lease deletion requested"),
            Err(e) if e.is_not_found() && request.treat_not_found_as_ok => {
                info!(reservation_id = %lease_id, "lease already gone");
                return Ok(data(DeleteStatus::NotFoundOk, None));
            }
            Err(e) => return Err(OperationError::from(e).with_detail("reservation_id", lease_id)),
        }

        if settings.is_peek() {
            return Ok(data(DeleteStatus::Requested, None));
        }

        let poller = StatusPoller::new(self.clock.as_ref(), settings);
        let result = poller.poll(
            || match self.repo.get_lease(lease_id) {
                Ok(_) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            },
            |present| !present,
            |_| false,
        );
        let report = result.report(&settings);

        match result.exit {
            PollExit::Reached => {
                info!(reservation_id = %lease_id, poll_count = report.poll_count, "lease deleted");
                Ok(data(DeleteStatus::Deleted, Some(report)))
            }
            PollExit::FetchFailed => Err(fetch_failure(result.error, lease_id, &report)),
            _ => {
                warn!(reservation_id = %lease_id, "lease still present after wait");
                Err(OperationError::new(CoreError::Timeout(format!(
                    "lease {lease_id} still exists after {}s",
                    report.timeout_seconds
                )))
                .with_detail("reservation_id", lease_id)
                .with_detail("wait", report_value(&report)))
            }
        }
    }

    /// Reads a lease by ID without polling.
    pub fn get_lease(&self, lease_id: &str) -> Result<LeaseRecord, OperationError> {
        self.repo
            .get_lease(lease_id)
            .map_err(|e| OperationError::from(e).with_detail("reservation_id", lease_id))
    }

    /// Polls a lease until `target`. A peek returns whatever is observed; a
    /// real wait turns timeout and final non-target statuses into errors that
    /// carry the last observed status.
    pub fn await_lease(
        &self,
        lease_id: &str,
        target: ReservationStatus,
        settings: PollSettings,
    ) -> Result<(LeaseRecord, PollingReport), OperationError> {
        let poller = StatusPoller::new(self.clock.as_ref(), settings);
        let result = poller.poll(
            || self.repo.get_lease(lease_id),
            |lease| lease.status == target,
            |lease| lease.status.is_final() && lease.status != target,
        );
        let report = result.report(&settings);

        let observed = match (result.exit, result.final_status) {
            (PollExit::FetchFailed, _) | (_, None) => {
                return Err(fetch_failure(result.error, lease_id, &report));
            }
            (exit, Some(lease)) => (exit, lease),
        };

        match observed {
            (PollExit::Reached | PollExit::Peeked, lease) => Ok((lease, report)),
            (PollExit::Terminal, lease) if settings.is_peek() => Ok((lease, report)),
            (PollExit::Terminal, lease) => {
                warn!(reservation_id = %lease_id, status = %lease.status, "lease reached a final status");
                Err(OperationError::new(CoreError::Backend(format!(
                    "lease {lease_id} is {} and will not become {target}",
                    lease.status
                )))
                .with_detail("reservation_id", lease_id)
                .with_detail("last_status", lease.status.as_str())
                .with_detail("polling", report_value(&report)))
            }
            (_, lease) => {
                warn!(reservation_id = %lease_id, status = %lease.status, "timed out waiting for lease");
                Err(OperationError::new(CoreError::Timeout(format!(
                    "lease {lease_id} did not become {target} within {}s",
                    report.timeout_seconds
                )))
                .with_detail("reservation_id", lease_id)
                .with_detail("last_status", lease.status.as_str())
                .with_detail("polling", report_value(&report)))
            }
        }
    }
}

fn report_value(report: &PollingReport) -> serde_json::Value {
    serde_json::to_value(report).unwrap_or(serde_json::Value::Null)
}

fn fetch_failure(error: Option<CloudError>, lease_id: &str, report: &PollingReport) -> OperationError {
    let failure = match error {
        Some(error) => OperationError::from(error),
        None => OperationError::new(CoreError::Backend(format!(
            "no status observed for lease {lease_id}"
        ))),
    };
    failure
        .with_detail("reservation_id", lease_id)
        .with_detail("poll_count", report.poll_count)
}
