use crate::features::reservation::service::ReservationService;
use envboot_core::payload::{DeleteData, LeaseData, LeaseStatusData};
use envboot_core::{
    DeleteRequest, EnvelopeBuilder, OperationEnvelope, OperationError, PollSettings,
    ReservationRequest, StatusQuery,
};
use tracing::warn;

pub struct ReservationController {
    service: ReservationService,
}

impl ReservationController {
    pub fn new(service: ReservationService) -> Self {
        Self { service }
    }

    pub fn create(
        &self,
        request: ReservationRequest,
        wait_seconds: u64,
        interval_seconds: u64,
        dry_run: bool,
    ) -> OperationEnvelope<LeaseData> {
        let envelope = EnvelopeBuilder::start();
        let outcome = PollSettings::from_secs(wait_seconds, interval_seconds)
            .map_err(OperationError::from)
            .and_then(|wait| self.service.create_reservation(&request, wait, dry_run));
        log_failure("lease-create", &outcome);
        envelope.finish(outcome)
    }

    pub fn status(&self, query: StatusQuery, dry_run: bool) -> OperationEnvelope<LeaseStatusData> {
        let envelope = EnvelopeBuilder::start();
        let outcome = self.service.reservation_status(&query, dry_run);
        log_failure("lease-status", &outcome);
        envelope.finish(outcome)
    }

    pub fn delete(&self, request: DeleteRequest, dry_run: bool) -> OperationEnvelope<DeleteData> {
        let envelope = EnvelopeBuilder::start();
        let outcome = self.service.delete_reservation(&request, dry_run);
        log_failure("lease-delete", &outcome);
        envelope.finish(outcome)
    }
}

fn log_failure<T>(operation: &str, outcome: &Result<T, OperationError>) {
    if let Err(failure) = outcome {
        warn!(operation, error_type = failure.kind().as_str(), error = %failure, "operation failed");
    }
}
