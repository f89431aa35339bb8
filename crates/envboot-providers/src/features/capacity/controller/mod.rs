use crate::features::capacity::service::CapacityService;
use envboot_core::payload::CapacityData;
use envboot_core::{CapacityQuery, EnvelopeBuilder, OperationEnvelope};
use tracing::{info, warn};

pub struct CapacityController {
    service: CapacityService,
}

impl CapacityController {
    pub fn new(service: CapacityService) -> Self {
        Self { service }
    }

    pub fn check(&self, query: CapacityQuery, dry_run: bool) -> OperationEnvelope<CapacityData> {
        let envelope = EnvelopeBuilder::start();
        let outcome = self.service.check_capacity(&query, dry_run);
        match &outcome {
            Ok(data) => info!(zone = %data.zone, available = data.available_nodes, dry_run, "capacity checked"),
            Err(failure) => warn!(zone = %query.zone, error = %failure, "capacity check failed"),
        }
        envelope.finish(outcome)
    }
}
