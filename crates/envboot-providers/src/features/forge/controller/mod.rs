use crate::features::forge::service::{ForgeRequest, ForgeService};
use envboot_core::payload::ForgeData;
use envboot_core::{EnvelopeBuilder, OperationEnvelope};
use tracing::{info, warn};

pub struct ForgeController {
    service: ForgeService,
}

impl ForgeController {
    pub fn new(service: ForgeService) -> Self {
        Self { service }
    }

    pub fn run(&self, request: ForgeRequest, dry_run: bool) -> OperationEnvelope<ForgeData> {
        let envelope = EnvelopeBuilder::start();
        let outcome = self.service.forge(&request, dry_run);
        match &outcome {
            Ok(data) => info!(
                repo = %data.repo,
                lease = %data.lease.reservation_id,
                server = %data.server.server_id,
                dry_run,
                "forge complete"
            ),
            Err(failure) => warn!(
                repo = %request.repo,
                error_type = failure.kind().as_str(),
                error = %failure,
                "forge failed"
            ),
        }
        envelope.finish(outcome)
    }
}
