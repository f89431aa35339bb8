use crate::features::compute::service::ComputeService;
use envboot_core::payload::LaunchData;
use envboot_core::{EnvelopeBuilder, OperationEnvelope, ServerLaunchRequest};
use tracing::{info, warn};

pub struct ComputeController {
    service: ComputeService,
}

impl ComputeController {
    pub fn new(service: ComputeService) -> Self {
        Self { service }
    }

    pub fn launch(&self, request: ServerLaunchRequest, dry_run: bool) -> OperationEnvelope<LaunchData> {
        let envelope = EnvelopeBuilder::start();
        let outcome = self.service.launch_servers(&request, dry_run);
        match &outcome {
            Ok(data) => info!(
                reservation_id = %data.reservation_id,
                servers = data.servers.len(),
                dry_run,
                "servers launched"
            ),
            Err(failure) => warn!(
                reservation_id = %request.reservation_id,
                error_type = failure.kind().as_str(),
                error = %failure,
                "server launch failed"
            ),
        }
        envelope.finish(outcome)
    }
}
