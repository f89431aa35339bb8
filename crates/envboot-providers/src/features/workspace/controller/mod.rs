use crate::features::workspace::service::WorkspaceService;
use envboot_core::payload::ProvisionData;
use envboot_core::{EnvelopeBuilder, OperationEnvelope, ProvisionRequest};
use tracing::{info, warn};

pub struct WorkspaceController {
    service: WorkspaceService,
}

impl WorkspaceController {
    pub fn new(service: WorkspaceService) -> Self {
        Self { service }
    }

    pub fn provision(&self, request: ProvisionRequest, dry_run: bool) -> OperationEnvelope<ProvisionData> {
        let envelope = EnvelopeBuilder::start();
        let outcome = self.service.provision(&request, dry_run);
        match &outcome {
            Ok(data) => info!(workdir = %data.workdir, dry_run, "workspace prepared"),
            Err(failure) => warn!(repo = %request.repo, error = %failure, "provisioning failed"),
        }
        envelope.finish(outcome)
    }
}
