pub mod controller;
pub mod repo;
pub mod service;

use controller::WorkspaceController;
use envboot_core::Clock;
use repo::LocalWorkspaceRepository;
use service::WorkspaceService;
use std::sync::Arc;

pub fn local_service(clock: Arc<dyn Clock>) -> WorkspaceService {
    WorkspaceService::new(Arc::new(LocalWorkspaceRepository::new()), clock)
}

/// Local repository provisioning (copy or `git clone`).
pub fn local_controller(clock: Arc<dyn Clock>) -> WorkspaceController {
    WorkspaceController::new(local_service(clock))
}
