pub mod controller;
pub mod repo;
pub mod service;

use crate::cloud::OpenStackSession;
use controller::CapacityController;
use repo::BlazarCapacityRepository;
use service::CapacityService;
use std::sync::Arc;

/// Capacity check against Blazar host inventory and allocations.
pub fn blazar_controller(session: Arc<OpenStackSession>, default_zone: &str) -> CapacityController {
    let repo = Arc::new(BlazarCapacityRepository::new(session));
    CapacityController::new(CapacityService::new(repo, default_zone))
}
