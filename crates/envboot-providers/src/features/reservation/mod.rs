pub mod controller;
pub mod repo;
pub mod service;

use crate::cloud::OpenStackSession;
use controller::ReservationController;
use envboot_core::Clock;
use repo::BlazarReservationRepository;
use service::ReservationService;
use std::sync::Arc;

/// Lease create/status/delete against Blazar.
pub fn blazar_controller(session: Arc<OpenStackSession>, clock: Arc<dyn Clock>) -> ReservationController {
    let repo = Arc::new(BlazarReservationRepository::new(session));
    ReservationController::new(ReservationService::new(repo, clock))
}
