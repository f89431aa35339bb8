pub mod controller;
pub mod repo;
pub mod service;

use crate::cloud::OpenStackSession;
use crate::features::reservation::repo::BlazarReservationRepository;
use controller::ComputeController;
use envboot_core::Clock;
use repo::{IronicRepository, NovaComputeRepository};
use service::ComputeService;
use std::sync::Arc;

pub fn nova_service(session: Arc<OpenStackSession>, clock: Arc<dyn Clock>) -> ComputeService {
    ComputeService::new(
        Arc::new(NovaComputeRepository::new(session.clone())),
        Arc::new(BlazarReservationRepository::new(session.clone())),
        clock,
    )
    .with_bare_metal(Arc::new(IronicRepository::new(session)))
}

/// Server launch on Nova, bound to a Blazar reservation.
pub fn nova_controller(session: Arc<OpenStackSession>, clock: Arc<dyn Clock>) -> ComputeController {
    ComputeController::new(nova_service(session, clock))
}
