pub mod controller;
pub mod service;

use crate::cloud::OpenStackSession;
use crate::features::{advisor, capacity, compute, reservation, workspace};
use controller::ForgeController;
use envboot_core::Clock;
use service::ForgeService;
use std::sync::Arc;
use std::time::Duration;

/// The full analyze-reserve-launch flow over one OpenStack session.
pub fn openstack_controller(
    session: Arc<OpenStackSession>,
    clock: Arc<dyn Clock>,
    default_zone: &str,
    advisor_timeout: Duration,
) -> ForgeController {
    let capacity = capacity::service::CapacityService::new(
        Arc::new(capacity::repo::BlazarCapacityRepository::new(session.clone())),
        default_zone,
    );
    let reservations = reservation::service::ReservationService::new(
        Arc::new(reservation::repo::BlazarReservationRepository::new(session.clone())),
        clock.clone(),
    );
    ForgeController::new(ForgeService::new(
        workspace::local_service(clock.clone()),
        advisor::openai_service(advisor_timeout),
        capacity,
        reservations,
        compute::nova_service(session, clock),
    ))
}
