pub mod advisor;
pub mod capacity;
pub mod compute;
pub mod forge;
pub mod reservation;
pub mod workspace;
