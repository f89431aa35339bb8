//! OpenStack-backed implementations of the envboot operations.
//!
//! Each feature follows the same layering: a `repo` trait over the remote
//! API, a `service` holding the operation logic, and a `controller` that
//! wraps outcomes in an [`envboot_core::OperationEnvelope`].

pub mod cloud;
pub mod features;
