//! OpenStack plumbing shared by the Blazar, Nova, Neutron and Glance repositories.

pub mod config;
pub mod session;

pub use config::{CloudConfig, ProjectScope};
pub use session::{OpenStackSession, ServiceType};

use envboot_core::{CoreError, OperationError};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    #[error("{0}")]
    Config(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// Keystone refused or failed the token request. Never a resource miss,
    /// whatever the status code.
    #[error("keystone authentication failed (HTTP {status}): {message}")]
    Auth { status: u16, message: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("no '{0}' endpoint in the service catalog")]
    MissingEndpoint(String),
}

pub type CloudResult<T> = std::result::Result<T, CloudError>;

impl CloudError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            CloudError::Http { status, .. } | CloudError::Auth { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::Http { status: 404, .. })
    }

    /// Short machine-readable cause for `error.details.reason`.
    pub fn reason(&self) -> Option<&'static str> {
        if let CloudError::Auth { status, .. } = self {
            return Some(if *status == 401 { "unauthorized" } else { "auth_failed" });
        }
        let reason = match self.http_status()? {
            400 => "bad_request",
            401 => "unauthorized",
            403 => "forbidden",
            404 => "not_found",
            409 => "conflict",
            500..=599 => "server_error",
            _ => return None,
        };
        Some(reason)
    }
}

impl From<CloudError> for CoreError {
    fn from(error: CloudError) -> Self {
        match error {
            CloudError::Config(message) => CoreError::Validation(message),
            CloudError::Http { status: 404, message } => CoreError::NotFound(message),
            other => CoreError::Backend(other.to_string()),
        }
    }
}

impl From<CloudError> for OperationError {
    fn from(error: CloudError) -> Self {
        let status = error.http_status();
        let reason = error.reason();
        let mut failure = OperationError::new(error.into());
        if let Some(status) = status {
            failure = failure.with_detail("http_status", status);
        }
        if let Some(reason) = reason {
            failure = failure.with_detail("reason", reason);
        }
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envboot_core::ErrorKind;

    #[test]
    fn test_config_error_becomes_validation() {
        let err: CoreError = CloudError::Config("Missing OS_AUTH_URL".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_not_found_keeps_message() {
        let err: CoreError = CloudError::Http {
            status: 404,
            message: "Lease abc could not be found".to_string(),
        }
        .into();
        assert_eq!(err, CoreError::NotFound("Lease abc could not be found".to_string()));
    }

    #[test]
    fn test_http_error_details() {
        let failure: OperationError = CloudError::Http {
            status: 409,
            message: "lease overlaps".to_string(),
        }
        .into();

        assert_eq!(failure.kind(), ErrorKind::Backend);
        assert_eq!(failure.details["http_status"], serde_json::json!(409));
        assert_eq!(failure.details["reason"], serde_json::json!("conflict"));
    }

    #[test]
    fn test_auth_failure_is_never_not_found() {
        let error = CloudError::Auth {
            status: 404,
            message: "The resource could not be found.".to_string(),
        };
        assert!(!error.is_not_found());

        let failure: OperationError = error.into();
        assert_eq!(failure.kind(), ErrorKind::Backend);
        assert_eq!(failure.details["http_status"], serde_json::json!(404));
        assert_eq!(failure.details["reason"], serde_json::json!("auth_failed"));
    }

    #[test]
    fn test_transport_error_has_no_status() {
        let failure: OperationError = CloudError::Transport("connection refused".to_string()).into();
        assert_eq!(failure.kind(), ErrorKind::Backend);
        assert!(failure.details.is_empty());
    }
}
