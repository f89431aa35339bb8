use crate::{CoreError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

pub const ENVELOPE_VERSION: &str = "1.0.0";

/// A failed operation: a classified error plus the context gathered before it
/// failed (partially created servers, last observed status, HTTP status).
#[derive(Debug, Clone, PartialEq)]
pub struct OperationError {
    pub error: CoreError,
    pub details: Map<String, Value>,
}

impl OperationError {
    pub fn new(error: CoreError) -> Self {
        Self {
            error,
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl From<CoreError> for OperationError {
    fn from(error: CoreError) -> Self {
        Self::new(error)
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for OperationError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl From<OperationError> for ErrorBody {
    fn from(failure: OperationError) -> Self {
        Self {
            kind: failure.error.kind(),
            message: failure.error.message().to_string(),
            details: (!failure.details.is_empty()).then_some(failure.details),
        }
    }
}

impl From<CoreError> for ErrorBody {
    fn from(error: CoreError) -> Self {
        OperationError::from(error).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub elapsed_ms: u64,
}

/// Uniform response of every operation. Exactly one of `data`/`error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEnvelope<D> {
    pub ok: bool,
    pub data: Option<D>,
    pub error: Option<ErrorBody>,
    pub metrics: Metrics,
    pub version: String,
}

impl<D> OperationEnvelope<D> {
    pub fn success(data: D, elapsed: Duration) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            metrics: Metrics {
                elapsed_ms: elapsed_ms(elapsed),
            },
            version: ENVELOPE_VERSION.to_string(),
        }
    }

    pub fn failure(error: impl Into<ErrorBody>, elapsed: Duration) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
            metrics: Metrics {
                elapsed_ms: elapsed_ms(elapsed),
            },
            version: ENVELOPE_VERSION.to_string(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match &self.error {
            None => 0,
            Some(body) => body.kind.exit_code(),
        }
    }
}

impl<D: Serialize> OperationEnvelope<D> {
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Starts timing at invocation and wraps the outcome once the operation is done.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeBuilder {
    started: Instant,
}

impl EnvelopeBuilder {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn finish<D, E>(self, outcome: std::result::Result<D, E>) -> OperationEnvelope<D>
    where
        E: Into<ErrorBody>,
    {
        let elapsed = self.started.elapsed();
        match outcome {
            Ok(data) => OperationEnvelope::success(data, elapsed),
            Err(error) => OperationEnvelope::failure(error, elapsed),
        }
    }
}
