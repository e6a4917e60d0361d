//! Error types for the Scaleway backend.

use crate::backend::BackendError;
use crate::config::ConfigError;
use scaleway_rs::ScalewayError;
use thiserror::Error;

/// Errors raised by the Scaleway backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayBackendError {
    /// Raised when the high-level configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request is missing a required field.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Raised when the requested image label cannot be resolved.
    #[error("image '{label}' (arch {arch}) not found in zone {zone}")]
    ImageNotFound {
        /// Image label passed by the caller.
        label: String,
        /// Architecture requested by the caller.
        arch: String,
        /// Zone used for the lookup.
        zone: String,
    },
    /// Raised when the server type is not available in the selected zone.
    #[error("instance type '{instance_type}' not available in zone {zone}")]
    InstanceTypeUnavailable {
        /// Requested commercial type.
        instance_type: String,
        /// Target zone.
        zone: String,
    },
    /// Raised when an instance wait exceeds its attempt budget.
    #[error("timeout waiting for {action} on instance {instance_id}")]
    Timeout {
        /// Action being waited on.
        action: String,
        /// Provider instance identifier.
        instance_id: String,
    },
    /// Raised when the instance never exposes a public IP.
    #[error("instance {instance_id} missing public IPv4 address")]
    MissingPublicIp {
        /// Provider instance identifier.
        instance_id: String,
    },
    /// Raised when teardown leaves a server visible in the API.
    #[error("instance {instance_id} still present after teardown")]
    ResidualResource {
        /// Provider instance identifier.
        instance_id: String,
    },
    /// Raised when the instance's state does not allow an action.
    #[error("instance {instance_id} in state {state} does not allow {action}")]
    ActionNotAllowed {
        /// Action requested (`poweron`, `reboot`, `backup`).
        action: &'static str,
        /// Provider instance identifier.
        instance_id: String,
        /// Current state reported by the provider.
        state: String,
    },
    /// Raised when an HTTP call to the API returns a non-success status.
    #[error("{operation} {resource} rejected with HTTP {status}: {message}")]
    Api {
        /// Operation attempted (for example `attach volume`).
        operation: &'static str,
        /// Resource concerned.
        resource: String,
        /// HTTP status code.
        status: u16,
        /// Response body returned by the provider.
        message: String,
    },
    /// Raised when a resource lookup returns 404.
    #[error("{kind} {id} not found in zone {zone}")]
    NotFound {
        /// Resource kind (`volume`, `snapshot`, ...).
        kind: &'static str,
        /// Resource identifier.
        id: String,
        /// Zone where the lookup was attempted.
        zone: String,
    },
    /// Wrapper for transport and SDK level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider SDK or HTTP client.
        message: String,
    },
}

impl From<ScalewayError> for ScalewayBackendError {
    fn from(value: ScalewayError) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<reqwest::Error> for ScalewayBackendError {
    fn from(value: reqwest::Error) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for ScalewayBackendError {
    fn from(value: serde_json::Error) -> Self {
        Self::Provider {
            message: format!("unexpected response body: {value}"),
        }
    }
}

impl From<BackendError> for ScalewayBackendError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}

impl From<ConfigError> for ScalewayBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
