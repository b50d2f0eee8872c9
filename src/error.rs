//! User-visible error taxonomy for CPI operations.

use thiserror::Error;

use crate::cloud::CloudApiError;
use crate::config::ConfigError;
use crate::fleet::FleetError;
use crate::registry::RegistryError;

/// Errors raised by the CPI managers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CpiError {
    /// Raised when caller supplied parameters are malformed.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Raised when configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a disk the caller expected is already absent.
    #[error("disk {disk_id} not found")]
    DiskNotFound {
        /// Disk identifier.
        disk_id: String,
    },
    /// Raised when a disk is not attached to the instance it is detached from.
    #[error("disk {disk_id} is not attached to instance {instance_id}")]
    DiskNotAttached {
        /// Disk identifier.
        disk_id: String,
        /// Instance identifier.
        instance_id: String,
    },
    /// Raised when every candidate device name is already in use.
    #[error("instance {instance_id} has too many disks attached")]
    TooManyDisks {
        /// Instance identifier.
        instance_id: String,
    },
    /// Raised when a VM has no backing instance.
    #[error("vm {vm_id} not found")]
    VmNotFound {
        /// VM (pool) identifier.
        vm_id: String,
    },
    /// Raised when a polling budget is exhausted.
    #[error("timed out waiting for {resource} to be {desired}")]
    Timeout {
        /// Resource being waited on.
        resource: String,
        /// Desired state.
        desired: String,
    },
    /// Raised when the instance was terminated before configuration finished.
    #[error("instance {instance_id} was abruptly terminated")]
    AbruptlyTerminated {
        /// Instance identifier.
        instance_id: String,
    },
    /// Wrapper for fatal cloud or fleet API failures.
    #[error("{operation} failed for {context}: {message}")]
    Cloud {
        /// Operation being performed.
        operation: String,
        /// Resource the operation targeted.
        context: String,
        /// Underlying failure.
        message: String,
    },
    /// Raised when the external settings registry fails.
    #[error("registry error: {0}")]
    Registry(String),
}

impl CpiError {
    /// Wraps a remote failure with the operation and target that produced it.
    pub fn cloud(
        operation: impl Into<String>,
        context: impl Into<String>,
        source: &impl std::fmt::Display,
    ) -> Self {
        Self::Cloud {
            operation: operation.into(),
            context: context.into(),
            message: source.to_string(),
        }
    }

    /// Returns `true` for the not-found conditions orchestrators may treat as
    /// already done.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::DiskNotFound { .. } | Self::DiskNotAttached { .. })
    }
}

impl From<ConfigError> for CpiError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<RegistryError> for CpiError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value.to_string())
    }
}

/// Converts a fleet failure into a fatal cloud error with context. Transport
/// timeouts and request failures share the same user-visible shape.
pub(crate) fn fleet_failure(operation: &str, context: &str, err: &FleetError) -> CpiError {
    CpiError::cloud(operation, context, err)
}

/// Converts a cloud API failure into a fatal cloud error with context.
pub(crate) fn cloud_failure(operation: &str, context: &str, err: &CloudApiError) -> CpiError {
    CpiError::cloud(operation, context, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_conditions_are_recoverable() {
        let not_found = CpiError::DiskNotFound {
            disk_id: String::from("vol-1"),
        };
        let not_attached = CpiError::DiskNotAttached {
            disk_id: String::from("vol-1"),
            instance_id: String::from("i-1"),
        };
        assert!(not_found.is_recoverable());
        assert!(not_attached.is_recoverable());
        assert!(!CpiError::Validation(String::from("x")).is_recoverable());
    }

    #[test]
    fn cloud_error_carries_operation_and_context() {
        let err = CpiError::cloud(
            "delete elastigroup",
            "sig-1",
            &CloudApiError::Timeout {
                operation: String::from("DELETE /group/sig-1"),
            },
        );
        assert_eq!(
            err.to_string(),
            "delete elastigroup failed for sig-1: request timed out during DELETE /group/sig-1"
        );
    }
}
