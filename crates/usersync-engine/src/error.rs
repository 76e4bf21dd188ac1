//! Sync error types.

use thiserror::Error;

/// Errors that stop a run before or instead of producing a plan.
///
/// Per-user hook failures are not represented here: they are recovered
/// inside the hook runtime. Safety-limit outcomes are not errors either; they
/// surface as the plan's status.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid configuration detected before any user is processed.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A dashboard group is qualified with an organization that is not configured.
    #[error("Unknown accessor organization '{organization}' in dashboard group '{group}'")]
    UnknownOrganization { organization: String, group: String },

    /// An identity type name could not be parsed.
    #[error("Unknown identity type: {value}")]
    UnknownIdentityType { value: String },

    /// A mapping rule is structurally invalid.
    #[error("Malformed mapping rule for directory group '{directory_group}': {message}")]
    MalformedRule {
        directory_group: String,
        message: String,
    },

    /// A hook declaration failed validation or compilation.
    #[error("Invalid hook: {message}")]
    InvalidHook { message: String },

    /// A snapshot was not fully loaded; reconciling against it could delete users.
    #[error("Incomplete {side} snapshot: refusing to reconcile against partial data")]
    IncompleteSnapshot { side: &'static str },

    /// A collaborator (directory or dashboard connector) failed.
    #[error("Connector error: {message}")]
    Connector { message: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a malformed-rule error.
    pub fn malformed_rule(directory_group: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedRule {
            directory_group: directory_group.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-hook error.
    pub fn invalid_hook(message: impl Into<String>) -> Self {
        Self::InvalidHook {
            message: message.into(),
        }
    }

    /// Create a connector error.
    pub fn connector(message: impl Into<String>) -> Self {
        Self::Connector {
            message: message.into(),
        }
    }

    /// Whether the error is a configuration-class failure raised before the run starts.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::UnknownOrganization { .. }
                | Self::UnknownIdentityType { .. }
                | Self::MalformedRule { .. }
                | Self::InvalidHook { .. }
                | Self::IncompleteSnapshot { .. }
                | Self::Yaml(_)
        )
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
