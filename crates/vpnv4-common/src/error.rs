//! Error types for the vpnv4 agent.
//!
//! Every failure the agent can hit maps onto one variant of [`AgentError`].
//! The variants follow the recovery taxonomy: source errors are skipped and
//! retried with backoff, allocation exhaustion is fatal, kernel errors degrade
//! a single VRF, daemon errors leave applied state untouched, and importer
//! errors skip one VRF for one tick.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur inside the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// An external operation did not finish within its bound.
    #[error("Operation timed out after {}s: {operation}", .timeout.as_secs())]
    Timeout {
        /// The command or request that hung.
        operation: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// A change source could not be read or returned malformed data.
    #[error("Change source '{source_name}' failed: {message}")]
    Source {
        /// Name of the failing source.
        source_name: String,
        /// Error message.
        message: String,
    },

    /// The numeric identifier space has no free value left.
    #[error("Identifier space exhausted allocating '{tenant}' ({capacity} usable values)")]
    AllocationExhausted {
        /// Tenant whose allocation failed.
        tenant: String,
        /// Number of usable identifiers in the configured range.
        capacity: usize,
    },

    /// A VRF or route operation failed in the kernel.
    #[error("Kernel operation failed for VRF '{vrf}': {message}")]
    Kernel {
        /// VRF device name.
        vrf: String,
        /// Error message.
        message: String,
    },

    /// Writing or reloading routing daemon configuration failed.
    #[error("Routing daemon update failed: {message}")]
    Daemon {
        /// Error message.
        message: String,
    },

    /// Reading learned routes or reporting them failed.
    #[error("Route import failed for VRF '{vrf}': {message}")]
    Importer {
        /// VRF device name.
        vrf: String,
        /// Error message.
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl AgentError {
    /// Creates a change source error.
    pub fn source(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Creates a kernel error.
    pub fn kernel(vrf: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kernel {
            vrf: vrf.into(),
            message: message.into(),
        }
    }

    /// Creates a daemon error.
    pub fn daemon(message: impl Into<String>) -> Self {
        Self::Daemon {
            message: message.into(),
        }
    }

    /// Creates an importer error.
    pub fn importer(vrf: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Importer {
            vrf: vrf.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Source { .. }
                | AgentError::Kernel { .. }
                | AgentError::Daemon { .. }
                | AgentError::Importer { .. }
                | AgentError::Timeout { .. }
                | AgentError::ShellCommandFailed { .. }
        )
    }

    /// Returns true if the agent must stop when it sees this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::AllocationExhausted { .. } | AgentError::InvalidConfig { .. }
        )
    }
}
