//! Error taxonomy for the document generation pipeline.
//!
//! Every stage fails fast with one of the variants below. The only retried
//! failure classes are [`RuntimeError::NotFound`] inside the kubeconfig poll
//! and transient discovery errors inside the resource gate; everything else
//! propagates immediately.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A fatal pipeline failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or empty input, an unreadable source, or an invalid flag combination.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A container runtime call failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// One of the poll budgets elapsed. The message names what was still
    /// outstanding when the deadline hit.
    #[error("timed out after {budget:?} waiting for {what}")]
    Timeout {
        /// What the poll was waiting on, including any unresolved items.
        what: String,
        /// The wall-clock ceiling that elapsed.
        budget: Duration,
    },

    /// The schema had no matching paths, or a desired resource never matched.
    #[error("schema matching failed: {0}")]
    Match(String),

    /// The caller's cancellation signal fired before the pipeline finished.
    #[error("operation cancelled")]
    Cancelled,

    /// A Kubernetes API call failed outside a designed retry loop.
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    /// The credential bundle could not be turned into a client config.
    #[error("kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// Local filesystem failure (reading inputs, writing the document).
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The OpenAPI document could not be decoded or re-encoded.
    #[error("document serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request construction failed (malformed URI path).
    #[error("request: {0}")]
    Http(#[from] http::Error),
}

/// A failure reported by the container runtime collaborator.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime reported that the requested object does not (yet) exist.
    ///
    /// Pollers treat this as "not ready yet" and retry; everywhere else it is
    /// as fatal as any other runtime failure.
    #[error("not found: {0}")]
    NotFound(String),

    /// The runtime binary could not be spawned at all.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        /// The command line that failed to launch.
        command: String,
        /// The underlying spawn error.
        source: std::io::Error,
    },

    /// The runtime call returned a non-zero exit status.
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        /// The command line that failed.
        command: String,
        /// Its exit status.
        status: std::process::ExitStatus,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// A single runtime call exceeded its own bounded timeout.
    #[error("`{command}` did not complete within {timeout:?}")]
    RequestTimeout {
        /// The command line that hung.
        command: String,
        /// The per-request ceiling.
        timeout: Duration,
    },

    /// The runtime produced output the driver could not interpret.
    #[error("unexpected output from `{command}`: {reason}")]
    BadOutput {
        /// The command line whose output was unusable.
        command: String,
        /// Why the output was rejected.
        reason: String,
    },
}

impl RuntimeError {
    /// Whether this failure means "the object is not there yet".
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}
