//! Typed errors for the monitoring kernel.
//!
//! Per the error-handling design, nothing in this pipeline is fatal to the
//! host process: storage failures are reported and the current record or
//! cycle is skipped; handler failures are isolated inside dispatch; resource
//! exhaustion is a signaled condition, not an error.

use thiserror::Error;

/// Result alias used across the kernel and the monitoring crates.
pub type MonitorResult<T> = Result<T, MonitorError>;

/// Errors that can surface from pipeline operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MonitorError {
    /// A backing store rejected an insert/update/delete. Transient by
    /// assumption; the caller decides whether to retry.
    #[error("Storage failure: {0}")]
    Storage(String),

    /// A (de)serialization error. The write that triggered it is skipped,
    /// never persisted in a corrupt form.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// A handler reported failure during dispatch. Recorded and isolated;
    /// the fan-out continues past it.
    #[error("Handler '{handler}' failed: {reason}")]
    Handler { handler: String, reason: String },

    /// A configuration value was rejected.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A collaborator (store, probe) is unavailable. Operations degrade to
    /// no-ops rather than propagating this to the host.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Catch-all for errors that don't fit the above categories.
    #[error("{0}")]
    Other(String),
}

impl MonitorError {
    /// Convenience constructor for handler failures.
    pub fn handler(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        let e = MonitorError::Storage("insert rejected".into());
        assert_eq!(e.to_string(), "Storage failure: insert rejected");

        let e = MonitorError::handler("baseline", "value not numeric");
        assert_eq!(e.to_string(), "Handler 'baseline' failed: value not numeric");
    }

    #[test]
    fn serde_errors_convert_via_from() {
        let bad: Result<u32, _> = serde_json::from_str("not json");
        let e: MonitorError = bad.unwrap_err().into();
        assert!(matches!(e, MonitorError::Serialization { .. }));
    }
}
