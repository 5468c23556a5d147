//! Broker error types
//!
//! All fallible broker operations return [`Result`]. Start-path errors roll
//! back partial acquisitions before surfacing; broadcast-path failures are
//! handled internally (subscriber eviction, pipeline termination) and never
//! reach callers.

use crate::source::ChannelKey;

/// Error type for broker operations
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Broker configuration rejected by validation
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// What was wrong with the configuration
        reason: String,
    },

    /// Configured transcoder binary does not exist
    #[error("transcoder binary missing: {path}")]
    TranscoderBinaryMissing {
        /// Path that was checked
        path: String,
    },

    /// Port range exhausted, no loopback port left to lease
    #[error("no loopback port available in {start}..{end}")]
    NoPortAvailable {
        /// Inclusive start of the scanned range
        start: u16,
        /// Exclusive end of the scanned range
        end: u16,
    },

    /// Failed to bind the channel's loopback listener
    #[error("failed to bind listener on port {port}: {source}")]
    ListenerBindFailed {
        /// Port the bind was attempted on
        port: u16,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Transcoder process could not be spawned
    #[error("failed to spawn transcoder: {reason}")]
    SpawnFailed {
        /// Human-readable spawn failure
        reason: String,
    },

    /// No channel registered under the given key
    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelKey),

    /// A subscriber sink rejected a payload
    #[error("subscriber send failed: {reason}")]
    SubscriberSendFailed {
        /// Underlying send failure
        reason: String,
    },

    /// The transcoder exited while the operation was in flight
    #[error("transcoder exited{}", .code.map(|c| format!(" with code {c}")).unwrap_or_default())]
    SupervisorExited {
        /// Exit code when the OS reported one
        code: Option<i32>,
    },

    /// Invariant violation or unexpected internal failure
    #[error("internal broker error: {reason}")]
    Internal {
        /// Diagnostic description
        reason: String,
    },
}

/// Convenience Result type using [`BrokerError`]
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = BrokerError::NoPortAvailable {
            start: 10000,
            end: 50000,
        };
        assert_eq!(
            err.to_string(),
            "no loopback port available in 10000..50000"
        );

        let err = BrokerError::SupervisorExited { code: Some(1) };
        assert_eq!(err.to_string(), "transcoder exited with code 1");

        let err = BrokerError::SupervisorExited { code: None };
        assert_eq!(err.to_string(), "transcoder exited");
    }
}
