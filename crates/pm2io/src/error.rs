//! Error types for the collector connection
//!
//! Every failure the connection manager can observe is classified here.
//! None of them are fatal to the host: the manager handles them on its
//! retry/reconnect path and only reports them through logs and metrics.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for the agent
#[derive(Error, Debug, Clone)]
pub enum Pm2IoError {
    #[error("Connection error: {source}")]
    Connection {
        #[from]
        source: ConnectionError,
    },

    #[error("Protocol error: {source}")]
    Protocol {
        #[from]
        source: ProtocolError,
    },

    #[error("Action error: {source}")]
    Action {
        #[from]
        source: ActionError,
    },

    #[error("Configuration error: {source}")]
    Configuration {
        #[from]
        source: ConfigurationError,
    },
}

/// Failures of the stream lifecycle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Endpoint discovery failed (transport, status or body)
    #[error("Discovery against {server} failed: {reason}")]
    DiscoveryFailed { server: String, reason: String },

    /// The upgrade request was rejected or could not be sent
    #[error("Handshake with {endpoint} failed: {reason}")]
    HandshakeFailed { endpoint: String, reason: String },

    /// Writing a frame to the stream failed
    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },

    /// Reading from the stream failed
    #[error("Read failed: {reason}")]
    ReadFailed { reason: String },

    /// The collector closed the stream
    #[error("Stream closed by peer")]
    ClosedByPeer,

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
}

/// Wire-level decode/encode errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Frame is not a JSON envelope
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Envelope is fine but the payload does not fit its channel
    #[error("Invalid payload on channel {channel}: {reason}")]
    InvalidPayload { channel: String, reason: String },

    #[error("Serialization failed for channel {channel}: {reason}")]
    SerializationFailed { channel: String, reason: String },
}

/// Failures while running a registered action
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Action {action_name} panicked: {reason}")]
    Panicked { action_name: String, reason: String },

    #[error("Action {action_name} was cancelled")]
    Cancelled { action_name: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConnectionError {
    /// Short label used for log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionError::DiscoveryFailed { .. } => "discovery",
            ConnectionError::HandshakeFailed { .. } => "handshake",
            ConnectionError::WriteFailed { .. } => "write",
            ConnectionError::ReadFailed { .. } => "read",
            ConnectionError::ClosedByPeer => "peer_close",
            ConnectionError::Timeout { .. } => "timeout",
        }
    }
}
