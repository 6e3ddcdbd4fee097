//! Error types for the ICE agent
//!
//! Nothing that originates from a single candidate or pair is fatal to the
//! agent. Those conditions are logged and surface as pair or component state.
//! Only invalid configuration and socket allocation failures are returned
//! synchronously from the setup calls.

use std::io;
use thiserror::Error;

/// Result type alias for ICE operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ICE operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A STUN or TURN server could not be used while gathering
    #[error("Gathering error: {0}")]
    GatheringError(String),

    /// A STUN transaction exhausted its retransmissions
    #[error("STUN transaction timed out after {retransmits} retransmissions")]
    TransactionTimeout { retransmits: u32 },

    /// MESSAGE-INTEGRITY or FINGERPRINT did not verify
    #[error("Message integrity check failed: {0}")]
    IntegrityFailure(String),

    /// Both agents claimed the same role and the conflict could not be resolved
    #[error("ICE role conflict")]
    RoleConflict,

    /// A remote candidate line could not be parsed or validated
    #[error("Malformed remote candidate: {0}")]
    MalformedRemoteCandidate(String),

    /// A component has exhausted every candidate pair
    #[error("Component {component} of stream {stream} failed")]
    ComponentFailed { stream: u32, component: u16 },

    /// Work cancelled by an ICE restart
    #[error("ICE restart cancelled the operation")]
    AgentRestart,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No socket could be bound for a component
    #[error("Socket allocation failed: {0}")]
    SocketAllocation(String),

    /// STUN encoding or decoding error
    #[error("STUN error: {0}")]
    StunError(String),

    /// TURN client error
    #[error("TURN error: {0}")]
    TurnError(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The stream id is not known to the agent
    #[error("Unknown stream: {0}")]
    UnknownStream(u32),

    /// The component id is not part of the stream
    #[error("Unknown component {component} in stream {stream}")]
    UnknownComponent { stream: u32, component: u16 },

    /// I/O error
    #[error("IO error: {0}")]
    IoError(String),

    /// The agent task has stopped
    #[error("ICE agent is closed")]
    AgentClosed,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}
