//! Notifications emitted by the agent, in the order they happen

use std::net::SocketAddr;

use bytes::Bytes;

use crate::candidate::Candidate;
use crate::stream::{ComponentId, ComponentState, StreamId, StreamState};

/// ICE agent events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceAgentEvent {
    /// A local candidate was discovered
    LocalCandidateGathered {
        stream_id: StreamId,
        candidate: Candidate,
    },

    /// No more local candidates will be reported for the component
    GatheringComplete {
        stream_id: StreamId,
        component_id: ComponentId,
    },

    /// A pair was nominated for the component
    NewSelectedPair {
        stream_id: StreamId,
        component_id: ComponentId,
        local: Candidate,
        remote: Candidate,
    },

    /// Component state change
    ComponentStateChanged {
        stream_id: StreamId,
        component_id: ComponentId,
        state: ComponentState,
    },

    /// Stream state change
    StreamStateChanged {
        stream_id: StreamId,
        state: StreamState,
    },

    /// A peer reflexive remote candidate was learned from a check
    NewRemoteCandidate {
        stream_id: StreamId,
        candidate: Candidate,
    },
}

/// Application data received on a component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedData {
    pub stream_id: StreamId,
    pub component_id: ComponentId,
    /// Remote transport address the data came from
    pub from: SocketAddr,
    pub data: Bytes,
}
