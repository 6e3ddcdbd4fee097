//! ICE (Interactive Connectivity Establishment) implementation for NAT traversal.
//!
//! This crate implements an ICE agent as defined in RFC 8445, with the STUN
//! (RFC 5389) and TURN (RFC 8656) client functionality it needs. It gathers
//! host, server reflexive and relayed candidates, runs paced connectivity
//! checks, resolves role conflicts, nominates a pair per component and keeps
//! the selected pairs alive.
//!
//! The protocol core, [`IceSession`], is sans-IO: it consumes datagrams and
//! timer expiries and produces datagrams and events. [`IceAgent`] drives a
//! session over tokio UDP sockets.
//!
//! ```no_run
//! use rvoip_ice_core::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let config = IceConfigBuilder::controlling()
//!     .stun_server("192.0.2.1:3478".parse().unwrap())
//!     .build()?;
//! let (agent, mut events, mut data) = IceAgent::new(config).await?;
//!
//! let stream = agent.create_stream(Some(1)).await?;
//! agent.gather_candidates(stream).await?;
//! for line in agent.local_candidates_sdp(stream).await? {
//!     println!("a={}", line);
//! }
//! # Ok(())
//! # }
//! ```

// Error handling
pub mod error;

// Configuration
pub mod config;

// STUN codec and transactions
pub mod stun;

// TURN client
pub mod turn;

// Candidates, pairs and check lists
pub mod candidate;
pub mod checklist;
pub mod pair;

// Streams, components and events
pub mod event;
pub mod stream;

// Sans-IO agent core
pub mod session;
pub mod transport;

mod check;
mod gather;
mod nomination;

// Async agent
pub mod agent;
mod socket;

// Public exports
pub use agent::IceAgent;
pub use candidate::{Candidate, CandidateType, FoundationRegistry, TransportType};
pub use checklist::Checklist;
pub use config::{IceConfig, IceConfigBuilder, IceRole, NominationMode, TurnServerConfig};
pub use error::{Error, Result};
pub use event::{IceAgentEvent, ReceivedData};
pub use pair::{CandidatePair, PairId, PairState};
pub use session::IceSession;
pub use stream::{ComponentId, ComponentState, Credentials, StreamId, StreamState};
pub use stun::{StunAttribute, StunAttributeType, StunMessage, StunMessageType};
pub use transport::{classify, PacketKind, Transmit};

/// Re-export of common types and functions
pub mod prelude {
    pub use super::{
        Candidate, CandidateType, ComponentState, Credentials, Error, IceAgent, IceAgentEvent,
        IceConfig, IceConfigBuilder, IceRole, IceSession, NominationMode, ReceivedData, Result,
        StreamState,
    };
}

/// ICE protocol constants
pub mod constants {
    /// STUN magic cookie value (RFC 5389)
    pub use crate::stun::STUN_MAGIC_COOKIE;

    /// Default port for STUN and TURN servers
    pub const DEFAULT_STUN_PORT: u16 = 3478;
}
