//! Streams, components and their states

use std::fmt;
use std::time::Instant;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::candidate::Candidate;
use crate::checklist::Checklist;
use crate::pair::PairId;

/// Stream identifier, allocated from 1
pub type StreamId = u32;

/// Component identifier (1-based)
pub type ComponentId = u16;

/// Component connectivity state. States only move forward; restart is the
/// only way back to `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    /// Nothing started
    New,
    /// Gathering local candidates
    Gathering,
    /// Checks are running
    Checking,
    /// A pair has been nominated
    Connected,
    /// Nomination finished and no better pair is pending
    Completed,
    /// Every pair failed
    Failed,
}

impl ComponentState {
    fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Gathering => 1,
            Self::Checking => 2,
            Self::Connected => 3,
            Self::Completed => 4,
            Self::Failed => 5,
        }
    }

    /// Whether `next` is a forward transition from `self`
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Completed, _) | (Self::Failed, _) => false,
            (_, Self::Failed) => true,
            _ => next.rank() > self.rank(),
        }
    }

    /// Connected or Completed
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Gathering => write!(f, "gathering"),
            Self::Checking => write!(f, "checking"),
            Self::Connected => write!(f, "connected"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Aggregate state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
}

impl StreamState {
    /// Failed if any component failed, Completed if all completed, Connected
    /// if all are at least connected, Checking once any component is past
    /// gathering
    pub fn aggregate<I>(states: I) -> Self
    where
        I: IntoIterator<Item = ComponentState>,
    {
        let states: Vec<ComponentState> = states.into_iter().collect();
        if states.is_empty() {
            return Self::New;
        }
        if states.contains(&ComponentState::Failed) {
            Self::Failed
        } else if states.iter().all(|s| *s == ComponentState::Completed) {
            Self::Completed
        } else if states.iter().all(|s| s.is_connected()) {
            Self::Connected
        } else if states
            .iter()
            .any(|s| matches!(s, ComponentState::Checking | ComponentState::Connected | ComponentState::Completed))
        {
            Self::Checking
        } else {
            Self::New
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Checking => write!(f, "checking"),
            Self::Connected => write!(f, "connected"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// ICE username fragment and password
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub ufrag: String,
    pub pwd: String,
}

impl Credentials {
    pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }

    /// Random credentials: 8-character ufrag, 24-character password
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut draw = |len: usize| -> String {
            (0..len).map(|_| rng.sample(Alphanumeric) as char).collect()
        };
        let ufrag = draw(8);
        let pwd = draw(24);
        Self { ufrag, pwd }
    }
}

/// Gathering bookkeeping of a component
#[derive(Debug, Default)]
pub(crate) struct Gathering {
    pub started: bool,
    pub done: bool,
    /// Outstanding server round trips
    pub pending: usize,
    pub deadline: Option<Instant>,
}

/// One component of a stream
#[derive(Debug)]
pub struct Component {
    pub id: ComponentId,
    pub state: ComponentState,
    pub local_candidates: Vec<Candidate>,
    pub remote_candidates: Vec<Candidate>,
    pub checklist: Checklist,
    pub(crate) gathering: Gathering,
    /// The nominated pair, set at most once
    pub(crate) nominated: Option<PairId>,
    /// Pair carrying an outstanding nomination check
    pub(crate) nominating: Option<PairId>,
    pub(crate) first_valid_at: Option<Instant>,
    pub(crate) next_keepalive: Option<Instant>,
}

impl Component {
    pub fn new(id: ComponentId) -> Self {
        Self {
            id,
            state: ComponentState::New,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            checklist: Checklist::new(),
            gathering: Gathering::default(),
            nominated: None,
            nominating: None,
            first_valid_at: None,
            next_keepalive: None,
        }
    }

    /// Nominated pair as (local, remote)
    pub fn selected_pair(&self) -> Option<(&Candidate, &Candidate)> {
        let pair = self.checklist.get(self.nominated?)?;
        Some((&pair.local, &pair.remote))
    }

    pub fn gathering_done(&self) -> bool {
        self.gathering.done
    }

    /// Local candidate whose address matches
    pub fn local_candidate(&self, address: std::net::SocketAddr) -> Option<&Candidate> {
        self.local_candidates.iter().find(|c| c.address == address)
    }

    /// Remote candidate whose address matches
    pub fn remote_candidate(&self, address: std::net::SocketAddr) -> Option<&Candidate> {
        self.remote_candidates.iter().find(|c| c.address == address)
    }
}

/// A stream and its components
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub state: StreamState,
    pub components: Vec<Component>,
    /// IP TOS value applied to the stream's sockets
    pub tos: Option<u32>,
}

impl Stream {
    pub fn new(id: StreamId, components: u16) -> Self {
        Self {
            id,
            state: StreamState::New,
            components: (1..=components).map(Component::new).collect(),
            tos: None,
        }
    }

    pub fn component(&self, id: ComponentId) -> Option<&Component> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn component_mut(&mut self, id: ComponentId) -> Option<&mut Component> {
        self.components.iter_mut().find(|c| c.id == id)
    }

    /// Recompute the aggregate state. Returns the new state when it changed.
    pub(crate) fn refresh_state(&mut self) -> Option<StreamState> {
        let state = StreamState::aggregate(self.components.iter().map(|c| c.state));
        if state != self.state {
            self.state = state;
            Some(state)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_component_transitions_are_monotonic() {
        use ComponentState::*;
        assert!(New.can_transition_to(Gathering));
        assert!(Gathering.can_transition_to(Checking));
        assert!(Checking.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Completed));
        assert!(Checking.can_transition_to(Failed));

        assert!(!Completed.can_transition_to(Checking));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Connected.can_transition_to(Checking));
        assert!(!Failed.can_transition_to(Checking));
    }

    #[test]
    fn test_stream_state_aggregation() {
        use ComponentState as C;
        assert_eq!(StreamState::aggregate([C::New, C::Gathering]), StreamState::New);
        assert_eq!(StreamState::aggregate([C::Checking, C::Gathering]), StreamState::Checking);
        assert_eq!(StreamState::aggregate([C::Connected, C::Completed]), StreamState::Connected);
        assert_eq!(StreamState::aggregate([C::Completed, C::Completed]), StreamState::Completed);
        assert_eq!(StreamState::aggregate([C::Completed, C::Failed]), StreamState::Failed);
    }

    #[test]
    fn test_random_credentials() {
        let mut rng = StdRng::seed_from_u64(9);
        let a = Credentials::random(&mut rng);
        let b = Credentials::random(&mut rng);
        assert_eq!(a.ufrag.len(), 8);
        assert_eq!(a.pwd.len(), 24);
        assert_ne!(a, b);
        assert!(a.pwd.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_stream_components() {
        let stream = Stream::new(1, 2);
        assert_eq!(stream.components.len(), 2);
        assert!(stream.component(2).is_some());
        assert!(stream.component(3).is_none());
        assert!(stream.component(1).unwrap().selected_pair().is_none());
    }
}
