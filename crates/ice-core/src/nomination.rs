//! Nomination, component completion and keepalives

use std::time::Instant;

use tracing::{debug, info};

use crate::checklist::TriggeredCheck;
use crate::config::{IceRole, NominationMode};
use crate::event::IceAgentEvent;
use crate::pair::PairId;
use crate::session::IceSession;
use crate::stream::{Component, ComponentId, ComponentState, StreamId};
use crate::stun::{StunMessage, StunMessageType};

impl IceSession {
    /// Select a pair for a component. A component is nominated at most once;
    /// later calls are ignored.
    pub(crate) fn nominate(&mut self, now: Instant, stream_id: StreamId, component_id: ComponentId, pair_id: PairId) {
        let keepalive = self.config.keepalive_interval();
        let Some(component) = self.component_mut(stream_id, component_id) else {
            return;
        };
        if component.nominated.is_some() {
            return;
        }
        let Some(pair) = component.checklist.get_mut(pair_id) else {
            return;
        };
        pair.nominated = true;
        let (local, remote) = (pair.local.clone(), pair.remote.clone());
        component.nominated = Some(pair_id);
        component.nominating = None;
        component.next_keepalive = Some(now + keepalive);

        info!(
            "Stream {} component {} selected {} <-> {}",
            stream_id, component_id, local.address, remote.address
        );
        self.events.push_back(IceAgentEvent::NewSelectedPair {
            stream_id,
            component_id,
            local,
            remote,
        });
        self.set_component_state(stream_id, component_id, ComponentState::Connected);
    }

    /// Whether this agent nominates with a dedicated check after validation
    fn nominates_regularly(&self) -> bool {
        self.role == IceRole::Controlling
            && !self.config.lite
            && self.config.nomination == NominationMode::Regular
    }

    /// Controlling agent, regular nomination: once the best valid pair cannot
    /// be beaten, or the nomination timeout has run out, recheck it with
    /// USE-CANDIDATE
    pub(crate) fn evaluate_nomination(&mut self, now: Instant, stream_id: StreamId, component_id: ComponentId) {
        if !self.nominates_regularly() {
            return;
        }
        let timeout = self.config.nomination_timeout();
        let Some(component) = self.component_mut(stream_id, component_id) else {
            return;
        };
        if component.nominated.is_some()
            || component.nominating.is_some()
            || !matches!(component.state, ComponentState::Checking | ComponentState::Connected)
        {
            return;
        }
        let Some((best, priority)) = component.checklist.best_valid().map(|p| (p.id, p.priority)) else {
            return;
        };
        let waited = component.first_valid_at.is_some_and(|at| now >= at + timeout);
        if component.checklist.has_outstanding_above(priority) && !waited {
            return;
        }

        debug!("Stream {} component {}: nominating {}", stream_id, component_id, best);
        component.nominating = Some(best);
        component.checklist.push_triggered(TriggeredCheck {
            pair: best,
            nominate: true,
        });
        self.arm_pacer(now);
    }

    /// When the nomination timeout of a component runs out
    pub(crate) fn nomination_deadline(&self, component: &Component) -> Option<Instant> {
        if !self.nominates_regularly()
            || component.nominated.is_some()
            || component.nominating.is_some()
            || !matches!(component.state, ComponentState::Checking | ComponentState::Connected)
            || component.checklist.best_valid().is_none()
        {
            return None;
        }
        component
            .first_valid_at
            .map(|at| at + self.config.nomination_timeout())
    }

    pub(crate) fn check_nomination_timers(&mut self, now: Instant) {
        let due: Vec<(StreamId, ComponentId)> = self
            .streams
            .values()
            .flat_map(|s| {
                s.components
                    .iter()
                    .filter(|c| self.nomination_deadline(c).is_some_and(|at| at <= now))
                    .map(move |c| (s.id, c.id))
            })
            .collect();
        for (stream_id, component_id) in due {
            self.evaluate_nomination(now, stream_id, component_id);
        }
    }

    /// Move a component to Completed or Failed when its checks allow it
    pub(crate) fn update_component_state(&mut self, stream_id: StreamId, component_id: ComponentId) {
        let immediate = self.role == IceRole::Controlled
            || self.config.lite
            || self.config.nomination == NominationMode::Regular;
        let Some(component) = self.component_mut(stream_id, component_id) else {
            return;
        };

        let target = if let Some(nominated) = component.nominated {
            let priority = component
                .checklist
                .get(nominated)
                .map(|p| p.priority)
                .unwrap_or(0);
            if immediate || !component.checklist.has_outstanding_above(priority) {
                Some(ComponentState::Completed)
            } else {
                None
            }
        } else if component.gathering_done()
            && component.state == ComponentState::Checking
            && component.checklist.all_terminal()
            && component.checklist.best_valid().is_none()
            && !component.checklist.has_triggered()
        {
            Some(ComponentState::Failed)
        } else {
            None
        };

        match target {
            Some(ComponentState::Completed) if component.state != ComponentState::Completed => {
                let cancelled = component.checklist.cancel_outstanding();
                for id in cancelled {
                    self.transactions.take(&id);
                }
                self.set_component_state(stream_id, component_id, ComponentState::Completed);
            }
            Some(ComponentState::Failed) => {
                info!(
                    "Stream {} component {}: every candidate pair failed",
                    stream_id, component_id
                );
                self.set_component_state(stream_id, component_id, ComponentState::Failed);
            }
            _ => {}
        }
    }

    /// Binding indications on selected pairs keep NAT bindings open
    pub(crate) fn send_keepalives(&mut self, now: Instant) {
        let interval = self.config.keepalive_interval();
        let mut due = Vec::new();
        for stream in self.streams.values_mut() {
            for component in &mut stream.components {
                if !component.next_keepalive.is_some_and(|at| at <= now) {
                    continue;
                }
                if let Some((local, remote)) = component.selected_pair().map(|(l, r)| (l.base, r.address)) {
                    due.push((local, remote));
                }
                component.next_keepalive = Some(now + interval);
            }
        }

        for (local, remote) in due {
            let id = crate::stun::TransactionId::random(&mut self.rng);
            let mut msg = StunMessage::with_transaction_id(StunMessageType::BINDING_INDICATION, id);
            self.add_software(&mut msg);
            let data = msg.encode_with_fingerprint();
            if let Some(transmit) = self.route(now, local, remote, &data) {
                self.transmits.push_back(transmit);
            }
        }
    }
}
