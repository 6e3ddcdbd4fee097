//! Candidate gathering against mock STUN and TURN servers
//!
//! Covers server reflexive discovery behind a NAT, relayed candidates from a
//! TURN server that challenges for long-term credentials, connectivity over
//! the relay for longer than permission and allocation lifetimes, losing and
//! releasing allocations, and gathering against servers that never answer.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use common::{addr, init_tracing, Network, StunServer, TurnServer, TurnStats};
use rvoip_ice_core::prelude::*;
use rvoip_ice_core::{Candidate, ComponentState, PairState};

const TIMEOUT: Duration = Duration::from_secs(30);

fn local_candidates(net: &Network, peer: usize) -> Vec<Candidate> {
    net.peers[peer]
        .session
        .local_candidates(net.peers[peer].stream)
        .unwrap()
}

#[test]
fn test_unreachable_stun_server_yields_host_candidates() {
    let mut net = Network::new(1);
    let config = IceConfigBuilder::controlling()
        .stun_server(addr("198.51.100.1:3478"))
        .max_gathering_time_ms(2000)
        .build()
        .unwrap();
    let a = net.add_peer(config, 1, &[(1, addr("10.0.0.1:5000"))]);
    assert!(!net.peers[a].gathering_complete());
    assert_eq!(net.peers[a].component_state(1), ComponentState::Gathering);

    assert!(net.run_until(Duration::from_secs(10), |net| net.peers[a].gathering_complete()));
    assert!(net.elapsed() <= Duration::from_millis(2000));

    let candidates = local_candidates(&net, a);
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].candidate_type, CandidateType::Host);
    assert_eq!(candidates[0].priority, Candidate::compute_priority(CandidateType::Host, 65535, 1));
}

#[test]
fn test_server_reflexive_behind_nat() {
    init_tracing();
    let mut net = Network::new(2);
    net.add_server(Box::new(StunServer::new(addr("192.0.2.1:3478"))));
    net.add_nat(addr("10.0.0.1:5000"), addr("203.0.113.1:40000"));

    let config = IceConfigBuilder::controlling()
        .stun_server(addr("192.0.2.1:3478"))
        .retransmission(100, 400, 5)
        .build()
        .unwrap();
    let a = net.add_peer(config, 21, &[(1, addr("10.0.0.1:5000"))]);
    assert!(net.run_until(TIMEOUT, |net| net.peers[a].gathering_complete()));

    let candidates = local_candidates(&net, a);
    let srflx = candidates
        .iter()
        .find(|c| c.candidate_type == CandidateType::ServerReflexive)
        .expect("no server reflexive candidate");
    assert_eq!(srflx.address, addr("203.0.113.1:40000"));
    assert_eq!(srflx.base, addr("10.0.0.1:5000"));
    assert_eq!(srflx.related_address, Some(addr("10.0.0.1:5000")));
    assert_eq!(
        srflx.priority,
        Candidate::compute_priority(CandidateType::ServerReflexive, 65535, 1)
    );

    // The public peer reaches A through its mapped address
    let config = IceConfigBuilder::new().retransmission(100, 400, 5).build().unwrap();
    let b = net.add_peer(config, 22, &[(1, addr("10.0.0.2:6000"))]);
    net.connect(a, b);
    assert!(net.run_to_completion(a, b, TIMEOUT));

    let (a_local, a_remote) = net.peers[a].selected(1).unwrap();
    assert_eq!(a_local, addr("203.0.113.1:40000"));
    assert_eq!(a_remote, addr("10.0.0.2:6000"));
    assert_eq!(
        net.peers[b].selected(1),
        Some((addr("10.0.0.2:6000"), addr("203.0.113.1:40000")))
    );
}

#[test]
fn test_same_mapped_address_adds_no_server_reflexive() {
    let mut net = Network::new(3);
    net.add_server(Box::new(StunServer::new(addr("192.0.2.1:3478"))));
    let config = IceConfigBuilder::new()
        .stun_server(addr("192.0.2.1:3478"))
        .build()
        .unwrap();
    let a = net.add_peer(config, 31, &[(1, addr("10.0.0.1:5000"))]);
    assert!(net.run_until(TIMEOUT, |net| net.peers[a].gathering_complete()));
    let candidates = local_candidates(&net, a);
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].candidate_type, CandidateType::Host);
}

#[test]
fn test_relayed_candidate_after_challenge() {
    init_tracing();
    let mut net = Network::new(4);
    net.add_server(Box::new(TurnServer::new(
        addr("192.0.2.10:3478"),
        addr("192.0.2.10:50000"),
        "alice",
        "secret",
    )));
    let config = IceConfigBuilder::controlling()
        .turn_server(addr("192.0.2.10:3478"), "alice", "secret")
        .retransmission(100, 400, 5)
        .build()
        .unwrap();
    let a = net.add_peer(config, 41, &[(1, addr("10.0.0.1:5000"))]);
    assert!(net.run_until(TIMEOUT, |net| net.peers[a].gathering_complete()));

    let candidates = local_candidates(&net, a);
    let relay = candidates
        .iter()
        .find(|c| c.candidate_type == CandidateType::Relayed)
        .expect("no relayed candidate");
    assert_eq!(relay.address, addr("192.0.2.10:50000"));
    assert_eq!(relay.base, addr("192.0.2.10:50000"));
    assert_eq!(relay.related_address, Some(addr("10.0.0.1:5000")));
    assert_eq!(relay.priority, Candidate::compute_priority(CandidateType::Relayed, 65535, 1));
    // Mapped address equals the host address, so no server reflexive candidate
    assert_eq!(candidates.len(), 2);
}

#[test]
fn test_wrong_turn_password_gives_up() {
    let mut net = Network::new(5);
    net.add_server(Box::new(TurnServer::new(
        addr("192.0.2.10:3478"),
        addr("192.0.2.10:50000"),
        "alice",
        "secret",
    )));
    let config = IceConfigBuilder::new()
        .turn_server(addr("192.0.2.10:3478"), "alice", "wrong")
        .retransmission(100, 400, 5)
        .build()
        .unwrap();
    let a = net.add_peer(config, 51, &[(1, addr("10.0.0.1:5000"))]);
    assert!(net.run_until(TIMEOUT, |net| net.peers[a].gathering_complete()));

    let candidates = local_candidates(&net, a);
    assert!(candidates.iter().all(|c| c.candidate_type == CandidateType::Host));
}

/// A and B whose hosts cannot reach each other, connected through A's relay
fn connected_over_relay(seed: u64) -> (Network, usize, usize, Rc<RefCell<TurnStats>>) {
    let mut net = Network::new(seed);
    let turn = TurnServer::new(addr("192.0.2.10:3478"), addr("192.0.2.10:50000"), "alice", "secret");
    let stats = turn.stats();
    net.add_server(Box::new(turn));
    // Only the relay connects the two hosts
    net.block(addr("10.0.0.1:5000"), addr("10.0.0.2:6000"));

    let config = IceConfigBuilder::controlling()
        .turn_server(addr("192.0.2.10:3478"), "alice", "secret")
        .retransmission(100, 400, 5)
        .nomination_timeout_ms(500)
        .build()
        .unwrap();
    let a = net.add_peer(config, seed * 10 + 1, &[(1, addr("10.0.0.1:5000"))]);
    let config = IceConfigBuilder::new().retransmission(100, 400, 5).build().unwrap();
    let b = net.add_peer(config, seed * 10 + 2, &[(1, addr("10.0.0.2:6000"))]);
    assert!(net.run_until(TIMEOUT, |net| net.peers[a].gathering_complete()));

    net.signal(a, b, |c| c.candidate_type == CandidateType::Relayed);
    net.signal(b, a, |_| true);
    assert!(net.run_to_completion(a, b, TIMEOUT));
    (net, a, b, stats)
}

/// Send one datagram each way and wait for both
fn exchange_data(net: &mut Network, a: usize, b: usize) {
    let (seen_a, seen_b) = (net.peers[a].data.len(), net.peers[b].data.len());
    let (stream_a, stream_b, now) = (net.peers[a].stream, net.peers[b].stream, net.now);
    net.peers[a].session.send(now, stream_a, 1, b"via relay").unwrap();
    net.peers[b].session.send(now, stream_b, 1, b"and back").unwrap();
    assert!(net.run_until(Duration::from_secs(1), |net| {
        net.peers[a].data.len() > seen_a && net.peers[b].data.len() > seen_b
    }));
    assert_eq!(&net.peers[b].data[seen_b].data[..], b"via relay");
    assert_eq!(net.peers[b].data[seen_b].from, addr("192.0.2.10:50000"));
    assert_eq!(&net.peers[a].data[seen_a].data[..], b"and back");
    assert_eq!(net.peers[a].data[seen_a].from, addr("10.0.0.2:6000"));
}

#[test]
fn test_connectivity_over_relay() {
    init_tracing();
    let (mut net, a, b, stats) = connected_over_relay(6);

    assert_eq!(
        net.peers[a].selected(1),
        Some((addr("192.0.2.10:50000"), addr("10.0.0.2:6000")))
    );
    assert_eq!(
        net.peers[b].selected(1),
        Some((addr("10.0.0.2:6000"), addr("192.0.2.10:50000")))
    );
    assert!(stats.borrow().channel_binds >= 1);
    exchange_data(&mut net, a, b);
}

#[test]
fn test_relay_outlives_permission_and_allocation_lifetimes() {
    let (mut net, a, b, stats) = connected_over_relay(8);
    let unpermitted = stats.borrow().unpermitted;
    let binds = stats.borrow().channel_binds;

    // Past the five minute permission lifetime and the allocation refresh
    net.run_until(Duration::from_secs(700), |_| false);

    let stats_now = stats.borrow();
    assert!(stats_now.channel_binds >= binds + 2, "channel bindings were not refreshed");
    assert!(stats_now.refreshes >= 1, "allocation was not refreshed");
    // Keepalives from B kept reaching A through the relay
    assert_eq!(stats_now.unpermitted, unpermitted);
    drop(stats_now);

    assert_eq!(net.peers[a].component_state(1), ComponentState::Completed);
    exchange_data(&mut net, a, b);
}

#[test]
fn test_lost_allocation_fails_relayed_pairs() {
    let (mut net, a, _b, stats) = connected_over_relay(9);
    stats.borrow_mut().reject_refresh = true;

    assert!(net.run_until(Duration::from_secs(700), |_| stats.borrow().rejected_refreshes > 0));
    net.run_until(Duration::from_secs(1), |_| false);

    let peer = &net.peers[a];
    let candidates = peer.session.local_candidates(peer.stream).unwrap();
    assert!(candidates.iter().all(|c| c.candidate_type != CandidateType::Relayed));

    let component = &peer.session.stream(peer.stream).unwrap().components[0];
    let relayed: Vec<_> = component
        .checklist
        .pairs()
        .iter()
        .filter(|p| p.local.address == addr("192.0.2.10:50000"))
        .collect();
    assert!(!relayed.is_empty());
    assert!(relayed.iter().all(|p| p.state == PairState::Failed && !p.valid));
    // No further refreshes or rebinds for a dead allocation
    assert_eq!(stats.borrow().rejected_refreshes, 1);
}

#[test]
fn test_remove_stream_releases_allocation_and_transactions() {
    let mut net = Network::new(10);
    let turn = TurnServer::new(addr("192.0.2.10:3478"), addr("192.0.2.10:50000"), "alice", "secret");
    let stats = turn.stats();
    net.add_server(Box::new(turn));
    let config = IceConfigBuilder::new()
        .turn_server(addr("192.0.2.10:3478"), "alice", "secret")
        // Never answers, so its request stays outstanding
        .stun_server(addr("198.51.100.1:3478"))
        .max_gathering_time_ms(10_000)
        .build()
        .unwrap();
    let a = net.add_peer(config, 101, &[(1, addr("10.0.0.1:5000"))]);
    assert!(net.run_until(TIMEOUT, |net| {
        local_candidates(net, a)
            .iter()
            .any(|c| c.candidate_type == CandidateType::Relayed)
    }));
    assert!(!net.peers[a].gathering_complete());

    let stream = net.peers[a].stream;
    let released = net.peers[a].session.remove_stream(stream).unwrap();
    assert!(released.contains(&addr("10.0.0.1:5000")));
    assert!(net.peers[a].session.poll_timeout().is_none());
    assert!(matches!(
        net.peers[a].session.stream_state(stream),
        Err(Error::UnknownStream(_))
    ));

    assert!(net.run_until(Duration::from_secs(1), |_| stats.borrow().released));
    assert!(net.peers[a].session.poll_timeout().is_none());
}

#[test]
fn test_close_releases_allocation() {
    let mut net = Network::new(7);
    net.add_server(Box::new(TurnServer::new(
        addr("192.0.2.10:3478"),
        addr("192.0.2.10:50000"),
        "alice",
        "secret",
    )));
    let config = IceConfigBuilder::new()
        .turn_server(addr("192.0.2.10:3478"), "alice", "secret")
        .build()
        .unwrap();
    let a = net.add_peer(config, 71, &[(1, addr("10.0.0.1:5000"))]);
    assert!(net.run_until(TIMEOUT, |net| net.peers[a].gathering_complete()));

    net.peers[a].session.close();
    assert!(net.peers[a].session.is_closed());
    // The release goes out once and is never retransmitted
    net.run_until(Duration::from_secs(1), |_| false);
    assert!(net.peers[a].session.poll_timeout().is_none());
    assert!(net.peers[a].session.add_stream(None).is_err());
}
