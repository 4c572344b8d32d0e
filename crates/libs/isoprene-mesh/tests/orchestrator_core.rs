mod common;

use common::{MockConnection, MockRegistry};
use mesh_core::orchestrator::{
    DiscoveryDecision, HandshakeOutcome, Orchestrator, OrchestratorConfig, SkipReason,
    ZombieAction,
};
use rns_contract::InterfaceRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;

const LOCAL: [u8; 16] = [0xEE; 16];

fn orchestrator(
    registry: Arc<MockRegistry>,
) -> (
    Orchestrator,
    mpsc::UnboundedReceiver<[u8; 16]>,
) {
    orchestrator_with(registry, OrchestratorConfig::new(LOCAL))
}

fn orchestrator_with(
    registry: Arc<MockRegistry>,
    config: OrchestratorConfig,
) -> (
    Orchestrator,
    mpsc::UnboundedReceiver<[u8; 16]>,
) {
    let (notices_tx, notices_rx) = mpsc::unbounded_channel();
    let registry_dyn: Arc<dyn InterfaceRegistry> = registry;
    (
        Orchestrator::new(config, registry_dyn, notices_tx),
        notices_rx,
    )
}

#[tokio::test(flavor = "current_thread")]
async fn discovery_gate_skips_inflight_blacklisted_and_backoff() {
    let registry = MockRegistry::new();
    let (mut orch, _notices) = orchestrator(Arc::clone(&registry));

    assert_eq!(orch.on_discovery("aa:01", -50, 0), DiscoveryDecision::Connect);
    // Attempt in flight: re-discovery is a no-op.
    assert_eq!(
        orch.on_discovery("aa:01", -48, 100),
        DiscoveryDecision::Skip(SkipReason::ConnectInFlight)
    );

    orch.record_handshake_failure("aa:01", 1_000);
    assert_eq!(
        orch.on_discovery("aa:01", -48, 2_000),
        DiscoveryDecision::Skip(SkipReason::Blacklisted)
    );
    // First failure: 60 s blacklist window.
    assert_eq!(
        orch.on_discovery("aa:01", -48, 61_001),
        DiscoveryDecision::Connect
    );

    // Disconnects impose the reconnect backoff on the address.
    let conn = MockConnection::new("aa:02", [2u8; 16]);
    orch.register_peer([2u8; 16], conn, true, 61_001).expect("register");
    orch.record_disconnect("aa:02", 61_500);
    assert_eq!(
        orch.on_discovery("aa:02", -50, 62_000),
        DiscoveryDecision::Skip(SkipReason::ReconnectBackoff)
    );
    assert_eq!(
        orch.on_discovery("aa:02", -50, 61_500 + 7_001),
        DiscoveryDecision::Connect
    );
}

#[tokio::test(flavor = "current_thread")]
async fn same_identity_two_addresses_keeps_one_child_interface() {
    let registry = MockRegistry::new();
    let (mut orch, _notices) = orchestrator(Arc::clone(&registry));
    let identity = [0x11; 16];

    let first = MockConnection::new("aa:01", identity);
    let outcome = orch
        .register_peer(identity, first, true, 0)
        .expect("register");
    assert_eq!(outcome, HandshakeOutcome::NewPeer);

    // Concurrent second path to the same identity at another address while
    // the first is healthy: rejected, and the new address backs off.
    let second = MockConnection::new("bb:02", identity);
    let outcome = orch
        .register_peer(identity, second, false, 1_000)
        .expect("register");
    assert_eq!(outcome, HandshakeOutcome::RejectedDuplicate);

    assert_eq!(orch.peer_count(), 1);
    assert_eq!(registry.attached_ids().len(), 1);
    assert_eq!(
        orch.on_discovery("bb:02", -40, 2_000),
        DiscoveryDecision::Skip(SkipReason::ReconnectBackoff)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn mac_rotation_updates_peer_in_place() {
    let registry = MockRegistry::new();
    let (mut orch, _notices) = orchestrator(Arc::clone(&registry));
    let identity = [0x22; 16];

    let before = MockConnection::new("aa:01", identity);
    orch.register_peer(identity, before, true, 0).expect("register");

    // Well past the zombie window the old connection is dead; the same
    // identity at a fresh address is a rotation, not a new peer.
    let rotated = MockConnection::new("cc:03", identity);
    let outcome = orch
        .register_peer(identity, rotated, true, 100_000)
        .expect("register");
    assert_eq!(outcome, HandshakeOutcome::UpdatedExisting);

    assert_eq!(orch.peer_count(), 1);
    assert_eq!(registry.attached_ids().len(), 1);
    assert_eq!(orch.identity_at("cc:03"), Some(identity));
    assert_eq!(orch.identity_at("aa:01"), None);
}

#[tokio::test(flavor = "current_thread")]
async fn own_identity_is_rejected() {
    let registry = MockRegistry::new();
    let (mut orch, _notices) = orchestrator(Arc::clone(&registry));
    let conn = MockConnection::new("aa:09", LOCAL);
    let outcome = orch.register_peer(LOCAL, conn, true, 0).expect("register");
    assert_eq!(outcome, HandshakeOutcome::RejectedSelf);
    assert_eq!(orch.peer_count(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn capacity_eviction_requires_score_margin() {
    let registry = MockRegistry::new();
    let mut config = OrchestratorConfig::new(LOCAL);
    config.max_connections = 1;
    let (mut orch, _notices) = orchestrator_with(Arc::clone(&registry), config);

    // Weak connected peer.
    assert_eq!(orch.on_discovery("aa:01", -95, 0), DiscoveryDecision::Connect);
    let weak = MockConnection::new("aa:01", [0x31; 16]);
    orch.register_peer([0x31; 16], weak, true, 0).expect("register");

    // A similar candidate does not clear the margin.
    assert_eq!(
        orch.on_discovery("bb:02", -93, 1_000),
        DiscoveryDecision::Skip(SkipReason::AtCapacity)
    );

    // A clearly stronger candidate evicts the worst connected peer.
    assert_eq!(
        orch.on_discovery("cc:03", -35, 2_000),
        DiscoveryDecision::ConnectAfterEvicting([0x31; 16])
    );
}

#[tokio::test(flavor = "current_thread")]
async fn zombie_flow_requests_then_forces_teardown() {
    let registry = MockRegistry::new();
    let (mut orch, _notices) = orchestrator(Arc::clone(&registry));
    let identity = [0x41; 16];
    let conn = MockConnection::new("aa:01", identity);
    orch.register_peer(identity, conn, true, 0).expect("register");

    // Quiet for longer than the zombie timeout: graceful request first.
    let actions = orch.zombie_check(46_000);
    assert_eq!(actions, vec![ZombieAction::RequestDisconnect(identity)]);

    // Still present after the grace period: force teardown.
    let actions = orch.zombie_check(46_000 + 10_000);
    assert_eq!(actions, vec![ZombieAction::ForceTeardown(identity)]);
    let peer = orch.force_teardown(&identity, 56_000).expect("teardown");
    peer.detach().await;

    assert_eq!(orch.peer_count(), 0);
    assert!(orch.is_blacklisted("aa:01", 56_001));
    assert_eq!(registry.detached.lock().expect("detached").len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn traffic_resets_the_zombie_clock() {
    let registry = MockRegistry::new();
    let (mut orch, _notices) = orchestrator(Arc::clone(&registry));
    let identity = [0x42; 16];
    let conn = MockConnection::new("aa:01", identity);
    orch.register_peer(identity, conn, true, 0).expect("register");

    // A keepalive at t=40s defers the zombie decision.
    orch.handle_frame("aa:01", &[0x00], 40_000);
    assert!(orch.zombie_check(46_000).is_empty());
    assert_eq!(
        orch.zombie_check(86_000),
        vec![ZombieAction::RequestDisconnect(identity)]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn blacklist_multiplier_grows_and_is_capped() {
    let registry = MockRegistry::new();
    let (mut orch, _notices) = orchestrator(Arc::clone(&registry));

    for _ in 0..12 {
        orch.record_handshake_failure("aa:01", 0);
    }
    // Capped at base * 8.
    assert!(orch.is_blacklisted("aa:01", 8 * 60_000 - 1));
    assert!(!orch.is_blacklisted("aa:01", 8 * 60_000));
}

#[tokio::test(flavor = "current_thread")]
async fn inbound_fragments_reassemble_into_transport_frames() {
    let registry = MockRegistry::new();
    let (mut orch, _notices) = orchestrator(Arc::clone(&registry));
    let identity = [0x51; 16];
    let conn = MockConnection::new("aa:01", identity);
    orch.register_peer(identity, conn, true, 0).expect("register");

    let packet: Vec<u8> = (0u16..300).map(|b| b as u8).collect();
    let fragmenter = mesh_core::Fragmenter::new(185).expect("fragmenter");
    for frame in fragmenter.fragment(&packet).expect("fragment") {
        orch.handle_frame("aa:01", &frame, 1_000);
    }

    let inbound = registry.inbound_packets();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].0, format!("ble/{}", hex::encode(identity)));
    assert_eq!(inbound[0].1, packet);
}

#[tokio::test(flavor = "current_thread")]
async fn sweep_expires_blacklist_entries() {
    let registry = MockRegistry::new();
    let (mut orch, _notices) = orchestrator(Arc::clone(&registry));
    orch.record_handshake_failure("aa:01", 0);
    assert!(orch.is_blacklisted("aa:01", 30_000));
    orch.sweep(61_000);
    assert!(!orch.is_blacklisted("aa:01", 30_000));
}
