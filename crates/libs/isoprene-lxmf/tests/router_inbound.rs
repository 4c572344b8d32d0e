mod common;

use common::{packed_message, testbed, testbed_with_config};
use lxmf_core::message::{DeliveryMethod, LxmMessage};
use lxmf_core::router::RouterConfig;
use lxmf_core::stamp::stamp_workblock;
use lxmf_core::stamper::Stamper;
use rand_core::OsRng;
use rns_contract::testing::StubLink;
use rns_contract::{DestinationHash, PrivateIdentity, TransportEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[test]
fn duplicate_inbound_is_delivered_once() {
    let mut bed = testbed();
    let source = PrivateIdentity::generate(&mut OsRng);
    let raw = packed_message(&bed, DestinationHash::new([0xAA; 16]), &source, "hi");

    assert!(bed
        .router
        .process_inbound(&raw, DeliveryMethod::Opportunistic, None, 0));
    assert!(!bed
        .router
        .process_inbound(&raw, DeliveryMethod::Opportunistic, None, 1_000));
    assert_eq!(bed.delivered.load(Ordering::SeqCst), 1);
    assert_eq!(bed.router.stats().inbound_duplicate_total, 1);
}

#[test]
fn tampered_signature_is_dropped() {
    let mut bed = testbed();
    let source = PrivateIdentity::generate(&mut OsRng);
    let mut raw = packed_message(&bed, DestinationHash::new([0xAB; 16]), &source, "hi");
    // Byte 40 sits inside the 64-byte signature block.
    raw[40] ^= 0xFF;

    assert!(!bed
        .router
        .process_inbound(&raw, DeliveryMethod::Opportunistic, None, 0));
    assert_eq!(bed.delivered.load(Ordering::SeqCst), 0);
}

#[test]
fn unknown_source_is_accepted_unverified() {
    let mut bed = testbed();
    let stranger = PrivateIdentity::generate(&mut OsRng);
    // Packed without the identity store learning the public key.
    let mut msg = LxmMessage::outbound(
        DestinationHash::new([0xAC; 16]),
        stranger.clone(),
        "t",
        "c",
    );
    msg.seal(1.0).expect("seal");
    msg.pack().expect("pack");

    assert!(bed.router.process_inbound(
        msg.packed().expect("packed"),
        DeliveryMethod::Opportunistic,
        None,
        0
    ));
    assert_eq!(bed.delivered.load(Ordering::SeqCst), 1);
}

#[test]
fn ignored_source_is_dropped() {
    let mut bed = testbed();
    let source = PrivateIdentity::generate(&mut OsRng);
    let raw = packed_message(&bed, DestinationHash::new([0xAD; 16]), &source, "hi");

    bed.router.ignore_destination(source.destination_hash());
    assert!(!bed
        .router
        .process_inbound(&raw, DeliveryMethod::Opportunistic, None, 0));
    assert_eq!(bed.delivered.load(Ordering::SeqCst), 0);
}

#[test]
fn auth_required_gates_unlisted_sources() {
    let mut bed = testbed_with_config(RouterConfig {
        auth_required: true,
    });
    let source = PrivateIdentity::generate(&mut OsRng);
    let raw = packed_message(&bed, DestinationHash::new([0xAE; 16]), &source, "hi");

    assert!(!bed
        .router
        .process_inbound(&raw, DeliveryMethod::Opportunistic, None, 0));

    bed.router.allow_destination(source.destination_hash());
    // New content so the first drop is not masked by dedup.
    let raw = packed_message(&bed, DestinationHash::new([0xAE; 16]), &source, "again");
    assert!(bed
        .router
        .process_inbound(&raw, DeliveryMethod::Opportunistic, None, 1_000));
    assert_eq!(bed.delivered.load(Ordering::SeqCst), 1);
}

#[test]
fn stamp_cost_enforced_on_inbound() {
    let mut bed = testbed();
    let local = PrivateIdentity::generate(&mut OsRng);
    let local_dest = bed
        .router
        .register_delivery_identity(local, None, Some(8))
        .expect("register");

    let sender = PrivateIdentity::generate(&mut OsRng);
    bed.identities.remember(&sender.public());

    // No stamp attached: rejected.
    let mut unstamped = LxmMessage::outbound(local_dest, sender.clone(), "t", "no stamp");
    unstamped.seal(1.0).expect("seal");
    unstamped.pack().expect("pack");
    assert!(!bed.router.process_inbound(
        unstamped.packed().expect("packed"),
        DeliveryMethod::Opportunistic,
        None,
        0
    ));
    assert_eq!(bed.router.stats().inbound_rejected_total, 1);

    // Valid proof of work: accepted.
    let mut stamped =
        LxmMessage::outbound(local_dest, sender.clone(), "t", "stamped").with_stamp_cost(8);
    stamped.seal(2.0).expect("seal");
    let workblock = stamp_workblock(&stamped.message_id().expect("id"), 3_000);
    let cancel = AtomicBool::new(false);
    let stamp = Stamper::new()
        .generate_stamp(&workblock, 8, &cancel)
        .expect("stamp search");
    stamped.set_stamp(stamp);
    stamped.pack().expect("pack");
    assert!(bed.router.process_inbound(
        stamped.packed().expect("packed"),
        DeliveryMethod::Opportunistic,
        None,
        1_000
    ));
    assert_eq!(bed.delivered.load(Ordering::SeqCst), 1);
}

#[test]
fn delivery_announce_is_emitted_with_name_and_cost() {
    let mut bed = testbed();
    let local = PrivateIdentity::generate(&mut OsRng);
    let local_dest = bed
        .router
        .register_delivery_identity(local, Some("inbox".into()), Some(14))
        .expect("register");

    bed.router.announce_delivery(&local_dest).expect("announce");

    let announces = bed.transport.announces.lock().expect("announces");
    assert_eq!(announces.len(), 1);
    assert_eq!(announces[0].0, local_dest);
    let (name, cost) =
        lxmf_core::router::parse_delivery_announce(&announces[0].1).expect("parse");
    assert_eq!(name.as_deref(), Some("inbox"));
    assert_eq!(cost, Some(14));
}

#[test]
fn delivery_announce_caches_cost_and_nudges_pending_messages() {
    let mut bed = testbed();
    let peer = PrivateIdentity::generate(&mut OsRng);
    let peer_dest = peer.destination_hash();

    // Pending message parked on the path-request wait.
    let msg = LxmMessage::outbound(
        peer_dest,
        PrivateIdentity::generate(&mut OsRng),
        "t",
        "waiting",
    );
    bed.router.enqueue_outbound(msg, 0).expect("enqueue");
    bed.router.tick_at(0);
    assert_eq!(bed.transport.attempted_send_count(), 0);

    // The peer announces: dispatch is brought forward instead of waiting
    // out the full path-request delay.
    let app_data =
        lxmf_core::router::delivery_announce_app_data(Some("peer"), Some(9)).expect("encode");
    bed.router.handle_event(
        TransportEvent::AnnounceReceived {
            kind: rns_contract::AnnounceKind::Delivery,
            destination: peer_dest,
            identity: peer.public(),
            app_data,
        },
        2_000,
    );
    assert_eq!(bed.transport.attempted_send_count(), 1);

    // The announced cost now applies to fresh outbound messages.
    let next = LxmMessage::outbound(
        peer_dest,
        PrivateIdentity::generate(&mut OsRng),
        "t",
        "costed",
    );
    bed.router.enqueue_outbound(next, 3_000).expect("enqueue");
    let job = bed.router.next_stamp_job().expect("stamp job");
    assert_eq!(job.cost, 9);
}

#[test]
fn identified_link_becomes_reply_backchannel() {
    let mut bed = testbed();
    let source = PrivateIdentity::generate(&mut OsRng);
    let raw = packed_message(&bed, DestinationHash::new([0xAF; 16]), &source, "hi");

    // Incoming link whose proven identity matches the message source.
    let link = Arc::new(StubLink::new(21, source.destination_hash(), false));
    link.set_remote_identity(source.public());
    bed.router.handle_event(
        TransportEvent::LinkEstablished {
            link: Arc::clone(&link),
        },
        0,
    );

    assert!(bed
        .router
        .process_inbound(&raw, DeliveryMethod::Direct, Some(21), 0));
    assert!(bed
        .router
        .backchannel_for(&source.destination_hash())
        .is_some());

    // Backchannels are reply-side only: an originated direct send must open
    // its own outgoing link instead of reusing the inbound one.
    let reply = LxmMessage::outbound(source.destination_hash(), source.clone(), "re", "body")
        .with_desired_method(DeliveryMethod::Direct);
    bed.router.enqueue_outbound(reply, 1_000).expect("enqueue");
    bed.router.tick_at(1_000);
    assert_eq!(bed.transport.link_attempts.lock().expect("attempts").len(), 1);
    assert!(link.sent_packets.lock().expect("sent").is_empty());
}
