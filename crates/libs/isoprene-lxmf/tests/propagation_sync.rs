mod common;

use common::{outbound_to, packed_message, propagation_announce_app_data, testbed};
use lxmf_core::message::{DeliveryMethod, WireMessage};
use lxmf_core::propagation::PropagationState;
use rand_core::OsRng;
use rns_contract::testing::StubLink;
use rns_contract::{AnnounceKind, DestinationHash, PrivateIdentity, TransportEvent};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn announce_node(bed: &mut common::TestBed, node: &PrivateIdentity) -> DestinationHash {
    let destination = node.destination_hash();
    bed.router.handle_event(
        TransportEvent::AnnounceReceived {
            kind: AnnounceKind::PropagationNode,
            destination,
            identity: node.public(),
            app_data: propagation_announce_app_data(1_700_000_000, true),
        },
        0,
    );
    destination
}

#[test]
fn list_get_sync_filters_known_ids_and_delivers() {
    let mut bed = testbed();
    let node = PrivateIdentity::generate(&mut OsRng);
    let node_dest = announce_node(&mut bed, &node);
    bed.transport.add_path(node_dest);

    let sender = PrivateIdentity::generate(&mut OsRng);
    let bytes1 = packed_message(&bed, DestinationHash::new([0x01; 16]), &sender, "one");
    let bytes2 = packed_message(&bed, DestinationHash::new([0x02; 16]), &sender, "two");
    let id1 = WireMessage::transient_id(&bytes1).to_vec();
    let id2 = WireMessage::transient_id(&bytes2).to_vec();

    // Message two is already known: its id must be filtered from the GET.
    assert!(bed
        .router
        .process_inbound(&bytes2, DeliveryMethod::Opportunistic, None, 0));

    bed.router
        .request_messages_from_propagation_node(1_000)
        .expect("sync start");
    assert_eq!(
        bed.router.propagation_client().state(),
        PropagationState::LinkEstablishing
    );
    assert_eq!(bed.transport.link_attempts.lock().expect("attempts").len(), 1);

    let link = Arc::new(StubLink::new(31, node_dest, true));
    bed.router.handle_event(
        TransportEvent::LinkEstablished {
            link: Arc::clone(&link),
        },
        2_000,
    );
    assert_eq!(
        bed.router.propagation_client().state(),
        PropagationState::ListingMessages
    );

    // LIST went out as msgpack([nil, nil]).
    let (path, body, list_request_id) = link.sent_requests.lock().expect("requests")[0].clone();
    assert_eq!(path, "/get");
    assert_eq!(body, vec![0x92, 0xC0, 0xC0]);

    let list_response = {
        let value = rmpv::Value::Array(vec![
            rmpv::Value::Binary(id1.clone()),
            rmpv::Value::Binary(id2.clone()),
        ]);
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &value).expect("encode");
        out
    };
    bed.router.handle_event(
        TransportEvent::RequestResponse {
            link_id: 31,
            request_id: list_request_id,
            response: list_response,
        },
        3_000,
    );

    // GET carries only the unknown id plus the delivery limit.
    let (_, get_body, get_request_id) = link.sent_requests.lock().expect("requests")[1].clone();
    let decoded: rmpv::Value =
        rmpv::decode::read_value(&mut get_body.as_slice()).expect("decode");
    let elements = decoded.as_array().expect("array");
    let wants = elements[0].as_array().expect("wants");
    assert_eq!(wants.len(), 1);
    assert_eq!(wants[0].as_slice(), Some(id1.as_slice()));
    assert_eq!(elements[2].as_u64(), Some(1_000));

    let get_response = {
        let value = rmpv::Value::Array(vec![rmpv::Value::Binary(bytes1.clone())]);
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &value).expect("encode");
        out
    };
    bed.router.handle_event(
        TransportEvent::RequestResponse {
            link_id: 31,
            request_id: get_request_id,
            response: get_response,
        },
        4_000,
    );

    // bytes2 was delivered earlier, bytes1 via the sync: two in total.
    assert_eq!(bed.delivered.load(Ordering::SeqCst), 2);
    assert_eq!(
        bed.router.propagation_client().state(),
        PropagationState::Complete
    );
    assert_eq!(bed.router.propagation_client().last_result(), Some(1));
}

#[test]
fn integer_response_fails_the_sync() {
    let mut bed = testbed();
    let node = PrivateIdentity::generate(&mut OsRng);
    let node_dest = announce_node(&mut bed, &node);
    bed.transport.add_path(node_dest);

    bed.router
        .request_messages_from_propagation_node(0)
        .expect("sync start");
    let link = Arc::new(StubLink::new(32, node_dest, true));
    bed.router.handle_event(
        TransportEvent::LinkEstablished {
            link: Arc::clone(&link),
        },
        0,
    );
    let list_request_id = link.sent_requests.lock().expect("requests")[0].2;

    // ERROR_NO_ACCESS as a bare integer response.
    let mut response = Vec::new();
    rmpv::encode::write_value(&mut response, &rmpv::Value::Integer(0xF1u64.into()))
        .expect("encode");
    bed.router.handle_event(
        TransportEvent::RequestResponse {
            link_id: 32,
            request_id: list_request_id,
            response,
        },
        1_000,
    );
    assert_eq!(
        bed.router.propagation_client().state(),
        PropagationState::Failed
    );
    assert_eq!(bed.delivered.load(Ordering::SeqCst), 0);
}

#[test]
fn sync_without_node_is_an_error() {
    let mut bed = testbed();
    assert!(bed.router.request_messages_from_propagation_node(0).is_err());
}

#[test]
fn pathless_node_requests_path_first() {
    let mut bed = testbed();
    let node = PrivateIdentity::generate(&mut OsRng);
    announce_node(&mut bed, &node);

    bed.router
        .request_messages_from_propagation_node(0)
        .expect("sync start");
    assert_eq!(
        bed.router.propagation_client().state(),
        PropagationState::NoPath
    );
    assert_eq!(bed.transport.path_request_count(), 1);
}

#[test]
fn propagated_outbound_uploads_as_wrapped_resource() {
    let mut bed = testbed();
    let node = PrivateIdentity::generate(&mut OsRng);
    let node_dest = announce_node(&mut bed, &node);
    bed.transport.add_path(node_dest);

    let sender = PrivateIdentity::generate(&mut OsRng);
    let msg = outbound_to(
        DestinationHash::new([0x0E; 16]),
        &sender,
        DeliveryMethod::Propagated,
    );
    bed.router.enqueue_outbound(msg, 0).expect("enqueue");

    // First pass: no node link yet, establishment starts.
    bed.router.tick_at(0);
    assert_eq!(bed.transport.link_attempts.lock().expect("attempts").len(), 1);

    let link = Arc::new(StubLink::new(33, node_dest, true));
    bed.router.handle_event(
        TransportEvent::LinkEstablished {
            link: Arc::clone(&link),
        },
        1_000,
    );

    // Nudged onto the fresh link as msgpack([timebase, [packed]]).
    let resources = link.sent_resources.lock().expect("resources");
    assert_eq!(resources.len(), 1);
    let (resource_id, payload) = resources[0].clone();
    drop(resources);
    let decoded: rmpv::Value =
        rmpv::decode::read_value(&mut payload.as_slice()).expect("decode");
    let elements = decoded.as_array().expect("array");
    assert!(elements[0].as_f64().is_some());
    assert_eq!(elements[1].as_array().expect("messages").len(), 1);

    // Conclusion is terminal for propagated sends: no delivery receipt.
    bed.router.handle_event(
        TransportEvent::ResourceConcluded {
            resource_id,
            success: true,
        },
        2_000,
    );
    bed.router.tick_at(3_000);
    assert_eq!(bed.router.outbound_len(), 0);
    assert_eq!(bed.failed.load(Ordering::SeqCst), 0);
    assert_eq!(bed.delivered.load(Ordering::SeqCst), 0);
}
