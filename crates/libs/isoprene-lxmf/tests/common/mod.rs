#![allow(dead_code)]

use lxmf_core::message::{DeliveryMethod, LxmMessage};
use lxmf_core::router::{Router, RouterConfig};
use rns_contract::testing::{MemoryIdentityStore, StubTransport};
use rns_contract::{DestinationHash, IdentityStore, PrivateIdentity};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct TestBed {
    pub transport: Arc<StubTransport>,
    pub identities: Arc<MemoryIdentityStore>,
    pub router: Router,
    pub delivered: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
}

pub fn testbed() -> TestBed {
    testbed_with_config(RouterConfig::default())
}

pub fn testbed_with_config(config: RouterConfig) -> TestBed {
    let transport = Arc::new(StubTransport::new());
    let identities = Arc::new(MemoryIdentityStore::new());
    let transport_dyn: Arc<dyn rns_contract::Transport> = Arc::clone(&transport) as Arc<dyn rns_contract::Transport>;
    let identities_dyn: Arc<dyn IdentityStore> = Arc::clone(&identities) as Arc<dyn IdentityStore>;
    let mut router = Router::with_config(transport_dyn, identities_dyn, config);

    let delivered = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let delivered_clone = Arc::clone(&delivered);
    router.set_delivery_callback(Arc::new(move |_| {
        delivered_clone.fetch_add(1, Ordering::SeqCst);
    }));
    let failed_clone = Arc::clone(&failed);
    router.set_failed_callback(Arc::new(move |_| {
        failed_clone.fetch_add(1, Ordering::SeqCst);
    }));

    TestBed {
        transport,
        identities,
        router,
        delivered,
        failed,
    }
}

/// A packed message from `source` to `destination`, known to the bed's
/// identity store so its signature verifies.
pub fn packed_message(
    bed: &TestBed,
    destination: DestinationHash,
    source: &PrivateIdentity,
    content: &str,
) -> Vec<u8> {
    bed.identities.remember(&source.public());
    let mut msg = LxmMessage::outbound(destination, source.clone(), "test", content);
    msg.seal(1_000.0).expect("seal");
    msg.pack().expect("pack");
    msg.packed().expect("packed").to_vec()
}

/// Propagation-node announce app data in the 7-element wire form.
pub fn propagation_announce_app_data(timebase: i64, active: bool) -> Vec<u8> {
    let value = rmpv::Value::Array(vec![
        rmpv::Value::Boolean(false),
        rmpv::Value::Integer(timebase.into()),
        rmpv::Value::Boolean(active),
        rmpv::Value::Integer(256u64.into()),
        rmpv::Value::Integer(10_240u64.into()),
        rmpv::Value::Array(vec![
            rmpv::Value::Integer(16u64.into()),
            rmpv::Value::Integer(3u64.into()),
            rmpv::Value::Integer(18u64.into()),
        ]),
        rmpv::Value::Map(Vec::new()),
    ]);
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &value).expect("encode announce");
    out
}

pub fn outbound_to(
    destination: DestinationHash,
    source: &PrivateIdentity,
    method: DeliveryMethod,
) -> LxmMessage {
    LxmMessage::outbound(destination, source.clone(), "subject", "body")
        .with_desired_method(method)
}
