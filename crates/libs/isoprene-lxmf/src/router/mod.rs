//! Delivery router: owns every outbound message's lifecycle, funnels all
//! inbound traffic through one validation gate and drives propagation-node
//! interaction.
//!
//! The router core is a synchronous, clock-injected state machine: the tokio
//! worker in [`worker`](crate::router::worker) feeds it ticks and transport
//! events. Every substrate callback reaches the core as a typed
//! `TransportEvent`, never as shared mutable state.

pub mod worker;

use crate::constants::{
    CLEANUP_INTERVAL_TICKS, DELIVERY_RETRY_WAIT_MS, MAX_DELIVERY_ATTEMPTS, MAX_PATHLESS_TRIES,
    PATH_REQUEST_WAIT_MS, PATH_REREQUEST_DELAY_MS, STAMP_COST_EXPIRY_S, STAMP_LENGTH,
    TICKET_LENGTH, TRANSIENT_ID_EXPIRY_S, WORKBLOCK_EXPAND_ROUNDS,
};
use crate::error::LxmfError;
use crate::message::{DeliveryMethod, LxmMessage, MessageState, Representation, UnverifiedReason};
use crate::propagation::{pack_for_node, PropagationClient, PropagationNodeEntry, SyncOutcome};
use crate::stamp::{stamp_valid, stamp_workblock};
use crate::stamper::Stamper;
use crate::storage::RouterStore;
use crate::ticket::TicketStore;
use log::{debug, warn};
use rns_contract::{
    AnnounceKind, DestinationHash, Identity, IdentityStore, Link, LinkId, PrivateIdentity,
    Transport, TransportEvent,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// When set, inbound messages from sources outside the allowed list are
    /// dropped.
    pub auth_required: bool,
}

/// Local inbound endpoint able to receive LXMF messages.
#[derive(Clone)]
pub struct DeliveryDestination {
    pub destination: DestinationHash,
    pub identity: PrivateIdentity,
    pub display_name: Option<String>,
    pub stamp_cost: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub outbound_enqueued_total: usize,
    pub delivered_total: usize,
    pub failed_total: usize,
    pub inbound_processed_total: usize,
    pub inbound_duplicate_total: usize,
    pub inbound_rejected_total: usize,
    pub announces_seen_total: usize,
    pub paper_ingested_total: usize,
    pub paper_duplicate_total: usize,
}

/// One pending proof-of-work search.
#[derive(Debug, Clone)]
pub struct StampJob {
    pub message_id: [u8; 32],
    pub workblock: Vec<u8>,
    pub cost: u32,
}

pub type RouterCallback = Arc<dyn Fn(&LxmMessage) + Send + Sync>;

pub struct Router {
    config: RouterConfig,
    transport: Arc<dyn Transport>,
    identities: Arc<dyn IdentityStore>,
    store: Option<RouterStore>,
    stamper: Stamper,
    stats: RouterStats,

    delivery_destinations: Vec<DeliveryDestination>,
    allowed_destinations: HashSet<DestinationHash>,
    ignored_destinations: HashSet<DestinationHash>,

    outbound: Vec<LxmMessage>,
    failed: Vec<LxmMessage>,
    deferred_stamps: VecDeque<[u8; 32]>,

    links_by_id: HashMap<LinkId, Arc<dyn Link>>,
    direct_links: HashMap<DestinationHash, Arc<dyn Link>>,
    backchannels: HashMap<DestinationHash, Arc<dyn Link>>,
    pending_link_establishments: HashSet<DestinationHash>,

    pending_receipts: HashMap<u64, [u8; 32]>,
    pending_resources: HashMap<u64, ([u8; 32], DeliveryMethod)>,
    pending_path_rerequests: HashMap<DestinationHash, u64>,

    transient_ids: HashMap<[u8; 32], i64>,
    outbound_stamp_costs: HashMap<DestinationHash, (i64, u8)>,
    tickets: TicketStore,

    propagation: PropagationClient,
    propagation_send_link: Option<Arc<dyn Link>>,
    propagation_send_pending: bool,
    propagation_retrieval_pending: bool,

    delivery_callback: Option<RouterCallback>,
    failed_callback: Option<RouterCallback>,

    next_ref_id: u64,
    tick_count: u64,
    dirty_transients: bool,
    dirty_costs: bool,
    dirty_tickets: bool,
}

impl Router {
    pub fn new(transport: Arc<dyn Transport>, identities: Arc<dyn IdentityStore>) -> Self {
        Self::with_config(transport, identities, RouterConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        identities: Arc<dyn IdentityStore>,
        config: RouterConfig,
    ) -> Self {
        Self {
            config,
            transport,
            identities,
            store: None,
            stamper: Stamper::new(),
            stats: RouterStats::default(),
            delivery_destinations: Vec::new(),
            allowed_destinations: HashSet::new(),
            ignored_destinations: HashSet::new(),
            outbound: Vec::new(),
            failed: Vec::new(),
            deferred_stamps: VecDeque::new(),
            links_by_id: HashMap::new(),
            direct_links: HashMap::new(),
            backchannels: HashMap::new(),
            pending_link_establishments: HashSet::new(),
            pending_receipts: HashMap::new(),
            pending_resources: HashMap::new(),
            pending_path_rerequests: HashMap::new(),
            transient_ids: HashMap::new(),
            outbound_stamp_costs: HashMap::new(),
            tickets: TicketStore::new(),
            propagation: PropagationClient::new(),
            propagation_send_link: None,
            propagation_send_pending: false,
            propagation_retrieval_pending: false,
            delivery_callback: None,
            failed_callback: None,
            next_ref_id: 0,
            tick_count: 0,
            dirty_transients: false,
            dirty_costs: false,
            dirty_tickets: false,
        }
    }

    /// Attach persistent storage and load the durable caches.
    pub fn with_store(mut self, store: RouterStore) -> Result<Self, LxmfError> {
        self.transient_ids = store.load_local_deliveries()?;
        self.outbound_stamp_costs = store.load_stamp_costs()?;
        self.tickets = TicketStore::restore(store.load_tickets()?);
        self.store = Some(store);
        Ok(self)
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn set_delivery_callback(&mut self, callback: RouterCallback) {
        self.delivery_callback = Some(callback);
    }

    pub fn set_failed_callback(&mut self, callback: RouterCallback) {
        self.failed_callback = Some(callback);
    }

    /// Register a local delivery endpoint. `stamp_cost` must lie in 1..=254.
    pub fn register_delivery_identity(
        &mut self,
        identity: PrivateIdentity,
        display_name: Option<String>,
        stamp_cost: Option<u8>,
    ) -> Result<DestinationHash, LxmfError> {
        if let Some(cost) = stamp_cost {
            if cost == 0 || cost == 255 {
                return Err(LxmfError::InvalidArgument(format!(
                    "stamp cost {cost} outside 1..=254"
                )));
            }
        }
        let destination = identity.destination_hash();
        self.identities.remember(&identity.public());
        self.delivery_destinations.push(DeliveryDestination {
            destination,
            identity,
            display_name,
            stamp_cost,
        });
        Ok(destination)
    }

    pub fn delivery_destination(
        &self,
        destination: &DestinationHash,
    ) -> Option<&DeliveryDestination> {
        self.delivery_destinations
            .iter()
            .find(|d| &d.destination == destination)
    }

    /// Announce a local delivery destination:
    /// `msgpack([display_name?, stamp_cost?])`.
    pub fn announce_delivery(&self, destination: &DestinationHash) -> Result<(), LxmfError> {
        let dest = self
            .delivery_destination(destination)
            .ok_or_else(|| LxmfError::InvalidArgument("unknown delivery destination".into()))?;
        let app_data =
            delivery_announce_app_data(dest.display_name.as_deref(), dest.stamp_cost)?;
        self.transport.announce(destination, &app_data)?;
        Ok(())
    }

    pub fn ignore_destination(&mut self, destination: DestinationHash) {
        self.ignored_destinations.insert(destination);
    }

    pub fn unignore_destination(&mut self, destination: &DestinationHash) {
        self.ignored_destinations.remove(destination);
    }

    pub fn allow_destination(&mut self, destination: DestinationHash) {
        self.allowed_destinations.insert(destination);
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn failed_messages(&self) -> &[LxmMessage] {
        &self.failed
    }

    pub fn propagation_client(&self) -> &PropagationClient {
        &self.propagation
    }

    /// Reply backchannel cached for `destination`, if an identified inbound
    /// link exists. Never used for originated sends.
    pub fn backchannel_for(&self, destination: &DestinationHash) -> Option<Arc<dyn Link>> {
        self.backchannels.get(destination).cloned()
    }

    fn next_ref(&mut self) -> u64 {
        self.next_ref_id += 1;
        self.next_ref_id
    }

    /// Enrich and enqueue an outbound message.
    ///
    /// Attaches a held reply ticket, resolves the stamp cost from the
    /// announce cache, seals the wire form and either packs immediately or
    /// parks the message for the deferred stamp worker.
    pub fn enqueue_outbound(
        &mut self,
        mut msg: LxmMessage,
        now_ms: u64,
    ) -> Result<(), LxmfError> {
        let now_s = (now_ms / 1_000) as i64;

        if let Some(cost) = msg.stamp_cost {
            if cost == 0 || cost == 255 {
                return Err(LxmfError::InvalidArgument(format!(
                    "stamp cost {cost} outside 1..=254"
                )));
            }
        }

        // Embed a ticket the recipient can use for a PoW-free reply.
        if msg.include_ticket {
            if let Some(ticket) = self.tickets.issue(msg.destination_hash, now_s) {
                msg.fields.set_ticket(ticket.expires_epoch_s, ticket.token);
                self.dirty_tickets = true;
            }
        }

        // A ticket the recipient granted us bypasses their stamp requirement.
        if let Some(ticket) = self.tickets.outbound_ticket(&msg.destination_hash, now_s) {
            msg.outbound_ticket = Some(ticket.token);
            msg.defer_stamp = false;
        }

        if msg.stamp_cost.is_none() {
            if let Some((_, cost)) = self.outbound_stamp_costs.get(&msg.destination_hash) {
                msg.stamp_cost = Some(*cost);
            }
        }

        msg.seal(now_ms as f64 / 1_000.0)?;

        if msg.needs_stamp() {
            if msg.defer_stamp {
                if let Some(message_id) = msg.message_id() {
                    self.deferred_stamps.push_back(message_id);
                }
            } else if let Some(job) = stamp_job_for(&msg) {
                let cancel = AtomicBool::new(false);
                if let Some(stamp) =
                    self.stamper
                        .generate_stamp(&job.workblock, job.cost, &cancel)
                {
                    msg.set_stamp(stamp);
                }
            }
        }

        if !msg.needs_stamp() {
            msg.pack()?;
        }

        self.stats.outbound_enqueued_total += 1;
        self.outbound.push(msg);
        Ok(())
    }

    /// Pop the next deferred proof-of-work job, if any message still waits.
    pub fn next_stamp_job(&mut self) -> Option<StampJob> {
        while let Some(message_id) = self.deferred_stamps.pop_front() {
            let waiting = self.outbound.iter().any(|msg| {
                msg.message_id() == Some(message_id)
                    && msg.state() == MessageState::Generating
                    && msg.needs_stamp()
            });
            if !waiting {
                continue;
            }
            let msg = self
                .outbound
                .iter()
                .find(|msg| msg.message_id() == Some(message_id))?;
            let job = stamp_job_for(msg)?;
            return Some(job);
        }
        None
    }

    /// Apply the result of a deferred stamp search. A `None` stamp re-queues
    /// nothing: the search was cancelled and the message stays parked.
    pub fn apply_stamp(&mut self, message_id: [u8; 32], stamp: Option<[u8; STAMP_LENGTH]>) {
        let Some(msg) = self
            .outbound
            .iter_mut()
            .find(|msg| msg.message_id() == Some(message_id))
        else {
            return;
        };
        let Some(stamp) = stamp else {
            return;
        };
        msg.set_stamp(stamp);
        if let Err(err) = msg.pack() {
            debug!("pack after deferred stamp failed: {err}");
            msg.transition(MessageState::Failed);
        }
    }

    /// Cancel an outbound message by transient or message id.
    pub fn cancel_outbound(&mut self, id: &[u8; 32]) -> bool {
        for msg in &mut self.outbound {
            if msg.transient_id() == Some(*id) || msg.message_id() == Some(*id) {
                return msg.transition(MessageState::Cancelled);
            }
        }
        false
    }

    /// One pass of the outbound loop.
    pub fn tick_at(&mut self, now_ms: u64) {
        self.tick_count += 1;
        let now_s = (now_ms / 1_000) as i64;

        let due: Vec<DestinationHash> = self
            .pending_path_rerequests
            .iter()
            .filter(|(_, due)| **due <= now_ms)
            .map(|(dest, _)| *dest)
            .collect();
        for dest in due {
            self.pending_path_rerequests.remove(&dest);
            self.transport.request_path(&dest);
        }

        for idx in 0..self.outbound.len() {
            let ready = {
                let msg = &self.outbound[idx];
                msg.state() == MessageState::Outbound && now_ms >= msg.next_delivery_attempt_ms
            };
            if ready {
                self.dispatch(idx, now_ms);
            }
        }

        self.drain_terminal();

        if self.tick_count % CLEANUP_INTERVAL_TICKS == 0 {
            self.cleanup_at(now_s);
        }
    }

    fn dispatch(&mut self, idx: usize, now_ms: u64) {
        match self.outbound[idx].desired_method {
            DeliveryMethod::Opportunistic => self.dispatch_opportunistic(idx, now_ms),
            DeliveryMethod::Direct => self.dispatch_direct(idx, now_ms),
            DeliveryMethod::Propagated => self.dispatch_propagated(idx, now_ms),
            DeliveryMethod::Paper => {
                // No network send path; the caller extracts the URI.
                self.outbound[idx].transition(MessageState::Sent);
            }
        }
    }

    fn dispatch_opportunistic(&mut self, idx: usize, now_ms: u64) {
        let destination = self.outbound[idx].destination_hash;
        let attempts = self.outbound[idx].delivery_attempts;

        if attempts >= MAX_DELIVERY_ATTEMPTS {
            self.outbound[idx].transition(MessageState::Failed);
            return;
        }

        if !self.transport.has_path(&destination) && attempts < MAX_PATHLESS_TRIES {
            self.transport.request_path(&destination);
            self.outbound[idx].register_attempt(now_ms + PATH_REQUEST_WAIT_MS);
            return;
        }

        // A path that survived earlier failed attempts is suspect: expire it
        // and look again shortly.
        if attempts == MAX_PATHLESS_TRIES + 1 && self.transport.has_path(&destination) {
            self.transport.expire_path(&destination);
            self.pending_path_rerequests
                .insert(destination, now_ms + PATH_REREQUEST_DELAY_MS);
            self.outbound[idx].register_attempt(now_ms + PATH_REQUEST_WAIT_MS);
            return;
        }

        let Some(payload) = self.outbound[idx]
            .packed_for_opportunistic()
            .map(<[u8]>::to_vec)
        else {
            self.outbound[idx].transition(MessageState::Failed);
            return;
        };
        let receipt_id = self.next_ref();
        self.outbound[idx].register_attempt(now_ms + DELIVERY_RETRY_WAIT_MS);
        match self
            .transport
            .send_opportunistic(&destination, &payload, receipt_id)
        {
            Ok(()) => {
                if let Some(transient_id) = self.outbound[idx].transient_id() {
                    self.pending_receipts.insert(receipt_id, transient_id);
                }
                self.outbound[idx].transition(MessageState::Sent);
            }
            Err(err) => {
                debug!("opportunistic send to {destination} deferred: {err}");
            }
        }
    }

    fn dispatch_direct(&mut self, idx: usize, now_ms: u64) {
        let destination = self.outbound[idx].destination_hash;
        if self.outbound[idx].delivery_attempts >= MAX_DELIVERY_ATTEMPTS {
            self.outbound[idx].transition(MessageState::Failed);
            return;
        }

        // Only links we originated are valid for originating sends; a
        // backchannel's remote end may have no receive handlers configured.
        let link = self.direct_links.get(&destination).cloned();
        match link {
            Some(link) if link.status() == rns_contract::LinkStatus::Active => {
                self.send_on_link(idx, &link, now_ms);
            }
            Some(link) if link.status() == rns_contract::LinkStatus::Pending => {
                // Establishment still in flight.
            }
            Some(link) => {
                self.links_by_id.remove(&link.link_id());
                self.direct_links.remove(&destination);
                self.establish_direct(destination, idx, now_ms);
            }
            None => {
                self.establish_direct(destination, idx, now_ms);
            }
        }
    }

    fn send_on_link(&mut self, idx: usize, link: &Arc<dyn Link>, now_ms: u64) {
        let Some(packed) = self.outbound[idx].packed().map(<[u8]>::to_vec) else {
            self.outbound[idx].transition(MessageState::Failed);
            return;
        };
        let transient_id = self.outbound[idx].transient_id();

        if self.outbound[idx].representation == Representation::Packet {
            let receipt_id = self.next_ref();
            self.outbound[idx].register_attempt(now_ms + DELIVERY_RETRY_WAIT_MS);
            // Full packed bytes, destination hash included: the receiver
            // decodes identically to the opportunistic path.
            match link.send(&packed, receipt_id) {
                Ok(()) => {
                    if let Some(transient_id) = transient_id {
                        self.pending_receipts.insert(receipt_id, transient_id);
                    }
                    self.outbound[idx].transition(MessageState::Sent);
                }
                Err(err) => {
                    debug!("direct send deferred: {err}");
                }
            }
        } else {
            let resource_id = self.next_ref();
            self.outbound[idx].register_attempt(now_ms + DELIVERY_RETRY_WAIT_MS);
            match link.send_resource(resource_id, &packed) {
                Ok(()) => {
                    if let Some(transient_id) = transient_id {
                        self.pending_resources
                            .insert(resource_id, (transient_id, DeliveryMethod::Direct));
                    }
                    self.outbound[idx].transition(MessageState::Sending);
                }
                Err(err) => {
                    debug!("direct resource start deferred: {err}");
                }
            }
        }
    }

    fn establish_direct(&mut self, destination: DestinationHash, idx: usize, now_ms: u64) {
        self.outbound[idx].register_attempt(now_ms + DELIVERY_RETRY_WAIT_MS);
        if self.pending_link_establishments.contains(&destination) {
            return;
        }
        self.pending_link_establishments.insert(destination);
        if let Err(err) = self.transport.establish_link(&destination) {
            debug!("link establishment to {destination} failed: {err}");
            self.pending_link_establishments.remove(&destination);
        }
    }

    fn dispatch_propagated(&mut self, idx: usize, now_ms: u64) {
        let now_s = (now_ms / 1_000) as i64;
        let Some(node_destination) = self.propagation.active_node().map(|n| n.destination)
        else {
            if self.outbound[idx].delivery_attempts >= MAX_DELIVERY_ATTEMPTS {
                self.outbound[idx].transition(MessageState::Failed);
            } else {
                self.outbound[idx].register_attempt(now_ms + DELIVERY_RETRY_WAIT_MS);
            }
            return;
        };

        match self.propagation_send_link.clone() {
            Some(link) if link.status() == rns_contract::LinkStatus::Active => {
                if self.outbound[idx].state() == MessageState::Sending {
                    return;
                }
                let Some(packed) = self.outbound[idx].packed().map(<[u8]>::to_vec) else {
                    self.outbound[idx].transition(MessageState::Failed);
                    return;
                };
                let payload = match pack_for_node(now_s as f64, &packed) {
                    Ok(payload) => payload,
                    Err(err) => {
                        debug!("propagation wrap failed: {err}");
                        self.outbound[idx].transition(MessageState::Failed);
                        return;
                    }
                };
                let resource_id = self.next_ref();
                self.outbound[idx].register_attempt(now_ms + DELIVERY_RETRY_WAIT_MS);
                match link.send_resource(resource_id, &payload) {
                    Ok(()) => {
                        if let Some(transient_id) = self.outbound[idx].transient_id() {
                            self.pending_resources
                                .insert(resource_id, (transient_id, DeliveryMethod::Propagated));
                        }
                        self.outbound[idx].transition(MessageState::Sending);
                    }
                    Err(err) => {
                        debug!("propagation resource start deferred: {err}");
                    }
                }
            }
            Some(link) if link.status() == rns_contract::LinkStatus::Pending => {}
            Some(_) => {
                self.propagation_send_link = None;
            }
            None => {
                if self.outbound[idx].delivery_attempts >= MAX_DELIVERY_ATTEMPTS {
                    self.outbound[idx].transition(MessageState::Failed);
                    return;
                }
                self.outbound[idx].register_attempt(now_ms + DELIVERY_RETRY_WAIT_MS);
                if !self.propagation_send_pending {
                    self.propagation_send_pending = true;
                    if let Err(err) = self.transport.establish_link(&node_destination) {
                        debug!("propagation link establishment failed: {err}");
                        self.propagation_send_pending = false;
                    }
                }
            }
        }
    }

    fn drain_terminal(&mut self) {
        let mut idx = 0;
        while idx < self.outbound.len() {
            let state = self.outbound[idx].state();
            let method = self.outbound[idx].method;
            let finished = match state {
                MessageState::Delivered => true,
                MessageState::Sent => matches!(
                    method,
                    DeliveryMethod::Propagated | DeliveryMethod::Paper
                ),
                MessageState::Cancelled | MessageState::Rejected | MessageState::Failed => true,
                _ => false,
            };
            if !finished {
                idx += 1;
                continue;
            }

            let msg = self.outbound.remove(idx);
            match msg.state() {
                MessageState::Cancelled | MessageState::Rejected => {
                    self.notify_failed(&msg);
                }
                MessageState::Failed => {
                    self.stats.failed_total += 1;
                    self.notify_failed(&msg);
                    self.failed.push(msg);
                }
                _ => {}
            }
        }
    }

    fn notify_failed(&self, msg: &LxmMessage) {
        if let Some(callback) = &self.failed_callback {
            callback(msg);
        }
        if let Some(callback) = &msg.on_failed {
            callback(msg);
        }
    }

    fn notify_delivered(&mut self, transient_id: [u8; 32]) {
        let Some(msg) = self
            .outbound
            .iter_mut()
            .find(|msg| msg.transient_id() == Some(transient_id))
        else {
            return;
        };
        if !msg.transition(MessageState::Delivered) {
            return;
        }
        msg.progress = 1.0;
        self.stats.delivered_total += 1;
        let snapshot = msg.clone();
        if let Some(callback) = &self.delivery_callback {
            callback(&snapshot);
        }
        if let Some(callback) = &snapshot.on_delivered {
            callback(&snapshot);
        }
    }

    /// Bring dispatch forward for pending messages to `destination`.
    fn nudge_destination(&mut self, destination: DestinationHash, now_ms: u64) {
        for idx in 0..self.outbound.len() {
            let matches = {
                let msg = &self.outbound[idx];
                msg.destination_hash == destination && msg.state() == MessageState::Outbound
            };
            if matches {
                self.outbound[idx].next_delivery_attempt_ms = now_ms;
                self.dispatch(idx, now_ms);
            }
        }
    }

    /// Bring dispatch forward for every pending propagated message; their
    /// destination is the final recipient, not the node the link points at.
    fn nudge_propagated(&mut self, now_ms: u64) {
        for idx in 0..self.outbound.len() {
            let matches = {
                let msg = &self.outbound[idx];
                msg.desired_method == DeliveryMethod::Propagated
                    && msg.state() == MessageState::Outbound
            };
            if matches {
                self.outbound[idx].next_delivery_attempt_ms = now_ms;
                self.dispatch(idx, now_ms);
            }
        }
    }

    /// Feed one substrate event into the router.
    pub fn handle_event(&mut self, event: TransportEvent, now_ms: u64) {
        let now_s = (now_ms / 1_000) as i64;
        match event {
            TransportEvent::PacketInbound {
                destination,
                payload,
            } => {
                // Opportunistic payloads arrive without the leading
                // destination hash; restore the uniform wire form.
                let mut raw =
                    Vec::with_capacity(destination.as_slice().len() + payload.len());
                raw.extend_from_slice(destination.as_slice());
                raw.extend_from_slice(&payload);
                self.process_inbound(&raw, DeliveryMethod::Opportunistic, None, now_ms);
            }
            TransportEvent::LinkEstablished { link } => {
                self.on_link_established(link, now_ms);
            }
            TransportEvent::LinkClosed {
                link_id,
                destination,
            } => {
                self.on_link_closed(link_id, destination, now_ms);
            }
            TransportEvent::LinkPacket { link_id, payload } => {
                self.process_inbound(&payload, DeliveryMethod::Direct, Some(link_id), now_ms);
            }
            TransportEvent::LinkResource { link_id, payload } => {
                self.process_inbound(&payload, DeliveryMethod::Direct, Some(link_id), now_ms);
            }
            TransportEvent::ReceiptDelivered { receipt_id } => {
                if let Some(transient_id) = self.pending_receipts.remove(&receipt_id) {
                    self.notify_delivered(transient_id);
                }
            }
            TransportEvent::ReceiptTimeout { receipt_id } => {
                if let Some(transient_id) = self.pending_receipts.remove(&receipt_id) {
                    if let Some(msg) = self
                        .outbound
                        .iter_mut()
                        .find(|msg| msg.transient_id() == Some(transient_id))
                    {
                        msg.transition(MessageState::Failed);
                    }
                }
            }
            TransportEvent::ResourceProgress {
                resource_id,
                progress,
            } => {
                if let Some((transient_id, _)) = self.pending_resources.get(&resource_id) {
                    let transient_id = *transient_id;
                    if let Some(msg) = self
                        .outbound
                        .iter_mut()
                        .find(|msg| msg.transient_id() == Some(transient_id))
                    {
                        msg.progress = progress.clamp(0.0, 1.0);
                    }
                }
            }
            TransportEvent::ResourceConcluded {
                resource_id,
                success,
            } => {
                self.on_resource_concluded(resource_id, success, now_ms);
            }
            TransportEvent::RequestResponse {
                link_id: _,
                request_id,
                response,
            } => {
                self.on_request_response(request_id, &response, now_ms);
            }
            TransportEvent::RequestFailed {
                link_id: _,
                request_id,
            } => {
                self.propagation.on_request_failed(request_id);
            }
            TransportEvent::AnnounceReceived {
                kind,
                destination,
                identity,
                app_data,
            } => {
                self.on_announce(kind, destination, identity, &app_data, now_ms, now_s);
            }
        }
    }

    fn on_link_established(&mut self, link: Arc<dyn Link>, now_ms: u64) {
        let destination = link.destination();
        self.links_by_id.insert(link.link_id(), link.clone());
        link.set_resource_acceptance(true);

        if !link.is_outgoing() {
            return;
        }

        // Identify so the remote can cache our LXMF identity for
        // backchannel replies.
        if let Some(first) = self.delivery_destinations.first() {
            if let Err(err) = link.identify(&first.identity) {
                debug!("link identify failed: {err}");
            }
        }
        self.pending_link_establishments.remove(&destination);

        let node_destination = self.propagation.active_node().map(|n| n.destination);
        if node_destination == Some(destination)
            && (self.propagation_retrieval_pending || self.propagation_send_pending)
        {
            if self.propagation_retrieval_pending {
                self.propagation_retrieval_pending = false;
                let request_id = self.next_ref();
                if let Err(err) =
                    self.propagation.on_link_established(Arc::clone(&link), request_id)
                {
                    debug!("propagation list request failed: {err}");
                }
            }
            // One node link serves uploads too.
            if self.propagation_send_pending {
                self.propagation_send_pending = false;
                self.propagation_send_link = Some(link);
                self.nudge_propagated(now_ms);
            }
            return;
        }

        self.direct_links.insert(destination, link);
        self.nudge_destination(destination, now_ms);
    }

    fn on_link_closed(&mut self, link_id: LinkId, destination: DestinationHash, now_ms: u64) {
        self.links_by_id.remove(&link_id);
        if self
            .direct_links
            .get(&destination)
            .map(|l| l.link_id() == link_id)
            .unwrap_or(false)
        {
            self.direct_links.remove(&destination);
        }
        if self
            .backchannels
            .get(&destination)
            .map(|l| l.link_id() == link_id)
            .unwrap_or(false)
        {
            self.backchannels.remove(&destination);
        }
        let was_propagation_link = self
            .propagation_send_link
            .as_ref()
            .map(|l| l.link_id() == link_id)
            .unwrap_or(false);
        if was_propagation_link {
            self.propagation_send_link = None;
        }
        self.pending_link_establishments.remove(&destination);
        self.propagation.on_link_closed(link_id);

        // Anything mid-send on this link goes back to the queue with backoff.
        let mut reset_transients = Vec::new();
        for msg in &mut self.outbound {
            let on_this_link = msg.destination_hash == destination
                || (was_propagation_link
                    && msg.desired_method == DeliveryMethod::Propagated);
            if on_this_link && msg.state() == MessageState::Sending {
                msg.transition(MessageState::Outbound);
                msg.next_delivery_attempt_ms = now_ms + DELIVERY_RETRY_WAIT_MS;
                if let Some(transient_id) = msg.transient_id() {
                    reset_transients.push(transient_id);
                }
            }
        }
        self.pending_resources
            .retain(|_, (transient_id, _)| !reset_transients.contains(transient_id));
    }

    fn on_resource_concluded(&mut self, resource_id: u64, success: bool, now_ms: u64) {
        let Some((transient_id, method)) = self.pending_resources.remove(&resource_id) else {
            return;
        };
        if success {
            match method {
                DeliveryMethod::Direct => self.notify_delivered(transient_id),
                _ => {
                    if let Some(msg) = self
                        .outbound
                        .iter_mut()
                        .find(|msg| msg.transient_id() == Some(transient_id))
                    {
                        msg.progress = 1.0;
                        msg.transition(MessageState::Sent);
                    }
                }
            }
        } else if let Some(msg) = self
            .outbound
            .iter_mut()
            .find(|msg| msg.transient_id() == Some(transient_id))
        {
            msg.transition(MessageState::Outbound);
            msg.next_delivery_attempt_ms = now_ms + DELIVERY_RETRY_WAIT_MS;
        }
    }

    fn on_request_response(&mut self, request_id: u64, response: &[u8], now_ms: u64) {
        if !self.propagation.owns_request(request_id) {
            return;
        }
        let get_request_id = self.next_ref();
        let known: HashSet<[u8; 32]> = self.transient_ids.keys().copied().collect();
        let outcome = self.propagation.on_request_response(
            request_id,
            response,
            &|id: &[u8]| {
                <[u8; 32]>::try_from(id)
                    .map(|id| known.contains(&id))
                    .unwrap_or(false)
            },
            get_request_id,
        );
        match outcome {
            SyncOutcome::Messages(messages) => {
                for payload in messages {
                    self.process_inbound(
                        &payload,
                        DeliveryMethod::Propagated,
                        None,
                        now_ms,
                    );
                }
            }
            SyncOutcome::Failed(code) => {
                debug!("propagation sync failed, remote code {code:?}");
            }
            SyncOutcome::Pending | SyncOutcome::Complete(_) | SyncOutcome::Unrelated => {}
        }
    }

    fn on_announce(
        &mut self,
        kind: AnnounceKind,
        destination: DestinationHash,
        identity: Identity,
        app_data: &[u8],
        now_ms: u64,
        now_s: i64,
    ) {
        self.stats.announces_seen_total += 1;
        self.identities.remember(&identity);
        match kind {
            AnnounceKind::Delivery => {
                match parse_delivery_announce(app_data) {
                    Ok((_, Some(cost))) => {
                        self.outbound_stamp_costs.insert(destination, (now_s, cost));
                        self.dirty_costs = true;
                    }
                    Ok((_, None)) => {}
                    Err(err) => {
                        debug!("malformed delivery announce from {destination}: {err}");
                        return;
                    }
                }
                self.nudge_destination(destination, now_ms);
            }
            AnnounceKind::PropagationNode => {
                match PropagationNodeEntry::from_announce(destination, identity, app_data, now_s)
                {
                    Ok(entry) => self.propagation.update_node(entry),
                    Err(err) => {
                        debug!("malformed propagation announce from {destination}: {err}")
                    }
                }
            }
        }
    }

    /// The single inbound validation gate.
    ///
    /// Returns `true` when the message reached the delivery callback.
    pub fn process_inbound(
        &mut self,
        raw: &[u8],
        method: DeliveryMethod,
        link_id: Option<LinkId>,
        now_ms: u64,
    ) -> bool {
        let now_s = (now_ms / 1_000) as i64;

        let mut msg = match LxmMessage::from_bytes(raw, self.identities.as_ref()) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("inbound unpack failed: {err}");
                return false;
            }
        };
        msg.method = method;

        let Some(transient_id) = msg.transient_id() else {
            return false;
        };
        if self.transient_ids.contains_key(&transient_id) {
            self.stats.inbound_duplicate_total += 1;
            if method == DeliveryMethod::Paper {
                self.stats.paper_duplicate_total += 1;
            }
            return false;
        }

        if msg.unverified_reason == Some(UnverifiedReason::SignatureInvalid) {
            debug!("dropping inbound with invalid signature from {}", msg.source_hash);
            self.stats.inbound_rejected_total += 1;
            return false;
        }

        if self.ignored_destinations.contains(&msg.source_hash) {
            debug!("dropping inbound from ignored source {}", msg.source_hash);
            return false;
        }
        if self.config.auth_required && !self.allowed_destinations.contains(&msg.source_hash) {
            debug!("dropping unauthorized inbound from {}", msg.source_hash);
            self.stats.inbound_rejected_total += 1;
            return false;
        }

        // Harvest a granted reply ticket before any stamp decision so future
        // sends can bypass the peer's PoW requirement.
        if msg.signature_validated {
            if let Some((expires, token)) = msg.fields.ticket() {
                if self
                    .tickets
                    .store_outbound(msg.source_hash, expires, token, now_s)
                {
                    self.dirty_tickets = true;
                }
            }
        }

        let required_cost = self
            .delivery_destination(&msg.destination_hash)
            .and_then(|dest| dest.stamp_cost);
        if let Some(required_cost) = required_cost {
            if !self.stamp_satisfied(&msg, required_cost, now_s) {
                if method == DeliveryMethod::Paper {
                    warn!(
                        "accepting paper message {} with unsatisfied stamp",
                        hex::encode(transient_id)
                    );
                } else {
                    debug!(
                        "rejecting inbound {} without valid stamp",
                        hex::encode(transient_id)
                    );
                    self.stats.inbound_rejected_total += 1;
                    return false;
                }
            }
        }

        // A link whose proven identity matches the source is a usable reply
        // backchannel.
        if let Some(link_id) = link_id {
            if let Some(link) = self.links_by_id.get(&link_id).cloned() {
                if let Some(identity) = link.remote_identity() {
                    if identity.destination_hash() == msg.source_hash {
                        self.identities.remember(&identity);
                        self.backchannels.insert(msg.source_hash, link);
                    }
                }
            }
        }

        self.transient_ids.insert(transient_id, now_s);
        self.dirty_transients = true;
        self.stats.inbound_processed_total += 1;
        if method == DeliveryMethod::Paper {
            self.stats.paper_ingested_total += 1;
        }

        msg.transition(MessageState::Delivered);
        if let Some(callback) = &self.delivery_callback {
            callback(&msg);
        }
        true
    }

    fn stamp_satisfied(&self, msg: &LxmMessage, required_cost: u8, now_s: i64) -> bool {
        let Some(slot) = msg.wire_stamp() else {
            return false;
        };

        // A token we issued substitutes for the full stamp.
        if slot.len() == TICKET_LENGTH
            && self.tickets.validate(&msg.source_hash, slot, now_s)
        {
            return true;
        }

        if slot.len() != STAMP_LENGTH {
            return false;
        }
        let Some(message_id) = msg.message_id() else {
            return false;
        };
        let workblock = stamp_workblock(&message_id, WORKBLOCK_EXPAND_ROUNDS);
        stamp_valid(slot, required_cost as u32, &workblock)
    }

    /// Ingest an `lxm://` paper URI. Returns `true` on first ingestion,
    /// `false` for duplicates.
    pub fn ingest_lxm_uri(&mut self, uri: &str, now_ms: u64) -> Result<bool, LxmfError> {
        let raw = crate::message::WireMessage::decode_lxm_uri(uri)?;
        Ok(self.process_inbound(&raw, DeliveryMethod::Paper, None, now_ms))
    }

    /// Begin a two-stage retrieval from the active propagation node.
    pub fn request_messages_from_propagation_node(
        &mut self,
        _now_ms: u64,
    ) -> Result<(), LxmfError> {
        let request_id = self.next_ref();
        self.propagation
            .begin_sync(self.transport.as_ref(), request_id)?;
        if self.propagation.state() == crate::propagation::PropagationState::LinkEstablishing {
            self.propagation_retrieval_pending = true;
        }
        Ok(())
    }

    /// Periodic cache maintenance: runs every 60 outbound ticks.
    pub fn cleanup_at(&mut self, now_s: i64) {
        let transient_cutoff = now_s - TRANSIENT_ID_EXPIRY_S as i64;
        let before = self.transient_ids.len();
        self.transient_ids.retain(|_, seen| *seen > transient_cutoff);
        if self.transient_ids.len() != before {
            self.dirty_transients = true;
        }

        let cost_cutoff = now_s - STAMP_COST_EXPIRY_S as i64;
        let before = self.outbound_stamp_costs.len();
        self.outbound_stamp_costs
            .retain(|_, (recorded, _)| *recorded > cost_cutoff);
        if self.outbound_stamp_costs.len() != before {
            self.dirty_costs = true;
        }

        self.tickets.sweep(now_s);
        self.dirty_tickets = true;
    }

    /// Write dirty caches to the attached store.
    pub fn persist(&mut self) -> Result<(), LxmfError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if self.dirty_transients {
            store.save_local_deliveries(&self.transient_ids)?;
            self.dirty_transients = false;
        }
        if self.dirty_costs {
            store.save_stamp_costs(&self.outbound_stamp_costs)?;
            self.dirty_costs = false;
        }
        if self.dirty_tickets {
            store.save_tickets(&self.tickets.snapshot())?;
            self.dirty_tickets = false;
        }
        Ok(())
    }

    /// Needs-persist check without touching the store.
    pub fn has_dirty_state(&self) -> bool {
        self.dirty_transients || self.dirty_costs || self.dirty_tickets
    }
}

/// Delivery announce app data: `msgpack([display_name?, stamp_cost?])`.
pub fn delivery_announce_app_data(
    display_name: Option<&str>,
    stamp_cost: Option<u8>,
) -> Result<Vec<u8>, LxmfError> {
    let name = display_name
        .map(|name| rmpv::Value::Binary(name.as_bytes().to_vec()))
        .unwrap_or(rmpv::Value::Nil);
    let cost = stamp_cost
        .map(|cost| rmpv::Value::Integer((cost as u64).into()))
        .unwrap_or(rmpv::Value::Nil);
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &rmpv::Value::Array(vec![name, cost]))
        .map_err(|err| LxmfError::Encode(err.to_string()))?;
    Ok(out)
}

/// Parse delivery announce app data into `(display_name, stamp_cost)`.
pub fn parse_delivery_announce(
    app_data: &[u8],
) -> Result<(Option<String>, Option<u8>), LxmfError> {
    let mut cursor = app_data;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|err| LxmfError::Decode(err.to_string()))?;
    let rmpv::Value::Array(elements) = value else {
        return Err(LxmfError::Decode("announce must be an array".into()));
    };

    let display_name = elements
        .first()
        .and_then(|name| name.as_slice())
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
    let stamp_cost = elements
        .get(1)
        .and_then(|cost| cost.as_u64())
        .and_then(|cost| u8::try_from(cost).ok())
        .filter(|cost| (1..=254).contains(cost));
    Ok((display_name, stamp_cost))
}

fn stamp_job_for(msg: &LxmMessage) -> Option<StampJob> {
    let message_id = msg.message_id()?;
    let cost = msg.stamp_cost? as u32;
    Some(StampJob {
        message_id,
        workblock: stamp_workblock(&message_id, WORKBLOCK_EXPAND_ROUNDS),
        cost,
    })
}
