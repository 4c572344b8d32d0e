//! Tokio driver for the router core: the processing ticker, the transport
//! event loop and the deferred-stamp worker.
//!
//! One proof-of-work search runs at a time, on the blocking pool, and is
//! cancelled on shutdown. Shutdown ordering: stop the loop, cancel the
//! search, persist dirty caches.

use crate::constants::{PROCESSING_INTERVAL_MS, STAMP_LENGTH};
use crate::router::Router;
use crate::stamper::Stamper;
use rns_contract::time::now_epoch_ms;
use rns_contract::TransportEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Running router worker. Dropping the handle leaves the worker running;
/// call [`shutdown`](Self::shutdown) for an orderly stop.
pub struct RouterHandle {
    router: Arc<Mutex<Router>>,
    cancel: CancellationToken,
    stamp_cancel: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl RouterHandle {
    pub fn router(&self) -> Arc<Mutex<Router>> {
        Arc::clone(&self.router)
    }

    pub async fn shutdown(self) {
        self.stamp_cancel.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

fn lock(router: &Arc<Mutex<Router>>) -> MutexGuard<'_, Router> {
    router
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Spawn the router worker on the current tokio runtime.
pub fn spawn(router: Router, events: mpsc::Receiver<TransportEvent>) -> RouterHandle {
    let router = Arc::new(Mutex::new(router));
    let cancel = CancellationToken::new();
    let stamp_cancel = Arc::new(AtomicBool::new(false));

    let join = tokio::spawn(run_loop(
        Arc::clone(&router),
        events,
        cancel.clone(),
        Arc::clone(&stamp_cancel),
    ));

    RouterHandle {
        router,
        cancel,
        stamp_cancel,
        join,
    }
}

async fn run_loop(
    router: Arc<Mutex<Router>>,
    mut events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
    stamp_cancel: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(PROCESSING_INTERVAL_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let (stamp_tx, mut stamp_rx) =
        mpsc::channel::<([u8; 32], Option<[u8; STAMP_LENGTH]>)>(1);
    let mut inflight_stamp: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now_ms = now_epoch_ms();
                let job = {
                    let mut guard = lock(&router);
                    guard.tick_at(now_ms);
                    let idle = inflight_stamp
                        .as_ref()
                        .map(JoinHandle::is_finished)
                        .unwrap_or(true);
                    let job = if idle { guard.next_stamp_job() } else { None };
                    if guard.has_dirty_state() {
                        let _ = guard.persist();
                    }
                    job
                };
                if let Some(job) = job {
                    let tx = stamp_tx.clone();
                    let cancel_flag = Arc::clone(&stamp_cancel);
                    inflight_stamp = Some(tokio::task::spawn_blocking(move || {
                        let stamp = Stamper::new()
                            .generate_stamp(&job.workblock, job.cost, &cancel_flag);
                        let _ = tx.blocking_send((job.message_id, stamp));
                    }));
                }
            }
            Some((message_id, stamp)) = stamp_rx.recv() => {
                let now_ms = now_epoch_ms();
                let mut guard = lock(&router);
                guard.apply_stamp(message_id, stamp);
                guard.tick_at(now_ms);
            }
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let now_ms = now_epoch_ms();
                        lock(&router).handle_event(event, now_ms);
                    }
                    None => break,
                }
            }
        }
    }

    if let Some(handle) = inflight_stamp {
        let _ = handle.await;
    }
    let _ = lock(&router).persist();
}
