//! Parallel proof-of-work stamp search.

use crate::constants::STAMP_LENGTH;
use crate::stamp::stamp_valid;
use rand_core::{OsRng, RngCore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Candidates tested between cancellation checks.
const YIELD_EVERY: usize = 1_000;
/// Upper bound on worker threads regardless of core count.
const MAX_WORKERS: usize = 8;

/// CPU-bound stamp finder. One search runs at a time; the router's deferred
/// stamp worker serializes calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stamper;

impl Stamper {
    pub fn new() -> Self {
        Self
    }

    fn worker_count() -> usize {
        thread::available_parallelism()
            .map(|cores| cores.get())
            .unwrap_or(1)
            .min(MAX_WORKERS)
    }

    /// Search for a stamp clearing `target_cost` over `workblock`.
    ///
    /// Workers draw random candidates from the OS RNG; the first hit wins a
    /// shared slot and the remaining workers observe it and stop. Returns
    /// `None` when `cancel` is raised before a hit.
    pub fn generate_stamp(
        &self,
        workblock: &[u8],
        target_cost: u32,
        cancel: &AtomicBool,
    ) -> Option<[u8; STAMP_LENGTH]> {
        let found: Arc<Mutex<Option<[u8; STAMP_LENGTH]>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));

        thread::scope(|scope| {
            for _ in 0..Self::worker_count() {
                let found = Arc::clone(&found);
                let done = Arc::clone(&done);
                scope.spawn(move || {
                    let mut candidate = [0u8; STAMP_LENGTH];
                    loop {
                        for _ in 0..YIELD_EVERY {
                            OsRng.fill_bytes(&mut candidate);
                            if stamp_valid(&candidate, target_cost, workblock) {
                                if let Ok(mut slot) = found.lock() {
                                    if slot.is_none() {
                                        *slot = Some(candidate);
                                    }
                                }
                                done.store(true, Ordering::SeqCst);
                                return;
                            }
                        }
                        if done.load(Ordering::SeqCst) || cancel.load(Ordering::SeqCst) {
                            return;
                        }
                        thread::yield_now();
                    }
                });
            }
        });

        let result = found.lock().ok().and_then(|slot| *slot);
        result
    }
}
