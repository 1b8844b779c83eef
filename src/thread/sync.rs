// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives of the thread engine.

use crate::error::SieveError;
use crate::macros::{log_debug, log_error};
use crate::round::RoundCoordinator;
use crate::strike::SENTINEL;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Attempts to set the status to the given value and notifies one waiting
    /// thread.
    ///
    /// Fails if the [`Mutex`] is poisoned.
    pub fn try_notify_one(&self, t: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        *self.mutex.lock()? = t;
        self.condvar.notify_one();
        Ok(())
    }

    /// Sets the status to the given value and notifies all waiting threads.
    ///
    /// The mutex is held until all threads are notified, so that no thread can
    /// observe the new value before the broadcast is sent.
    pub fn notify_all(&self, t: T) {
        let mut guard = self.mutex.lock().unwrap();
        *guard = t;
        self.condvar.notify_all();
        drop(guard);
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

/// Status published to the worker threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Broadcast {
    /// No round was published yet.
    Idle,
    /// The workers need to process a round with the given reference value.
    Round {
        /// Sequence number of the round, starting at 1.
        index: usize,
        /// Reference value whose multiples are struck.
        reference: usize,
    },
    /// The run was aborted and the workers must exit.
    Finished,
}

/// Status of the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CoordinatorStatus {
    /// The coordinator is waiting for the workers to report.
    Waiting,
    /// Every active worker has reported.
    Ready,
}

/// Context shared between the coordinator and the worker threads.
struct SharedContext {
    /// Round published to the workers.
    broadcast: Status<Broadcast>,
    /// Status of the coordinator.
    coordinator_status: Status<CoordinatorStatus>,
    /// Minimum of the values reported in the current round.
    worker_minimum: CachePadded<AtomicUsize>,
    /// Number of reports still expected in the current round.
    pending_reports: CachePadded<AtomicUsize>,
    /// Number of workers that exhausted their slice in the current round.
    num_exhausted: CachePadded<AtomicUsize>,
    /// Number of workers that abandoned the current round without reporting.
    num_failed: CachePadded<AtomicUsize>,
}

/// Creates a [`Coordinator`] paired with `num_workers` [`Participant`]s.
pub fn make_round_group(num_workers: usize) -> (Coordinator, Vec<Participant>) {
    let shared = Arc::new(SharedContext {
        broadcast: Status::new(Broadcast::Idle),
        coordinator_status: Status::new(CoordinatorStatus::Waiting),
        worker_minimum: CachePadded::new(AtomicUsize::new(SENTINEL)),
        pending_reports: CachePadded::new(AtomicUsize::new(0)),
        num_exhausted: CachePadded::new(AtomicUsize::new(0)),
        num_failed: CachePadded::new(AtomicUsize::new(0)),
    });

    let participants = (0..num_workers)
        .map(|_id| Participant {
            #[cfg(feature = "log")]
            id: _id,
            last_round: 0,
            shared: shared.clone(),
        })
        .collect();

    let coordinator = Coordinator {
        active: num_workers,
        round: 0,
        shared,
    };

    (coordinator, participants)
}

/// Lowers `cell` to `value` unless it already holds a smaller value.
fn lower_minimum(cell: &AtomicUsize, value: usize) {
    let mut current = cell.load(Ordering::SeqCst);
    while value < current {
        match cell.compare_exchange_weak(current, value, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

/// Coordinator side of a group of worker threads.
pub struct Coordinator {
    /// Number of workers that haven't exhausted their slice.
    active: usize,
    /// Sequence number of the last published round.
    round: usize,
    /// Context shared with the worker threads.
    shared: Arc<SharedContext>,
}

impl Coordinator {
    /// Notifies the worker threads to exit without waiting for more rounds.
    pub fn finish_workers(&mut self) {
        log_debug!("[coordinator] Notifying workers to finish...");
        self.shared.broadcast.notify_all(Broadcast::Finished);
    }
}

impl RoundCoordinator for Coordinator {
    fn active_workers(&self) -> usize {
        self.active
    }

    fn run_round(&mut self, reference: usize) -> Result<usize, SieveError> {
        let shared = &*self.shared;
        shared.pending_reports.store(self.active, Ordering::SeqCst);
        shared.num_exhausted.store(0, Ordering::SeqCst);
        shared.worker_minimum.store(SENTINEL, Ordering::SeqCst);

        self.round += 1;
        shared.broadcast.notify_all(Broadcast::Round {
            index: self.round,
            reference,
        });

        let mut guard = shared
            .coordinator_status
            .wait_while(|status| *status == CoordinatorStatus::Waiting);
        *guard = CoordinatorStatus::Waiting;
        drop(guard);

        let num_failed = shared.num_failed.load(Ordering::SeqCst);
        if num_failed != 0 {
            log_error!(
                "[coordinator, round {}] {num_failed} worker(s) abandoned the round!",
                self.round
            );
            return Err(SieveError::WorkerAborted { count: num_failed });
        }

        let num_exhausted = shared.num_exhausted.load(Ordering::SeqCst);
        self.active -= num_exhausted;
        Ok(shared.worker_minimum.load(Ordering::SeqCst))
    }
}

/// Worker side of a group of worker threads.
pub struct Participant {
    /// Worker index.
    #[cfg(feature = "log")]
    id: usize,
    /// Sequence number of the last round this worker processed.
    last_round: usize,
    /// Context shared with the coordinator and the other workers.
    shared: Arc<SharedContext>,
}

impl Participant {
    /// Waits until the coordinator publishes a round this worker hasn't
    /// processed yet. Returns [`None`] if the coordinator asked the workers to
    /// finish instead.
    pub fn wait_for_round(&mut self) -> Option<Round> {
        let broadcast = *self.shared.broadcast.wait_while(|broadcast| match broadcast {
            Broadcast::Idle => true,
            Broadcast::Round { index, .. } => *index == self.last_round,
            Broadcast::Finished => false,
        });

        match broadcast {
            Broadcast::Round { index, reference } => {
                self.last_round = index;
                log_debug!(
                    "[worker {}, round {index}] Received reference {reference}",
                    self.id
                );
                Some(Round {
                    #[cfg(feature = "log")]
                    id: self.id,
                    reference,
                    reported: false,
                    shared: self.shared.clone(),
                })
            }
            Broadcast::Finished => {
                log_debug!("[worker {}] Received finish signal", self.id);
                None
            }
            Broadcast::Idle => unreachable!(),
        }
    }

    /// Waits for the next round and abandons it, which makes the coordinator
    /// fail the run.
    pub fn abandon(&mut self) {
        if let Some(round) = self.wait_for_round() {
            drop(round);
        }
    }
}

/// A round in which a worker owes a report to the coordinator.
///
/// The report is delivered by [`report()`](Self::report). If the round is
/// dropped without a report (for example because the worker panicked), the
/// coordinator is still woken up, and fails the run.
pub struct Round {
    /// Worker index.
    #[cfg(feature = "log")]
    id: usize,
    /// Reference value of the round.
    reference: usize,
    /// Whether the worker reported its local minimum.
    reported: bool,
    /// Context shared with the coordinator and the other workers.
    shared: Arc<SharedContext>,
}

impl Round {
    /// Reference value whose multiples are struck in this round.
    pub fn reference(&self) -> usize {
        self.reference
    }

    /// Contributes the worker's local minimum (or [`SENTINEL`] if its slice
    /// is exhausted) to the round.
    pub fn report(mut self, minimum: usize) {
        if minimum == SENTINEL {
            self.shared.num_exhausted.fetch_add(1, Ordering::SeqCst);
        } else {
            lower_minimum(&self.shared.worker_minimum, minimum);
        }
        self.reported = true;
    }
}

impl Drop for Round {
    fn drop(&mut self) {
        if !self.reported {
            if std::thread::panicking() {
                log_error!(
                    "[worker {}] Detected panic in this thread, notifying the coordinator",
                    self.id
                );
            } else {
                log_error!("[worker {}] Abandoning the round", self.id);
            }
            self.shared.num_failed.fetch_add(1, Ordering::SeqCst);
        }

        let pending = self.shared.pending_reports.fetch_sub(1, Ordering::SeqCst);
        assert!(pending > 0);
        if pending == 1 {
            // We're the last worker to report.
            if let Err(e) = self
                .shared
                .coordinator_status
                .try_notify_one(CoordinatorStatus::Ready)
            {
                log_error!(
                    "[worker {}] Failed to notify the coordinator, the mutex was poisoned: {e:?}",
                    self.id
                );
                panic!("Failed to notify the coordinator, the mutex was poisoned: {e:?}");
            }
        }
    }
}
