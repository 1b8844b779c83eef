// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Thread engine: the round protocol over worker threads of the current
//! process.
//!
//! The composite flags of all slices live in one heap region, split into one
//! exclusively borrowed chunk per worker thread. Reference values are
//! published behind a mutex/condvar pair, and reports are reduced with atomics
//! (see [`sync`]).

mod sync;

use crate::affinity::{pin_worker, CpuPinningPolicy};
use crate::config::{Mode, SieveConfig};
use crate::error::SieveError;
use crate::macros::{log_debug, log_error};
use crate::memory::{HeapMemory, Memory, Role};
use crate::output::{timed, SieveOutcome, WorkerOutput, WorkerTiming};
use crate::partition::Partition;
use crate::round::coordinate;
use crate::strike::{strike, SENTINEL};
use std::thread::ScopedJoinHandle;
use sync::{make_round_group, Participant};

/// Runs the sieve on worker threads.
pub(crate) fn run(config: &SieveConfig, partition: &Partition) -> Result<SieveOutcome, SieveError> {
    let mut composites = HeapMemory.allocate::<bool>(Role::Owner, partition.num_candidates())?;
    let outputs = partition
        .slices()
        .map(|slice| WorkerOutput::new(&config.output_dir, Mode::Thread.file_prefix(), slice))
        .collect::<Vec<_>>();
    let (mut coordinator, participants) = make_round_group(partition.num_jobs());

    let references = std::thread::scope(|scope| {
        let mut handles: Vec<ScopedJoinHandle<'_, Result<WorkerTiming, SieveError>>> =
            Vec::with_capacity(outputs.len());
        let mut rest: &mut [bool] = &mut composites;

        for (output, participant) in outputs.iter().zip(participants) {
            let (flags, tail) = std::mem::take(&mut rest).split_at_mut(output.slice.len);
            rest = tail;
            let worker = Worker {
                output,
                flags,
                participant,
                cpu_pinning: config.cpu_pinning,
            };

            let spawned = std::thread::Builder::new()
                .name(format!("sieve-worker-{}", output.slice.id))
                .spawn_scoped(scope, move || worker.run());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    log_error!("[coordinator] Failed to spawn worker #{}: {e}", output.slice.id);
                    coordinator.finish_workers();
                    let _ = join_workers(handles);
                    return Err(SieveError::Spawn(e));
                }
            }
        }
        log_debug!("[coordinator] Spawned {} worker threads", handles.len());

        let references = coordinate(&mut coordinator, partition.limit());
        if references.is_err() {
            coordinator.finish_workers();
        }
        // A worker's own error is more specific than the coordinator's.
        join_workers(handles)?;
        references
    })?;

    drop(composites);
    Ok(SieveOutcome {
        mode: Mode::Thread,
        limit: partition.limit(),
        references,
        workers: outputs,
    })
}

/// Joins all the worker threads, returning the first error among them.
fn join_workers(
    handles: Vec<ScopedJoinHandle<'_, Result<WorkerTiming, SieveError>>>,
) -> Result<(), SieveError> {
    let mut result = Ok(());
    for (_i, handle) in handles.into_iter().enumerate() {
        let joined = match handle.join() {
            Ok(joined) => joined,
            Err(_) => {
                log_error!("[coordinator] Worker #{_i} panicked");
                Err(SieveError::WorkerAborted { count: 1 })
            }
        };
        match joined {
            Ok(_timing) => log_debug!("[coordinator] Worker #{_i} joined: {_timing:?}"),
            Err(e) => {
                log_error!("[coordinator] Worker #{_i} failed: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
    }
    result
}

/// State owned by a worker thread.
struct Worker<'a> {
    /// Slice of the worker and its output files.
    output: &'a WorkerOutput,
    /// Composite flags of the slice, exclusively owned by this worker.
    flags: &'a mut [bool],
    /// Worker side of the round protocol.
    participant: Participant,
    /// Policy to pin this thread to a CPU.
    cpu_pinning: CpuPinningPolicy,
}

impl Worker<'_> {
    /// Main function run by this thread.
    fn run(mut self) -> Result<WorkerTiming, SieveError> {
        let id = self.output.slice.id;
        if let Err(e) = pin_worker(self.cpu_pinning, id) {
            self.participant.abandon();
            return Err(e);
        }

        let start = self.output.slice.start;
        let mut timing = WorkerTiming::default();
        loop {
            let Some(round) = timed(&mut timing.waiting, || self.participant.wait_for_round())
            else {
                log_debug!("[worker {id}] Run aborted by the coordinator");
                return Ok(timing);
            };

            let reference = round.reference();
            let minimum = if reference == SENTINEL {
                SENTINEL
            } else {
                timed(&mut timing.working, || strike(self.flags, start, reference))
            };
            timed(&mut timing.communicating, || round.report(minimum));

            if minimum == SENTINEL {
                break;
            }
        }

        timed(&mut timing.working, || self.output.write_primes(self.flags))?;
        self.output.write_timing(&timing)?;
        log_debug!(
            "[worker {id}] Primes written to {}, timing written to {}",
            self.output.primes.display(),
            self.output.timing.display()
        );
        Ok(timing)
    }
}
