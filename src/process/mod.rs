// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Process engine: the round protocol over forked worker processes.
//!
//! The coordinator publishes each reference value in a shared memory cell,
//! wakes up every active worker by posting its named semaphore, and collects
//! one [`WorkerReport`] per active worker from a message queue. Each worker
//! process allocates the composite flags of its own slice.

mod ipc;

use crate::affinity::{pin_worker, CpuPinningPolicy};
use crate::config::{Mode, SieveConfig};
use crate::error::SieveError;
use crate::macros::{log_debug, log_error, log_warn};
use crate::memory::{HeapMemory, Memory, Role, SharedMemory, SharedRegion};
use crate::output::{timed, SieveOutcome, WorkerOutput, WorkerTiming};
use crate::partition::Partition;
use crate::round::{coordinate, RoundCoordinator};
use crate::strike::{strike, SENTINEL};
use ipc::{IpcNames, NamedSemaphore, ReportQueue, WorkerReport, MAX_QUEUED_REPORTS};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Exit code of a worker process that returned an error.
const EXIT_ERROR: i32 = 1;
/// Exit code of a worker process that panicked.
const EXIT_PANIC: i32 = 2;

/// How long the coordinator waits for a report before checking whether a
/// worker process died.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs the sieve on forked worker processes.
pub(crate) fn run(config: &SieveConfig, partition: &Partition) -> Result<SieveOutcome, SieveError> {
    let names = IpcNames::unique();
    let outputs = partition
        .slices()
        .map(|slice| WorkerOutput::new(&config.output_dir, Mode::Process.file_prefix(), slice))
        .collect::<Vec<_>>();

    let mut coordinator = ProcessCoordinator::new(&names, partition.num_jobs())?;
    for output in &outputs {
        // SAFETY: the child only runs `worker_main()`, which never returns. Only
        // async-signal-safe calls are defined after forking a multi-threaded
        // process, so the child additionally relies on glibc resetting its
        // allocator locks at fork, and on no other thread holding the logger
        // lock. The binary forks from its only thread.
        match unsafe { fork() }.map_err(SieveError::ipc("fork"))? {
            ForkResult::Parent { child } => {
                log_debug!("[coordinator] Forked worker #{} as {child}", output.slice.id);
                coordinator.children.pids.push((output.slice.id, child));
            }
            ForkResult::Child => worker_main(&names, output, config.cpu_pinning),
        }
    }

    let references = coordinate(&mut coordinator, partition.limit())?;
    // Workers write their files after the final report.
    coordinator.children.wait_all()?;
    drop(coordinator);

    Ok(SieveOutcome {
        mode: Mode::Process,
        limit: partition.limit(),
        references,
        workers: outputs,
    })
}

/// Coordinator side of the process engine.
struct ProcessCoordinator {
    /// Worker processes. Declared first so that on error they are killed before
    /// the IPC objects below are unlinked.
    children: Children,
    /// Cell holding the current reference value.
    reference: SharedRegion<AtomicUsize>,
    /// Semaphore of each worker, or `None` once the worker is exhausted.
    semaphores: Vec<Option<NamedSemaphore>>,
    /// Queue receiving the reports.
    queue: ReportQueue,
    /// Number of workers that still take part in rounds.
    active: usize,
}

impl ProcessCoordinator {
    /// Creates all the IPC objects of a run with `num_jobs` workers.
    fn new(names: &IpcNames, num_jobs: usize) -> Result<Self, SieveError> {
        let capacity = num_jobs.clamp(1, MAX_QUEUED_REPORTS);
        let queue = ReportQueue::create(&names.queue(), capacity)?;
        let reference =
            SharedMemory::new(names.reference()).allocate::<AtomicUsize>(Role::Owner, 1)?;
        let semaphores = (0..num_jobs)
            .map(|id| NamedSemaphore::create(&names.semaphore(id)).map(Some))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            children: Children::default(),
            reference,
            semaphores,
            queue,
            active: num_jobs,
        })
    }
}

impl RoundCoordinator for ProcessCoordinator {
    fn active_workers(&self) -> usize {
        self.active
    }

    fn run_round(&mut self, reference: usize) -> Result<usize, SieveError> {
        // Posting the semaphores orders this store before the workers' loads.
        self.reference[0].store(reference, Ordering::SeqCst);
        for semaphore in self.semaphores.iter().flatten() {
            semaphore.post()?;
        }

        let mut minimum = SENTINEL;
        let mut exhausted = 0;
        let mut received = 0;
        while received < self.active {
            let Some(report) = self.queue.receive_timeout(CHILD_POLL_INTERVAL)? else {
                // A worker that died without reporting would block the round forever.
                self.children.reap_exited()?;
                continue;
            };
            received += 1;
            if report.failed {
                return Err(SieveError::WorkerFailed {
                    worker_id: report.worker_id,
                    status: "reported a failure".to_owned(),
                });
            }
            if report.local_minimum == SENTINEL {
                // Closes and unlinks the semaphore of the exhausted worker.
                self.semaphores
                    .get_mut(report.worker_id)
                    .and_then(Option::take)
                    .ok_or(SieveError::UnexpectedReport {
                        worker_id: report.worker_id,
                    })?;
                log_debug!("[coordinator] Worker #{} is exhausted", report.worker_id);
                exhausted += 1;
            } else {
                minimum = minimum.min(report.local_minimum);
            }
        }
        self.active -= exhausted;
        Ok(minimum)
    }
}

/// Worker processes that haven't been reaped yet. Dropping this kills and reaps
/// them.
#[derive(Default)]
struct Children {
    pids: Vec<(usize, Pid)>,
}

impl Children {
    /// Reaps the workers that already exited, returning an error if any of them
    /// didn't exit successfully. Live workers are left alone.
    fn reap_exited(&mut self) -> Result<(), SieveError> {
        let mut failure = None;
        self.pids.retain(|&(worker_id, pid)| {
            if failure.is_some() {
                return true;
            }
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => true,
                // Its last report is already queued.
                Ok(WaitStatus::Exited(_, 0)) => false,
                Ok(status) => {
                    failure = Some(SieveError::WorkerFailed {
                        worker_id,
                        status: format!("{status:?}"),
                    });
                    false
                }
                Err(e) => {
                    failure = Some(SieveError::ipc("waitpid")(e));
                    true
                }
            }
        });
        match failure {
            Some(error) => {
                log_error!("[coordinator] {error}");
                Err(error)
            }
            None => Ok(()),
        }
    }

    /// Waits for every worker to exit, returning an error for the first one
    /// that didn't exit successfully.
    fn wait_all(&mut self) -> Result<(), SieveError> {
        let mut result = Ok(());
        for (worker_id, pid) in self.pids.drain(..) {
            let error = match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, 0)) => {
                    log_debug!("[coordinator] Worker #{worker_id} exited");
                    continue;
                }
                Ok(status) => SieveError::WorkerFailed {
                    worker_id,
                    status: format!("{status:?}"),
                },
                Err(e) => SieveError::ipc("waitpid")(e),
            };
            log_error!("[coordinator] Worker #{worker_id}: {error}");
            if result.is_ok() {
                result = Err(error);
            }
        }
        result
    }
}

impl Drop for Children {
    fn drop(&mut self) {
        for (_worker_id, pid) in self.pids.drain(..) {
            log_warn!("[coordinator] Killing worker #{_worker_id} ({pid})");
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
    }
}

/// Entry point of a forked worker process.
fn worker_main(names: &IpcNames, output: &WorkerOutput, cpu_pinning: CpuPinningPolicy) -> ! {
    let id = output.slice.id;
    let code = match catch_unwind(AssertUnwindSafe(|| run_worker(names, output, cpu_pinning))) {
        Ok(Ok(_timing)) => {
            log_debug!("[worker {id}] Done: {_timing:?}");
            0
        }
        Ok(Err(e)) => {
            let message = format!("worker #{id}: {e}\n");
            // SAFETY: the buffer is valid for its length. Writing to the raw file
            // descriptor bypasses the stderr lock, which another thread of the
            // parent may have held at fork time.
            unsafe { libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len()) };
            EXIT_ERROR
        }
        Err(_) => EXIT_PANIC,
    };
    // SAFETY: `_exit()` terminates this process right away, so the copies of the
    // coordinator's IPC objects inherited by the fork are never dropped here.
    unsafe { libc::_exit(code) }
}

/// Runs the rounds of a worker process and writes its output files.
fn run_worker(
    names: &IpcNames,
    output: &WorkerOutput,
    cpu_pinning: CpuPinningPolicy,
) -> Result<WorkerTiming, SieveError> {
    let id = output.slice.id;
    let queue = ReportQueue::open(&names.queue())?;
    let setup = || -> Result<_, SieveError> {
        pin_worker(cpu_pinning, id)?;
        let semaphore = NamedSemaphore::open(&names.semaphore(id))?;
        let cell =
            SharedMemory::new(names.reference()).allocate::<AtomicUsize>(Role::Attached, 1)?;
        let flags = HeapMemory.allocate::<bool>(Role::Owner, output.slice.len)?;
        Ok((semaphore, cell, flags))
    };
    let (semaphore, cell, mut flags) = match setup() {
        Ok(resources) => resources,
        Err(e) => {
            // Unblocks the coordinator, which waits for a report in the first round.
            let _ = queue.send(WorkerReport::failure(id));
            return Err(e);
        }
    };

    let start = output.slice.start;
    let mut timing = WorkerTiming::default();
    loop {
        timed(&mut timing.waiting, || semaphore.wait())?;
        let reference = cell[0].load(Ordering::SeqCst);
        let minimum = if reference == SENTINEL {
            SENTINEL
        } else {
            timed(&mut timing.working, || strike(&mut flags, start, reference))
        };
        timed(&mut timing.communicating, || {
            queue.send(WorkerReport::new(id, minimum))
        })?;
        if minimum == SENTINEL {
            break;
        }
    }
    drop((semaphore, cell, queue));

    timed(&mut timing.working, || output.write_primes(&flags))?;
    output.write_timing(&timing)?;
    log_debug!(
        "[worker {id}] Primes written to {}, timing written to {}",
        output.primes.display(),
        output.timing.display()
    );
    Ok(timing)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::partition::Partition;
    use crate::strike::serial_sieve;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "parasieve-process-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn run_in(tag: &str, limit: usize, num_jobs: usize) -> SieveOutcome {
        let mut config = SieveConfig::new(limit, num_jobs, Mode::Process);
        config.output_dir = temp_dir(tag);
        let partition = config.partition().unwrap();
        run(&config, &partition).unwrap()
    }

    fn cleanup(outcome: SieveOutcome, tag: &str) {
        outcome.remove_files().unwrap();
        std::fs::remove_dir(temp_dir(tag)).unwrap();
    }

    #[test]
    fn test_single_worker() {
        let outcome = run_in("single", 10, 1);
        assert_eq!(outcome.references, [2, 3]);
        assert_eq!(outcome.primes().unwrap(), [2, 3, 5, 7]);
        cleanup(outcome, "single");
    }

    #[test]
    fn test_more_workers_than_queue_capacity() {
        let num_jobs = MAX_QUEUED_REPORTS + 3;
        let outcome = run_in("capacity", 1000, num_jobs);
        assert_eq!(outcome.workers.len(), num_jobs);
        assert_eq!(outcome.primes().unwrap(), serial_sieve(1000));
        cleanup(outcome, "capacity");
    }

    #[test]
    fn test_ipc_objects_are_unlinked() {
        let names = IpcNames::unique();
        let coordinator = ProcessCoordinator::new(&names, 2).unwrap();
        assert!(NamedSemaphore::open(&names.semaphore(1)).is_ok());
        drop(coordinator);

        assert!(NamedSemaphore::open(&names.semaphore(0)).is_err());
        assert!(ReportQueue::open(&names.queue()).is_err());
        assert!(SharedMemory::new(names.reference())
            .allocate::<AtomicUsize>(Role::Attached, 1)
            .is_err());
    }

    #[test]
    fn test_failure_report_aborts_round() {
        let names = IpcNames::unique();
        let mut coordinator = ProcessCoordinator::new(&names, 2).unwrap();
        let sender = ReportQueue::open(&names.queue()).unwrap();
        sender.send(WorkerReport::new(0, 5)).unwrap();
        sender.send(WorkerReport::failure(1)).unwrap();

        assert!(matches!(
            coordinator.run_round(2),
            Err(SieveError::WorkerFailed { worker_id: 1, .. })
        ));
    }

    #[test]
    fn test_round_reduction() {
        let names = IpcNames::unique();
        let mut coordinator = ProcessCoordinator::new(&names, 3).unwrap();
        let sender = ReportQueue::open(&names.queue()).unwrap();

        for report in [
            WorkerReport::new(2, 29),
            WorkerReport::new(0, SENTINEL),
            WorkerReport::new(1, 13),
        ] {
            sender.send(report).unwrap();
        }
        assert_eq!(coordinator.run_round(11).unwrap(), 13);
        assert_eq!(coordinator.active_workers(), 2);
        assert!(coordinator.semaphores[0].is_none());
        assert_eq!(coordinator.reference[0].load(Ordering::SeqCst), 11);

        // A second exhaustion report from the same worker is rejected.
        sender.send(WorkerReport::new(0, SENTINEL)).unwrap();
        sender.send(WorkerReport::new(1, 17)).unwrap();
        assert!(matches!(
            coordinator.run_round(13),
            Err(SieveError::UnexpectedReport { worker_id: 0 })
        ));
    }

    #[test]
    fn test_worker_output_failure() {
        let mut config = SieveConfig::new(100, 2, Mode::Process);
        config.output_dir = std::env::temp_dir().join("parasieve-missing/nested");
        let partition = config.partition().unwrap();
        // The output directory is checked by `SieveConfig::run()`, but this
        // engine entry point only fails once workers try to write their files.
        assert!(matches!(
            run(&config, &partition),
            Err(SieveError::WorkerFailed { .. })
        ));
    }

    #[test]
    fn test_dead_worker_fails_round() {
        let names = IpcNames::unique();
        let mut coordinator = ProcessCoordinator::new(&names, 2).unwrap();
        let sender = ReportQueue::open(&names.queue()).unwrap();
        sender.send(WorkerReport::new(0, 3)).unwrap();

        // SAFETY: the child exits right away without touching any lock.
        match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => coordinator.children.pids.push((1, child)),
            ForkResult::Child => unsafe { libc::_exit(EXIT_ERROR) },
        }

        assert!(matches!(
            coordinator.run_round(2),
            Err(SieveError::WorkerFailed { worker_id: 1, .. })
        ));
        assert!(coordinator.children.pids.is_empty());

        drop(sender);
        drop(coordinator);
        assert!(NamedSemaphore::open(&names.semaphore(1)).is_err());
        assert!(ReportQueue::open(&names.queue()).is_err());
        assert!(SharedMemory::new(names.reference())
            .allocate::<AtomicUsize>(Role::Attached, 1)
            .is_err());
    }

    #[test]
    fn test_finished_worker_is_not_a_failure() {
        let names = IpcNames::unique();
        let mut coordinator = ProcessCoordinator::new(&names, 1).unwrap();

        // SAFETY: the child only sends one report and exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => coordinator.children.pids.push((0, child)),
            ForkResult::Child => {
                let code = match ReportQueue::open(&names.queue())
                    .and_then(|queue| queue.send(WorkerReport::new(0, SENTINEL)))
                {
                    Ok(()) => 0,
                    Err(_) => EXIT_ERROR,
                };
                unsafe { libc::_exit(code) }
            }
        }

        assert_eq!(coordinator.run_round(2).unwrap(), SENTINEL);
        assert_eq!(coordinator.active_workers(), 0);
        coordinator.children.wait_all().unwrap();
    }

    #[test]
    fn test_worker_setup_failure_is_reported() {
        let names = IpcNames::unique();
        let queue = ReportQueue::create(&names.queue(), 1).unwrap();
        let output = WorkerOutput::new(
            &std::env::temp_dir(),
            "parasieve-unused",
            Partition::new(10, 1).unwrap().slice(0),
        );

        // No semaphore was created under these names.
        let result = run_worker(&names, &output, CpuPinningPolicy::No);
        assert!(matches!(
            result,
            Err(SieveError::Ipc { op: "sem_open", .. })
        ));
        assert_eq!(queue.receive().unwrap(), WorkerReport::failure(0));
        assert!(!output.primes.exists());
    }
}
