// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Named IPC objects of the process engine: per-worker semaphores and the
//! report queue.
//!
//! Every object is either owned (created by the coordinator, which also
//! unlinks its name when dropped) or attached (opened by name in a worker).

use crate::error::SieveError;
use crate::macros::{log_debug, log_error};
use crate::memory::Role;
use nix::errno::Errno;
use nix::mqueue::{
    mq_attr_member_t, mq_close, mq_open, mq_receive, mq_send, mq_timedreceive, mq_unlink, MqAttr,
    MqdT, MQ_OFlag,
};
use nix::sys::stat::Mode;
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Largest queue capacity an unprivileged process can request with the
/// default Linux `fs.mqueue.msg_max` setting.
pub const MAX_QUEUED_REPORTS: usize = 10;

/// Names of the IPC objects of one run, unique across runs (including
/// concurrent runs within one process).
#[derive(Debug, Clone)]
pub struct IpcNames {
    prefix: String,
}

impl IpcNames {
    /// Generates a fresh set of names.
    pub fn unique() -> Self {
        static NEXT_RUN: AtomicUsize = AtomicUsize::new(0);
        let run = NEXT_RUN.fetch_add(1, Ordering::Relaxed);
        Self {
            prefix: format!("/parasieve-{}-{run}", std::process::id()),
        }
    }

    /// Name of the semaphore of the given worker.
    pub fn semaphore(&self, worker_id: usize) -> String {
        format!("{}-sem{worker_id}", self.prefix)
    }

    /// Name of the shared memory object holding the reference value.
    pub fn reference(&self) -> String {
        format!("{}-ref", self.prefix)
    }

    /// Name of the report queue.
    pub fn queue(&self) -> String {
        format!("{}-reports", self.prefix)
    }
}

/// A POSIX named semaphore.
#[derive(Debug)]
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: CString,
    role: Role,
}

// SAFETY: POSIX semaphores can be posted and waited on from any thread.
unsafe impl Send for NamedSemaphore {}
// SAFETY: POSIX semaphores can be posted and waited on from any thread.
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Creates a new semaphore with an initial value of 0. Fails if the name
    /// is taken.
    pub fn create(name: &str) -> Result<Self, SieveError> {
        let name = semaphore_name(name)?;
        // SAFETY: `name` is a valid NUL-terminated string, and `O_CREAT` is
        // followed by the mode and initial value arguments.
        let sem = unsafe {
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                libc::c_uint::from(0o600u16),
                0 as libc::c_uint,
            )
        };
        Self::from_raw(sem, name, Role::Owner)
    }

    /// Opens an existing semaphore.
    pub fn open(name: &str) -> Result<Self, SieveError> {
        let name = semaphore_name(name)?;
        // SAFETY: `name` is a valid NUL-terminated string.
        let sem = unsafe { libc::sem_open(name.as_ptr(), 0) };
        Self::from_raw(sem, name, Role::Attached)
    }

    fn from_raw(sem: *mut libc::sem_t, name: CString, role: Role) -> Result<Self, SieveError> {
        if sem == libc::SEM_FAILED {
            return Err(SieveError::ipc("sem_open")(Errno::last()));
        }
        let sem = NonNull::new(sem).ok_or(SieveError::ipc("sem_open")(Errno::EINVAL))?;
        Ok(Self { sem, name, role })
    }

    /// Increments the semaphore, waking up a waiter.
    pub fn post(&self) -> Result<(), SieveError> {
        // SAFETY: `sem` was returned by `sem_open()` and isn't closed before `self`
        // is dropped.
        match unsafe { libc::sem_post(self.sem.as_ptr()) } {
            0 => Ok(()),
            _ => Err(SieveError::ipc("sem_post")(Errno::last())),
        }
    }

    /// Blocks until the semaphore can be decremented.
    pub fn wait(&self) -> Result<(), SieveError> {
        loop {
            // SAFETY: `sem` was returned by `sem_open()` and isn't closed before `self`
            // is dropped.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            match Errno::last() {
                // Interrupted by a signal handler before the semaphore was taken.
                Errno::EINTR => continue,
                e => return Err(SieveError::ipc("sem_wait")(e)),
            }
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: `sem` was returned by `sem_open()` and is closed only once.
        if unsafe { libc::sem_close(self.sem.as_ptr()) } != 0 {
            log_error!("Failed to close {:?}: {}", self.name, Errno::last());
        }
        if self.role == Role::Owner {
            // SAFETY: `name` is a valid NUL-terminated string.
            if unsafe { libc::sem_unlink(self.name.as_ptr()) } != 0 {
                log_error!("Failed to unlink {:?}: {}", self.name, Errno::last());
            } else {
                log_debug!("Unlinked {:?}", self.name);
            }
        }
    }
}

fn semaphore_name(name: &str) -> Result<CString, SieveError> {
    CString::new(name).map_err(|_| SieveError::ipc("sem_open")(Errno::EINVAL))
}

/// Report sent by a worker at the end of each round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    /// Index of the reporting worker.
    pub worker_id: usize,
    /// Smallest unmarked number of the worker's slice above the reference,
    /// or [`SENTINEL`](crate::SENTINEL).
    pub local_minimum: usize,
    /// Whether the worker failed and can't take part in the run.
    pub failed: bool,
}

/// Size of an encoded [`WorkerReport`]: three native-endian `u64` words.
pub const REPORT_SIZE: usize = 24;

impl WorkerReport {
    /// A report carrying the worker's local minimum.
    pub fn new(worker_id: usize, local_minimum: usize) -> Self {
        Self {
            worker_id,
            local_minimum,
            failed: false,
        }
    }

    /// A report telling the coordinator that the worker failed.
    pub fn failure(worker_id: usize) -> Self {
        Self {
            worker_id,
            local_minimum: crate::strike::SENTINEL,
            failed: true,
        }
    }

    fn encode(&self) -> [u8; REPORT_SIZE] {
        let mut bytes = [0; REPORT_SIZE];
        bytes[..8].copy_from_slice(&(self.worker_id as u64).to_ne_bytes());
        bytes[8..16].copy_from_slice(&(self.local_minimum as u64).to_ne_bytes());
        bytes[16..].copy_from_slice(&u64::from(self.failed).to_ne_bytes());
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self, SieveError> {
        let malformed = || SieveError::MalformedReport { len: bytes.len() };
        if bytes.len() != REPORT_SIZE {
            return Err(malformed());
        }
        let word = |i: usize| {
            let mut word = [0; 8];
            word.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            u64::from_ne_bytes(word)
        };
        let worker_id = usize::try_from(word(0)).map_err(|_| malformed())?;
        let local_minimum = usize::try_from(word(1)).map_err(|_| malformed())?;
        let failed = match word(2) {
            0 => false,
            1 => true,
            _ => return Err(malformed()),
        };
        Ok(Self {
            worker_id,
            local_minimum,
            failed,
        })
    }
}

/// A POSIX message queue carrying [`WorkerReport`]s to the coordinator.
#[derive(Debug)]
pub struct ReportQueue {
    mqd: Option<MqdT>,
    name: String,
    role: Role,
}

impl ReportQueue {
    /// Creates a queue holding up to `capacity` reports. Senders block while
    /// the queue is full.
    pub fn create(name: &str, capacity: usize) -> Result<Self, SieveError> {
        let attr = MqAttr::new(
            0,
            capacity as mq_attr_member_t,
            REPORT_SIZE as mq_attr_member_t,
            0,
        );
        let mqd = mq_open(
            name,
            MQ_OFlag::O_CREAT | MQ_OFlag::O_EXCL | MQ_OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
            Some(&attr),
        )
        .map_err(SieveError::ipc("mq_open"))?;
        log_debug!("Created {name} with capacity {capacity}");
        Ok(Self {
            mqd: Some(mqd),
            name: name.to_owned(),
            role: Role::Owner,
        })
    }

    /// Opens an existing queue for sending.
    pub fn open(name: &str) -> Result<Self, SieveError> {
        let mqd = mq_open(name, MQ_OFlag::O_WRONLY, Mode::empty(), None)
            .map_err(SieveError::ipc("mq_open"))?;
        Ok(Self {
            mqd: Some(mqd),
            name: name.to_owned(),
            role: Role::Attached,
        })
    }

    fn mqd(&self) -> &MqdT {
        // Only `drop()` takes the descriptor out.
        self.mqd.as_ref().unwrap()
    }

    /// Sends a report, blocking while the queue is full.
    pub fn send(&self, report: WorkerReport) -> Result<(), SieveError> {
        mq_send(self.mqd(), &report.encode(), 0).map_err(SieveError::ipc("mq_send"))
    }

    /// Receives a report, blocking while the queue is empty.
    pub fn receive(&self) -> Result<WorkerReport, SieveError> {
        let mut buf = [0; REPORT_SIZE];
        let mut priority = 0;
        let len =
            mq_receive(self.mqd(), &mut buf, &mut priority).map_err(SieveError::ipc("mq_receive"))?;
        WorkerReport::decode(&buf[..len])
    }

    /// Receives a report, blocking for at most `timeout`. Returns [`None`] if
    /// no report arrived in time.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<WorkerReport>, SieveError> {
        let now = clock_gettime(ClockId::CLOCK_REALTIME).map_err(SieveError::ipc("clock_gettime"))?;
        let deadline = now + TimeSpec::from_duration(timeout);
        let mut buf = [0; REPORT_SIZE];
        let mut priority = 0;
        match mq_timedreceive(self.mqd(), &mut buf, &mut priority, &deadline) {
            Ok(len) => WorkerReport::decode(&buf[..len]).map(Some),
            Err(Errno::ETIMEDOUT | Errno::EINTR) => Ok(None),
            Err(e) => Err(SieveError::ipc("mq_timedreceive")(e)),
        }
    }
}

impl Drop for ReportQueue {
    fn drop(&mut self) {
        if let Some(mqd) = self.mqd.take() {
            if let Err(_e) = mq_close(mqd) {
                log_error!("Failed to close {}: {_e}", self.name);
            }
        }
        if self.role == Role::Owner {
            match mq_unlink(self.name.as_str()) {
                Ok(()) => log_debug!("Unlinked {}", self.name),
                Err(_e) => log_error!("Failed to unlink {}: {_e}", self.name),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::strike::SENTINEL;

    #[test]
    fn test_names_are_unique() {
        let a = IpcNames::unique();
        let b = IpcNames::unique();
        assert_ne!(a.queue(), b.queue());
        assert_ne!(a.reference(), b.reference());
        assert_ne!(a.semaphore(0), a.semaphore(1));
        assert!(a.semaphore(3).starts_with('/'));
        assert_eq!(a.semaphore(3).matches('/').count(), 1);
    }

    #[test]
    fn test_report_encoding() {
        for report in [
            WorkerReport::new(3, 17),
            WorkerReport::new(0, SENTINEL),
            WorkerReport::failure(5),
        ] {
            assert_eq!(WorkerReport::decode(&report.encode()).unwrap(), report);
        }
        assert!(matches!(
            WorkerReport::decode(&[0; 16]),
            Err(SieveError::MalformedReport { len: 16 })
        ));
        let mut bytes = WorkerReport::new(1, 2).encode();
        bytes[16] = 7;
        assert!(WorkerReport::decode(&bytes).is_err());
    }

    #[test]
    fn test_semaphore_post_wait() {
        let name = IpcNames::unique().semaphore(0);
        let owner = NamedSemaphore::create(&name).unwrap();
        let attached = NamedSemaphore::open(&name).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| attached.wait().unwrap());
            owner.post().unwrap();
        });

        // The name is exclusive while the owner lives, and gone afterwards.
        assert!(NamedSemaphore::create(&name).is_err());
        drop(attached);
        drop(owner);
        assert!(matches!(
            NamedSemaphore::open(&name),
            Err(SieveError::Ipc {
                op: "sem_open",
                source: Errno::ENOENT
            })
        ));
    }

    #[test]
    fn test_queue_send_receive() {
        let name = IpcNames::unique().queue();
        let owner = ReportQueue::create(&name, 2).unwrap();
        let sender = ReportQueue::open(&name).unwrap();

        sender.send(WorkerReport::new(1, 11)).unwrap();
        sender.send(WorkerReport::new(0, SENTINEL)).unwrap();
        assert_eq!(owner.receive().unwrap(), WorkerReport::new(1, 11));
        assert_eq!(owner.receive().unwrap(), WorkerReport::new(0, SENTINEL));
        assert_eq!(
            owner.receive_timeout(Duration::from_millis(10)).unwrap(),
            None
        );
        sender.send(WorkerReport::new(2, 7)).unwrap();
        assert_eq!(
            owner.receive_timeout(Duration::from_secs(10)).unwrap(),
            Some(WorkerReport::new(2, 7))
        );

        drop(sender);
        drop(owner);
        assert!(ReportQueue::open(&name).is_err());
    }

    #[test]
    fn test_queue_blocks_when_full() {
        let name = IpcNames::unique().queue();
        let owner = ReportQueue::create(&name, 1).unwrap();
        let sender = ReportQueue::open(&name).unwrap();

        let received = std::thread::scope(|scope| {
            scope.spawn(|| {
                for id in 0..5 {
                    sender.send(WorkerReport::new(id, id + 3)).unwrap();
                }
            });
            (0..5)
                .map(|_| owner.receive().unwrap().worker_id)
                .collect::<Vec<_>>()
        });
        assert_eq!(received, [0, 1, 2, 3, 4]);
    }
}
