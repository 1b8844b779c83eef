// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pinning of workers to CPUs.

use crate::error::SieveError;
use crate::macros::{log_debug, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_getaffinity, sched_setaffinity, CpuSet},
    unistd::Pid,
};

/// Policy to pin workers to CPUs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin workers to CPUs.
    #[default]
    No,
    /// Pin each worker to a CPU, if CPU pinning is supported and implemented
    /// on this platform.
    IfSupported,
    /// Pin each worker to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), the run fails.
    Always,
}

/// Pins the calling thread (or process) to a CPU chosen from the worker
/// index, among the CPUs it is currently allowed to run on. Workers wrap
/// around the allowed CPUs.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
pub(crate) fn pin_worker(policy: CpuPinningPolicy, worker_id: usize) -> Result<(), SieveError> {
    if policy == CpuPinningPolicy::No {
        return Ok(());
    }

    let result = sched_getaffinity(Pid::from_raw(0)).and_then(|allowed| {
        let cpus = (0..CpuSet::count())
            .filter(|&cpu| allowed.is_set(cpu).unwrap_or(false))
            .collect::<Vec<_>>();
        let cpu = match cpus.len() {
            0 => return Err(nix::Error::EINVAL),
            n => cpus[worker_id % n],
        };
        let mut cpu_set = CpuSet::new();
        cpu_set.set(cpu)?;
        sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
        Ok(cpu)
    });

    match (result, policy) {
        (Ok(_cpu), _) => {
            log_debug!("Pinned worker #{worker_id} to CPU #{_cpu}");
            Ok(())
        }
        (Err(_e), CpuPinningPolicy::IfSupported) => {
            log_warn!("Failed to set CPU affinity for worker #{worker_id}: {_e}");
            Ok(())
        }
        (Err(source), _) => Err(SieveError::Affinity { worker_id, source }),
    }
}

/// Pins the calling thread (or process) to a CPU chosen from the worker
/// index. Workers wrap around the available CPUs.
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
pub(crate) fn pin_worker(policy: CpuPinningPolicy, _worker_id: usize) -> Result<(), SieveError> {
    match policy {
        CpuPinningPolicy::No => Ok(()),
        CpuPinningPolicy::IfSupported => {
            log_warn!("Pinning workers to CPUs is not implemented on this platform.");
            Ok(())
        }
        CpuPinningPolicy::Always => Err(SieveError::AffinityUnsupported),
    }
}
