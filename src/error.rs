// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types reported by a sieve run.

use std::fmt;

/// Smallest limit accepted by a sieve run.
pub const MIN_LIMIT: usize = 10;

/// A configuration that was rejected before any worker or IPC object was
/// created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The limit is below [`MIN_LIMIT`].
    LimitTooSmall {
        /// The requested limit.
        limit: usize,
    },
    /// Zero workers were requested.
    NoJobs,
    /// More workers than candidate numbers were requested, which would leave
    /// some worker with an empty slice.
    TooManyJobs {
        /// The requested number of workers.
        num_jobs: usize,
        /// The maximum number of workers for this limit, i.e. `limit - 3`.
        max_jobs: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::LimitTooSmall { limit } => {
                write!(f, "limit must be at least {MIN_LIMIT}, got {limit}")
            }
            ConfigError::NoJobs => write!(f, "at least one job is required"),
            ConfigError::TooManyJobs { num_jobs, max_jobs } => write!(
                f,
                "{num_jobs} jobs requested but at most {max_jobs} fit below the limit"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Error aborting a sieve run.
///
/// None of these are transient: the round protocol has no degraded mode, so
/// the first failure ends the run.
#[derive(Debug)]
pub enum SieveError {
    /// The configuration was rejected.
    Config(ConfigError),
    /// A semaphore, shared memory, message queue or process operation failed.
    Ipc {
        /// Name of the failing operation.
        op: &'static str,
        /// Underlying OS error.
        source: nix::Error,
    },
    /// Reading or writing an output file failed.
    Io {
        /// Name of the failing operation.
        op: &'static str,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// A worker thread couldn't be spawned.
    Spawn(std::io::Error),
    /// A report received on the message queue couldn't be decoded.
    MalformedReport {
        /// Number of bytes received.
        len: usize,
    },
    /// A report named a worker that isn't active.
    UnexpectedReport {
        /// Worker index carried by the report.
        worker_id: usize,
    },
    /// A worker process failed, either reporting it or by exiting
    /// unsuccessfully.
    WorkerFailed {
        /// Index of the worker.
        worker_id: usize,
        /// Human-readable exit status.
        status: String,
    },
    /// One or more worker threads abandoned a round without reporting, for
    /// example because they panicked.
    WorkerAborted {
        /// Number of worker threads that abandoned the round.
        count: usize,
    },
    /// Pinning a worker to a CPU failed under [`CpuPinningPolicy::Always`].
    ///
    /// [`CpuPinningPolicy::Always`]: crate::CpuPinningPolicy::Always
    Affinity {
        /// Index of the worker.
        worker_id: usize,
        /// Underlying OS error.
        source: nix::Error,
    },
    /// CPU pinning was requested on a platform that doesn't implement it.
    AffinityUnsupported,
    /// A memory region couldn't be allocated.
    Memory(&'static str),
}

impl SieveError {
    /// Wraps a [`nix::Error`] returned by the given IPC operation.
    pub(crate) fn ipc(op: &'static str) -> impl FnOnce(nix::Error) -> SieveError {
        move |source| SieveError::Ipc { op, source }
    }

    /// Wraps a [`std::io::Error`] returned by the given I/O operation.
    pub(crate) fn io(op: &'static str) -> impl FnOnce(std::io::Error) -> SieveError {
        move |source| SieveError::Io { op, source }
    }
}

impl From<ConfigError> for SieveError {
    fn from(e: ConfigError) -> Self {
        SieveError::Config(e)
    }
}

impl fmt::Display for SieveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SieveError::Config(e) => write!(f, "Invalid configuration: {e}"),
            SieveError::Ipc { op, source } => write!(f, "{op} failed: {source}"),
            SieveError::Io { op, source } => write!(f, "{op} failed: {source}"),
            SieveError::Spawn(e) => write!(f, "Failed to spawn a worker thread: {e}"),
            SieveError::MalformedReport { len } => {
                write!(f, "Received a malformed worker report of {len} bytes")
            }
            SieveError::UnexpectedReport { worker_id } => {
                write!(f, "Received a report from inactive worker #{worker_id}")
            }
            SieveError::WorkerFailed { worker_id, status } => {
                write!(f, "Worker process #{worker_id} failed: {status}")
            }
            SieveError::WorkerAborted { count } => {
                write!(f, "{count} worker thread(s) abandoned a round")
            }
            SieveError::Affinity { worker_id, source } => {
                write!(f, "Failed to set CPU affinity for worker #{worker_id}: {source}")
            }
            SieveError::AffinityUnsupported => {
                write!(f, "Pinning workers to CPUs is not implemented on this platform")
            }
            SieveError::Memory(reason) => write!(f, "Memory allocation failed: {reason}"),
        }
    }
}

impl std::error::Error for SieveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SieveError::Config(e) => Some(e),
            SieveError::Ipc { source, .. } => Some(source),
            SieveError::Io { source, .. } => Some(source),
            SieveError::Spawn(e) => Some(e),
            SieveError::Affinity { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display_names_operation() {
        let error = SieveError::ipc("mq_open")(nix::Error::EINVAL);
        assert!(error.to_string().starts_with("mq_open failed"));
        assert!(error.source().is_some());
    }

    #[test]
    fn test_config_error_conversion() {
        let error: SieveError = ConfigError::NoJobs.into();
        assert!(matches!(error, SieveError::Config(ConfigError::NoJobs)));
        assert_eq!(
            error.to_string(),
            "Invalid configuration: at least one job is required"
        );
    }
}
