// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration of a sieve run.

use crate::affinity::CpuPinningPolicy;
use crate::error::{ConfigError, SieveError};
use crate::macros::log_info;
use crate::output::SieveOutcome;
use crate::partition::Partition;
use std::path::PathBuf;

/// Substrate on which the round protocol runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Forked worker processes coordinated via named semaphores, shared memory
    /// and a message queue.
    Process,
    /// Worker threads coordinated via atomics and a condition variable.
    Thread,
}

impl Mode {
    /// Prefix of the output files written by the workers.
    pub fn file_prefix(self) -> &'static str {
        match self {
            Mode::Process => "proc",
            Mode::Thread => "thread",
        }
    }
}

/// Parameters of a sieve run.
///
/// ```no_run
/// # use parasieve::{Mode, SieveConfig};
/// let outcome = SieveConfig::new(100, 4, Mode::Thread).run()?;
/// assert_eq!(outcome.primes()?.len(), 25);
/// # Ok::<(), parasieve::SieveError>(())
/// ```
#[derive(Clone, Debug)]
pub struct SieveConfig {
    /// Exclusive upper bound: all primes below it are computed. Must be at
    /// least 10.
    pub limit: usize,
    /// Number of workers, between 1 and `limit - 3`.
    pub num_jobs: usize,
    /// Engine to run.
    pub mode: Mode,
    /// Policy to pin workers to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
    /// Directory in which the workers write their files.
    pub output_dir: PathBuf,
}

impl SieveConfig {
    /// Creates a configuration writing to the current directory without CPU
    /// pinning.
    pub fn new(limit: usize, num_jobs: usize, mode: Mode) -> Self {
        Self {
            limit,
            num_jobs,
            mode,
            cpu_pinning: CpuPinningPolicy::No,
            output_dir: PathBuf::from("."),
        }
    }

    /// Validates the bounds and returns the partition of the candidate range.
    pub fn partition(&self) -> Result<Partition, ConfigError> {
        Partition::new(self.limit, self.num_jobs)
    }

    /// Runs the sieve, blocking until every worker has written its files and
    /// every synchronization resource has been released.
    pub fn run(&self) -> Result<SieveOutcome, SieveError> {
        let partition = self.partition()?;
        if !self.output_dir.is_dir() {
            return Err(SieveError::Io {
                op: "open output directory",
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} is not a directory", self.output_dir.display()),
                ),
            });
        }

        log_info!(
            "Sieving below {} with {} {:?} worker(s)",
            self.limit,
            self.num_jobs,
            self.mode
        );
        match self.mode {
            Mode::Process => crate::process::run(self, &partition),
            Mode::Thread => crate::thread::run(self, &partition),
        }
    }
}

/// Runs the sieve below `limit` with `num_jobs` workers of the given mode,
/// writing the workers' files to the current directory.
pub fn run(limit: usize, num_jobs: usize, mode: Mode) -> Result<SieveOutcome, SieveError> {
    SieveConfig::new(limit, num_jobs, mode).run()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rejects_before_any_output() {
        let dir = std::env::temp_dir().join(format!("parasieve-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        for mode in [Mode::Process, Mode::Thread] {
            let mut config = SieveConfig::new(10, 8, mode);
            config.output_dir = dir.clone();
            let result = config.run();
            assert!(matches!(
                result,
                Err(SieveError::Config(ConfigError::TooManyJobs { .. }))
            ));
        }
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_output_dir() {
        let mut config = SieveConfig::new(100, 2, Mode::Thread);
        config.output_dir = PathBuf::from("/nonexistent/parasieve");
        assert!(matches!(
            config.run(),
            Err(SieveError::Io {
                op: "open output directory",
                ..
            })
        ));
    }

    #[test]
    fn test_file_prefix() {
        assert_eq!(Mode::Process.file_prefix(), "proc");
        assert_eq!(Mode::Thread.file_prefix(), "thread");
    }
}
