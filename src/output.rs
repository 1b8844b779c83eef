// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-worker output files and the outcome of a sieve run.

use crate::config::Mode;
use crate::error::SieveError;
use crate::partition::Slice;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Time spent by a worker in each phase of the round protocol.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTiming {
    /// Waiting for the coordinator to publish a reference value.
    pub waiting: Duration,
    /// Striking multiples and writing the primes file.
    pub working: Duration,
    /// Reporting the local minimum to the coordinator.
    pub communicating: Duration,
}

/// Runs `f` and adds its wall-clock duration to `bucket`.
pub(crate) fn timed<R>(bucket: &mut Duration, f: impl FnOnce() -> R) -> R {
    let start = Instant::now();
    let result = f();
    *bucket += start.elapsed();
    result
}

/// Location of the files written by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutput {
    /// Slice processed by the worker.
    pub slice: Slice,
    /// File listing the primes of the slice, one per line.
    pub primes: PathBuf,
    /// File with the worker's timing breakdown.
    pub timing: PathBuf,
}

impl WorkerOutput {
    /// Paths of the files of the given worker: `<prefix><id>` and
    /// `<prefix><id>.time` in `dir`.
    pub fn new(dir: &Path, prefix: &str, slice: Slice) -> Self {
        Self {
            slice,
            primes: dir.join(format!("{prefix}{}", slice.id)),
            timing: dir.join(format!("{prefix}{}.time", slice.id)),
        }
    }

    /// Writes the numbers of the slice that aren't flagged as composite.
    pub(crate) fn write_primes(&self, composites: &[bool]) -> Result<(), SieveError> {
        let file = File::create(&self.primes).map_err(SieveError::io("create primes file"))?;
        let mut out = BufWriter::new(file);
        for (i, _) in composites
            .iter()
            .enumerate()
            .filter(|(_, composite)| !**composite)
        {
            writeln!(out, "{}", self.slice.start + i).map_err(SieveError::io("write primes"))?;
        }
        out.flush().map_err(SieveError::io("write primes"))
    }

    /// Writes the timing breakdown, in milliseconds.
    pub(crate) fn write_timing(&self, timing: &WorkerTiming) -> Result<(), SieveError> {
        let file = File::create(&self.timing).map_err(SieveError::io("create timing file"))?;
        let mut out = BufWriter::new(file);
        let millis = |d: Duration| d.as_secs_f64() * 1000.0;
        let write = |out: &mut BufWriter<File>| -> std::io::Result<()> {
            writeln!(out, "waiting (ms): {:.4}", millis(timing.waiting))?;
            writeln!(out, "working (ms): {:.4}", millis(timing.working))?;
            writeln!(out, "communicating (ms): {:.4}", millis(timing.communicating))?;
            out.flush()
        };
        write(&mut out).map_err(SieveError::io("write timing"))
    }

    /// Reads back the primes written by the worker.
    pub fn read_primes(&self) -> Result<Vec<usize>, SieveError> {
        let file = File::open(&self.primes).map_err(SieveError::io("open primes file"))?;
        BufReader::new(file)
            .lines()
            .map(|line| {
                let line = line.map_err(SieveError::io("read primes"))?;
                line.trim().parse().map_err(|_| SieveError::Io {
                    op: "parse primes",
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("not a number: {line:?}"),
                    ),
                })
            })
            .collect()
    }
}

/// Result of a completed sieve run.
#[derive(Debug, Clone)]
pub struct SieveOutcome {
    /// Engine that ran the sieve.
    pub mode: Mode,
    /// Exclusive upper bound of the sieve.
    pub limit: usize,
    /// Reference values published by the coordinator, in order. The final
    /// finish signal isn't included.
    pub references: Vec<usize>,
    /// Output files of every worker, in slice order.
    pub workers: Vec<WorkerOutput>,
}

impl SieveOutcome {
    /// Returns all the primes below the limit: 2, then the primes of every
    /// slice in order.
    pub fn primes(&self) -> Result<Vec<usize>, SieveError> {
        let mut primes = vec![2];
        for worker in &self.workers {
            primes.extend(worker.read_primes()?);
        }
        Ok(primes)
    }

    /// Removes the files written by the workers.
    pub fn remove_files(&self) -> Result<(), SieveError> {
        for worker in &self.workers {
            std::fs::remove_file(&worker.primes).map_err(SieveError::io("remove primes file"))?;
            std::fs::remove_file(&worker.timing).map_err(SieveError::io("remove timing file"))?;
        }
        Ok(())
    }
}
