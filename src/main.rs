// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.


//! Command-line front end of the parallel sieve.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::info;
use parasieve::{serial_sieve, CpuPinningPolicy, Mode, SieveConfig};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let start = Instant::now();
    let mode = match cli.mode {
        ModeCli::Serial => {
            let primes = serial_sieve(cli.limit);
            info!(
                "Found {} primes below {} in {:?}",
                primes.len(),
                cli.limit,
                start.elapsed()
            );
            let mut stdout = std::io::stdout().lock();
            for prime in primes {
                writeln!(stdout, "{prime}").context("failed to print primes")?;
            }
            return Ok(());
        }
        ModeCli::Process => Mode::Process,
        ModeCli::Thread => Mode::Thread,
    };

    let config = SieveConfig {
        limit: cli.limit,
        num_jobs: cli.jobs,
        mode,
        cpu_pinning: match cli.cpu_pinning {
            CpuPinningCli::No => CpuPinningPolicy::No,
            CpuPinningCli::IfSupported => CpuPinningPolicy::IfSupported,
            CpuPinningCli::Always => CpuPinningPolicy::Always,
        },
        output_dir: cli.output_dir,
    };
    let outcome = config
        .run()
        .with_context(|| format!("{mode:?} sieve below {} failed", cli.limit))?;
    info!(
        "Sieve finished in {:?} after {} rounds",
        start.elapsed(),
        outcome.references.len()
    );
    for worker in &outcome.workers {
        println!(
            "worker {}: [{}, {}) -> {}",
            worker.slice.id,
            worker.slice.start,
            worker.slice.end(),
            worker.primes.display()
        );
    }
    Ok(())
}

#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Exclusive upper bound: primes below it are computed.
    #[arg(long)]
    limit: usize,

    /// Number of workers. Ignored by the serial mode.
    #[arg(long, default_value_t = 1)]
    jobs: usize,

    /// Engine to run.
    #[arg(long, value_enum)]
    mode: ModeCli,

    /// Directory in which the workers write their files.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Policy to pin workers to CPUs.
    #[arg(long, value_enum, default_value_t = CpuPinningCli::No)]
    cpu_pinning: CpuPinningCli,
}

/// Engine to run.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ModeCli {
    /// Forked worker processes.
    Process,
    /// Worker threads.
    Thread,
    /// Single-threaded sieve printing the primes to standard output.
    Serial,
}

/// Policy to pin workers to CPUs.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CpuPinningCli {
    /// Don't pin workers.
    No,
    /// Pin workers if the platform supports it.
    IfSupported,
    /// Pin workers, failing if that isn't possible.
    Always,
}
