// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.


#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod affinity;
mod config;
mod error;
mod macros;
mod memory;
mod output;
mod partition;
mod process;
mod round;
mod strike;
mod thread;

pub use affinity::CpuPinningPolicy;
pub use config::{run, Mode, SieveConfig};
pub use error::{ConfigError, SieveError, MIN_LIMIT};
pub use memory::{HeapMemory, HeapRegion, Memory, Role, SharedMemory, SharedRegion, Zeroable};
pub use output::{SieveOutcome, WorkerOutput, WorkerTiming};
pub use partition::{partition, Partition, Slice, FIRST_CANDIDATE};
pub use round::{coordinate, next_reference, RoundCoordinator, FIRST_REFERENCE};
pub use strike::{serial_sieve, strike, SENTINEL};
