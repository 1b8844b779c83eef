// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The coordinator side of the round protocol, common to both engines.
//!
//! Each round the coordinator publishes a reference value, every active
//! worker strikes its multiples and reports the smallest unmarked number of
//! its slice above it, and the minimum of these reports becomes the next
//! reference. A worker reporting [`SENTINEL`] has exhausted its slice and
//! takes no further part. Once the next reference is above `sqrt(limit)`,
//! [`SENTINEL`] itself is published, which makes every remaining worker
//! report [`SENTINEL`] without striking anything.

use crate::error::SieveError;
use crate::macros::log_debug;
use crate::strike::SENTINEL;

/// First reference value of a run.
pub const FIRST_REFERENCE: usize = 2;

/// Coordinator of a group of workers running the round protocol.
pub trait RoundCoordinator {
    /// Number of workers that haven't reported [`SENTINEL`] yet.
    fn active_workers(&self) -> usize;

    /// Publishes `reference` to the active workers, waits for exactly one
    /// report from each of them, and returns the minimum of the
    /// non-[`SENTINEL`] reports ([`SENTINEL`] if there is none). Workers that
    /// reported [`SENTINEL`] are no longer active afterwards.
    fn run_round(&mut self, reference: usize) -> Result<usize, SieveError>;
}

/// Returns the reference to publish after a round whose reports reduced to
/// `minimum`: `minimum` itself, or [`SENTINEL`] if no composite below `limit`
/// can be left unmarked.
pub fn next_reference(minimum: usize, limit: usize) -> usize {
    if minimum.saturating_mul(minimum) >= limit {
        SENTINEL
    } else {
        minimum
    }
}

/// Runs rounds until no worker is active, and returns the reference values
/// that were published, in order (excluding the final [`SENTINEL`]).
pub fn coordinate(
    coordinator: &mut impl RoundCoordinator,
    limit: usize,
) -> Result<Vec<usize>, SieveError> {
    let mut references = Vec::new();
    let mut reference = FIRST_REFERENCE;

    while coordinator.active_workers() != 0 {
        if reference != SENTINEL {
            debug_assert!(references.last().map_or(true, |last| *last < reference));
            references.push(reference);
        }
        log_debug!(
            "[coordinator] Round {} with reference {reference}, {} active worker(s)",
            references.len(),
            coordinator.active_workers()
        );

        let minimum = coordinator.run_round(reference)?;
        reference = next_reference(minimum, limit);
    }

    log_debug!(
        "[coordinator] All workers exhausted after {} reference(s)",
        references.len()
    );
    Ok(references)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::partition::{Partition, Slice};
    use crate::strike::{serial_sieve, strike};

    /// Runs the protocol on the current thread, striking every slice in turn.
    pub(crate) struct SequentialCoordinator {
        workers: Vec<(Slice, Vec<bool>, bool)>,
        rounds: usize,
    }

    impl SequentialCoordinator {
        pub(crate) fn new(partition: &Partition) -> Self {
            Self {
                workers: partition
                    .slices()
                    .map(|slice| (slice, vec![false; slice.len], true))
                    .collect(),
                rounds: 0,
            }
        }

        fn primes(&self) -> Vec<usize> {
            let mut primes = vec![2];
            for (slice, flags, _) in &self.workers {
                primes.extend(
                    flags
                        .iter()
                        .enumerate()
                        .filter(|(_, composite)| !**composite)
                        .map(|(i, _)| slice.start + i),
                );
            }
            primes
        }
    }

    impl RoundCoordinator for SequentialCoordinator {
        fn active_workers(&self) -> usize {
            self.workers.iter().filter(|(_, _, active)| *active).count()
        }

        fn run_round(&mut self, reference: usize) -> Result<usize, SieveError> {
            self.rounds += 1;
            let mut minimum = SENTINEL;
            for (slice, flags, active) in self.workers.iter_mut().filter(|w| w.2) {
                let local = if reference == SENTINEL {
                    SENTINEL
                } else {
                    strike(flags, slice.start, reference)
                };
                if local == SENTINEL {
                    *active = false;
                }
                minimum = minimum.min(local);
            }
            Ok(minimum)
        }
    }

    #[test]
    fn test_next_reference() {
        assert_eq!(next_reference(3, 10), 3);
        assert_eq!(next_reference(5, 25), SENTINEL);
        assert_eq!(next_reference(5, 26), 5);
        assert_eq!(next_reference(SENTINEL, 100), SENTINEL);
    }

    #[test]
    fn test_coordinate_limit_10() {
        let partition = Partition::new(10, 1).unwrap();
        let mut coordinator = SequentialCoordinator::new(&partition);
        let references = coordinate(&mut coordinator, 10).unwrap();
        assert_eq!(references, [2, 3]);
        // Two striking rounds, then the finish round.
        assert_eq!(coordinator.rounds, 3);
        assert_eq!(coordinator.active_workers(), 0);
        assert_eq!(coordinator.primes(), [2, 3, 5, 7]);
    }

    #[test]
    fn test_coordinate_exhausted_slices_drop_out() {
        // Slices [3, 5), [5, 7), [7, 9), [9, 11). The first one is exhausted
        // after striking 3.
        let partition = Partition::new(11, 4).unwrap();
        let mut coordinator = SequentialCoordinator::new(&partition);
        let references = coordinate(&mut coordinator, 11).unwrap();
        assert_eq!(references, [2, 3]);
        assert_eq!(coordinator.active_workers(), 0);
        assert_eq!(coordinator.primes(), [2, 3, 5, 7]);
    }

    #[test]
    fn test_coordinate_references_are_increasing_primes() {
        for (limit, num_jobs) in [(100, 3), (1000, 7), (1000, 997), (4099, 64)] {
            let partition = Partition::new(limit, num_jobs).unwrap();
            let mut coordinator = SequentialCoordinator::new(&partition);
            let references = coordinate(&mut coordinator, limit).unwrap();

            let primes = serial_sieve(limit);
            let expected = primes
                .iter()
                .copied()
                .take_while(|p| p * p < limit)
                .collect::<Vec<_>>();
            assert_eq!(references, expected);
            assert_eq!(coordinator.primes(), primes);
        }
    }
}
