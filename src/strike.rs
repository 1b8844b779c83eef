// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The incremental marking primitive shared by both coordination engines.

use crate::partition::FIRST_CANDIDATE;

/// Value reported by a worker whose slice holds no unmarked number above the
/// last reference. Published as a reference, it tells workers to finish.
pub const SENTINEL: usize = usize::MAX;

/// Strikes out the multiples of `reference` in a slice and returns the
/// smallest unmarked number of the slice above `reference`, or [`SENTINEL`].
///
/// `flags[i]` tells whether `slice_start + i` is known to be composite. Only
/// the numbers in `[max(reference + 1, slice_start), slice_start + len)` are
/// examined: every number up to `reference` has already been settled by the
/// smaller references, provided that references are applied in strictly
/// increasing order.
///
/// The returned value is only the minimum of this slice: the coordinator
/// reduces it with the other slices' values to get the next reference.
///
/// Applying the same reference twice doesn't change any flag and returns the
/// same value.
pub fn strike(flags: &mut [bool], slice_start: usize, reference: usize) -> usize {
    debug_assert!(reference >= 2);
    let mut min_unmarked = SENTINEL;
    let first = (reference + 1).saturating_sub(slice_start);

    for (i, flag) in flags.iter_mut().enumerate().skip(first) {
        let num = slice_start + i;
        if num % reference == 0 {
            *flag = true;
        } else if !*flag && min_unmarked == SENTINEL {
            min_unmarked = num;
        }
    }

    min_unmarked
}

/// Runs the whole sieve on the current thread and returns the primes below
/// `limit`, in ascending order.
pub fn serial_sieve(limit: usize) -> Vec<usize> {
    if limit <= FIRST_CANDIDATE {
        return (2..limit).collect();
    }

    let mut composites = vec![false; limit - FIRST_CANDIDATE];
    let mut reference = 2;
    while reference != SENTINEL && reference.saturating_mul(reference) < limit {
        reference = strike(&mut composites, FIRST_CANDIDATE, reference);
    }

    std::iter::once(2)
        .chain(
            composites
                .iter()
                .enumerate()
                .filter(|(_, composite)| !**composite)
                .map(|(i, _)| i + FIRST_CANDIDATE),
        )
        .collect()
}
