// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Splitting of the candidate range `[3, limit - 1]` among workers.

use crate::error::{ConfigError, MIN_LIMIT};

/// First number stored in a slice. 2 is the implicit first reference value.
pub const FIRST_CANDIDATE: usize = 3;

/// A contiguous range of candidate numbers owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    /// Index of the owning worker.
    pub id: usize,
    /// First number of the slice.
    pub start: usize,
    /// Number of candidates in the slice.
    pub len: usize,
}

impl Slice {
    /// One past the last number of the slice.
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Computes `(slice_size, extra)` for splitting `[3, limit - 1]` among
/// `num_jobs` workers: every worker gets `slice_size` numbers, and the last
/// one additionally gets the `extra` remainder.
///
/// The caller must ensure that `1 <= num_jobs <= limit - 3`, which
/// [`Partition::new()`] checks.
pub fn partition(num_jobs: usize, limit: usize) -> (usize, usize) {
    let range = (limit - 1) - 2;
    (range / num_jobs, range % num_jobs)
}

/// A validated split of the candidate range among a fixed number of workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    limit: usize,
    num_jobs: usize,
    slice_size: usize,
    extra: usize,
}

impl Partition {
    /// Validates the bounds and computes the partition.
    pub fn new(limit: usize, num_jobs: usize) -> Result<Self, ConfigError> {
        if limit < MIN_LIMIT {
            return Err(ConfigError::LimitTooSmall { limit });
        }
        if num_jobs == 0 {
            return Err(ConfigError::NoJobs);
        }
        let max_jobs = limit - FIRST_CANDIDATE;
        if num_jobs > max_jobs {
            return Err(ConfigError::TooManyJobs { num_jobs, max_jobs });
        }

        let (slice_size, extra) = partition(num_jobs, limit);
        Ok(Self {
            limit,
            num_jobs,
            slice_size,
            extra,
        })
    }

    /// The exclusive upper bound of the sieve.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of workers.
    pub fn num_jobs(&self) -> usize {
        self.num_jobs
    }

    /// Size of every slice but the last one.
    pub fn slice_size(&self) -> usize {
        self.slice_size
    }

    /// Extra numbers appended to the last slice.
    pub fn extra(&self) -> usize {
        self.extra
    }

    /// Total number of candidates, i.e. `limit - 3`.
    pub fn num_candidates(&self) -> usize {
        self.limit - FIRST_CANDIDATE
    }

    /// Returns the slice of the given worker.
    ///
    /// # Panics
    ///
    /// Panics if `id` isn't a valid worker index.
    pub fn slice(&self, id: usize) -> Slice {
        assert!(id < self.num_jobs, "worker #{id} out of range");
        let len = if id == self.num_jobs - 1 {
            self.slice_size + self.extra
        } else {
            self.slice_size
        };
        Slice {
            id,
            start: FIRST_CANDIDATE + id * self.slice_size,
            len,
        }
    }

    /// Iterates over the slices of all workers, in order.
    pub fn slices(&self) -> impl ExactSizeIterator<Item = Slice> + '_ {
        (0..self.num_jobs).map(|id| self.slice(id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;

    fn sizes(partition: &Partition) -> Vec<usize> {
        partition.slices().map(|slice| slice.len).collect()
    }

    #[test]
    fn test_even_split() {
        assert_eq!(partition(3, 18), (5, 0));
        let partition = Partition::new(18, 3).unwrap();
        assert_eq!(sizes(&partition), [5, 5, 5]);
        assert_eq!(
            partition.slices().map(|slice| slice.start).collect::<Vec<_>>(),
            [3, 8, 13]
        );
    }

    #[test]
    fn test_last_slice_takes_extra() {
        assert_eq!(partition(3, 20), (5, 2));
        let three_jobs = Partition::new(20, 3).unwrap();
        assert_eq!(sizes(&three_jobs), [5, 5, 7]);
        assert_eq!(three_jobs.slice(2).start, 13);
        assert_eq!(three_jobs.slice(2).end(), 20);

        assert_eq!(partition(4, 12), (2, 1));
        let four_jobs = Partition::new(12, 4).unwrap();
        assert_eq!(sizes(&four_jobs), [2, 2, 2, 3]);
    }

    #[test]
    fn test_single_job() {
        let partition = Partition::new(10, 1).unwrap();
        assert_eq!(
            partition.slice(0),
            Slice {
                id: 0,
                start: 3,
                len: 7
            }
        );
    }

    #[test]
    fn test_rejects_bad_bounds() {
        assert_eq!(
            Partition::new(9, 1),
            Err(ConfigError::LimitTooSmall { limit: 9 })
        );
        assert_eq!(Partition::new(100, 0), Err(ConfigError::NoJobs));
        assert_eq!(
            Partition::new(10, 8),
            Err(ConfigError::TooManyJobs {
                num_jobs: 8,
                max_jobs: 7
            })
        );
        // One number per worker is the tightest valid split.
        assert_eq!(sizes(&Partition::new(10, 7).unwrap()), [1; 7]);
    }

    #[test]
    fn test_slices_cover_range() {
        let mut rng = ChaCha12Rng::seed_from_u64(42);
        for _ in 0..1000 {
            let limit = rng.random_range(10..10_000);
            let num_jobs = rng.random_range(1..=limit - 3);
            let partition = Partition::new(limit, num_jobs).unwrap();

            let mut next = FIRST_CANDIDATE;
            for slice in partition.slices() {
                assert_eq!(slice.start, next);
                assert!(slice.len > 0);
                next = slice.end();
            }
            assert_eq!(next, limit);
            assert_eq!(sizes(&partition).iter().sum::<usize>(), limit - 3);
        }
    }
}
