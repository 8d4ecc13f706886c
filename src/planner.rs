//! Sharding and repetition planning.
//!
//! This module decides how a campaign of `tests × repetitions` executions is
//! spread over a fixed number of worker processes. Plain GoogleTest sharding
//! only splits the test list, which does not help when a single test is
//! repeated many times, or when the test count is small and not divisible by
//! the number of workers. The planner therefore partitions the workers into
//! *shard groups*: all workers of one group share a shard count equal to the
//! group size and jointly run the filtered test list once per repetition
//! assigned to the group. Repetitions are then balanced across groups so that
//! the busiest worker has as little work as possible.
//!
//! # Strategy
//!
//! | Step | Description |
//! |------|-------------|
//! | Enumerate | Candidate group-size lists, built from the distinct values of `ceil(tests / d)` |
//! | Estimate | Split repetitions proportionally to the inverse per-worker test count |
//! | Balance | Hand out the remaining repetitions one at a time to the least loaded group |
//! | Select | Keep the candidate with the smallest maximum per-worker execution count |
//!
//! Workers configured to "always run all" tests are appended as one-worker
//! groups that run the unfiltered suite for the full repetition count.
//!
//! # Example
//!
//! ```
//! use gtrun::planner::plan;
//!
//! // 10 tests, run once, on 4 workers: one group of 4 shards.
//! let entries = plan(10, 1, 4, 0);
//! assert_eq!(entries.len(), 4);
//! assert!(entries.iter().all(|e| e.shard_count == 4 && e.repetitions == 1));
//!
//! // A single test repeated 100 times: no sharding, repetitions split 4 ways.
//! let entries = plan(1, 100, 4, 0);
//! assert!(entries.iter().all(|e| e.shard_count == 1 && e.repetitions == 25));
//! ```

use serde::Serialize;
use tracing::debug;

/// Parameters for one worker process of a campaign.
///
/// Produced by [`plan`] and consumed exactly once by the orchestrator when it
/// launches the corresponding job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionPlanEntry {
    /// Value passed as `--gtest_repeat`.
    pub repetitions: u32,

    /// Number of shards the test list is split into (`GTEST_TOTAL_SHARDS`).
    pub shard_count: u32,

    /// This worker's shard (`GTEST_SHARD_INDEX`).
    pub shard_index: u32,

    /// Worker runs the unfiltered suite in the background.
    pub is_background: bool,
}

impl PartitionPlanEntry {
    /// Number of test executions this worker is expected to report.
    pub fn expected_results(&self, test_count: usize) -> u64 {
        tests_per_shard(
            test_count,
            self.repetitions,
            self.shard_count,
            self.shard_index,
        )
    }
}

/// Computes the partition plan for a campaign.
///
/// Returns one entry per worker, grouped by shard group. Degenerate input
/// (zero tests, repetitions or workers) yields a single entry that carries the
/// inputs through unchanged.
pub fn plan(
    test_count: usize,
    repetitions: u32,
    worker_count: usize,
    always_run_all_count: usize,
) -> Vec<PartitionPlanEntry> {
    if test_count == 0 || repetitions == 0 || worker_count == 0 {
        return vec![PartitionPlanEntry {
            repetitions,
            shard_count: worker_count as u32,
            shard_index: 0,
            is_background: false,
        }];
    }

    let run_all = always_run_all_count.min(worker_count);
    let filtered = worker_count - run_all;

    let mut groups = Vec::new();
    if filtered > 0 {
        let candidates = enumerate_partitions(&[], filtered, test_count, filtered);
        let (sizes, reps) = balance_repetitions(&candidates, test_count, repetitions);
        debug!(
            "Sharding {} tests x {} over {} workers: groups {:?}, repetitions {:?}",
            test_count, repetitions, filtered, sizes, reps
        );
        groups.extend(sizes.into_iter().zip(reps).map(|(size, reps)| (size, reps, false)));
    }
    groups.extend(std::iter::repeat_n((1, repetitions, true), run_all));

    groups
        .into_iter()
        .flat_map(|(size, reps, is_background)| {
            (0..size).map(move |index| PartitionPlanEntry {
                repetitions: reps,
                shard_count: size as u32,
                shard_index: index as u32,
                is_background,
            })
        })
        .collect()
}

/// Number of results a worker with the given shard parameters will produce.
///
/// GoogleTest assigns test `i` to shard `i % shard_count`, so the first
/// `tests % shard_count` shards receive one extra test.
pub fn tests_per_shard(
    test_count: usize,
    repetitions: u32,
    shard_count: u32,
    shard_index: u32,
) -> u64 {
    let shard_count = shard_count.max(1) as usize;
    let div = test_count / shard_count;
    let rem = test_count % shard_count;
    let per_pass = if (shard_index as usize) < rem { div + 1 } else { div };
    per_pass as u64 * u64::from(repetitions)
}

/// Recursively lists candidate group-size lists for `workers` workers.
///
/// Group sizes are the distinct values of `ceil(tests / d)` for growing `d`,
/// limited to `max_size`. Workers left over after taking as many groups of
/// one size as fit are partitioned recursively with smaller sizes.
fn enumerate_partitions(
    prefix: &[usize],
    workers: usize,
    test_count: usize,
    max_size: usize,
) -> Vec<Vec<usize>> {
    let mut partitions = Vec::new();
    let mut prev_size = 0;
    let mut divisor = 1;

    loop {
        let size = test_count.div_ceil(divisor);

        if size != prev_size && size <= max_size {
            if size > 1 {
                let count = workers / size;
                let mut part = prefix.to_vec();
                part.extend(std::iter::repeat_n(size, count));
                let remainder = workers - size * count;

                if remainder > 0 {
                    partitions.extend(enumerate_partitions(
                        &part,
                        remainder,
                        test_count,
                        remainder.min(size),
                    ));
                } else {
                    partitions.push(part);
                }
            } else {
                let mut part = prefix.to_vec();
                part.extend(std::iter::repeat_n(1, workers));
                partitions.push(part);
            }
        }

        prev_size = size;
        if size <= 1 {
            break;
        }
        divisor += 1;
    }

    if partitions.is_empty() {
        let mut part = prefix.to_vec();
        part.push(workers);
        partitions.push(part);
    }

    partitions
}

/// Assigns repetitions to the groups of each candidate and picks the best.
///
/// Returns the chosen group sizes and the repetition count of each group.
/// Ties keep the earliest candidate.
fn balance_repetitions(
    candidates: &[Vec<usize>],
    test_count: usize,
    repetitions: u32,
) -> (Vec<usize>, Vec<u32>) {
    let mut best: Option<(u64, &Vec<usize>, Vec<u32>)> = None;

    for sizes in candidates {
        let per_worker: Vec<u64> = sizes
            .iter()
            .map(|&size| test_count.div_ceil(size) as u64)
            .collect();

        // Initial estimate proportional to the inverse per-worker test count,
        // which keeps the greedy loop below short for large repetition counts.
        let ratios: Vec<f64> = per_worker
            .iter()
            .map(|&n| per_worker[0] as f64 / n as f64)
            .collect();
        let ratio_sum: f64 = ratios.iter().sum();
        let mut reps: Vec<u32> = ratios
            .iter()
            .map(|r| (f64::from(repetitions) / ratio_sum * r) as u32)
            .collect();
        let mut load: Vec<u64> = per_worker
            .iter()
            .zip(&reps)
            .map(|(&n, &r)| n * u64::from(r))
            .collect();

        let assigned: u32 = reps.iter().sum();
        for _ in assigned..repetitions {
            let mut min_idx = 0;
            let mut min_load = load[0] + per_worker[0];
            for idx in 1..per_worker.len() {
                if load[idx] + per_worker[idx] < min_load {
                    min_idx = idx;
                    min_load = load[idx] + per_worker[idx];
                }
            }
            load[min_idx] = min_load;
            reps[min_idx] += 1;
        }

        let max_load = load.iter().copied().max().unwrap_or(0);
        if best.as_ref().is_none_or(|(best_load, _, _)| max_load < *best_load) {
            best = Some((max_load, sizes, reps));
        }
    }

    match best {
        Some((_, sizes, reps)) => (sizes.clone(), reps),
        None => (Vec::new(), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Largest per-worker execution count of a plan.
    fn max_worker_load(entries: &[PartitionPlanEntry], test_count: usize) -> u64 {
        entries
            .iter()
            .filter(|e| !e.is_background)
            .map(|e| test_count.div_ceil(e.shard_count as usize) as u64 * u64::from(e.repetitions))
            .max()
            .unwrap_or(0)
    }

    /// All partitions of `n` into non-increasing parts.
    fn integer_partitions(n: usize, max_part: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![Vec::new()];
        }
        let mut result = Vec::new();
        for part in (1..=n.min(max_part)).rev() {
            for mut rest in integer_partitions(n - part, part) {
                rest.insert(0, part);
                result.push(rest);
            }
        }
        result
    }

    /// Smallest achievable maximum over every group split and repetition split.
    fn brute_force_min_max(test_count: usize, workers: usize, repetitions: u32) -> u64 {
        fn best_split(loads: &[u64], left: u32) -> u64 {
            match loads.split_first() {
                None if left == 0 => 0,
                None => u64::MAX,
                Some((&load, rest)) => (0..=left)
                    .map(|k| (load * u64::from(k)).max(best_split(rest, left - k)))
                    .min()
                    .unwrap_or(u64::MAX),
            }
        }

        integer_partitions(workers, workers)
            .iter()
            .map(|sizes| {
                let loads: Vec<u64> = sizes
                    .iter()
                    .map(|&g| test_count.div_ceil(g) as u64)
                    .collect();
                best_split(&loads, repetitions)
            })
            .min()
            .unwrap_or(u64::MAX)
    }

    #[test]
    fn test_plan_even_sharding() {
        let entries = plan(10, 1, 4, 0);

        assert_eq!(entries.len(), 4);
        for (idx, entry) in entries.iter().enumerate() {
            assert_eq!(entry.shard_count, 4);
            assert_eq!(entry.shard_index, idx as u32);
            assert_eq!(entry.repetitions, 1);
            assert!(!entry.is_background);
        }
        assert_eq!(max_worker_load(&entries, 10), 3);
    }

    #[test]
    fn test_plan_single_test_splits_repetitions() {
        let entries = plan(1, 100, 4, 0);

        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|e| e.shard_count == 1));
        assert!(entries.iter().all(|e| e.repetitions == 25));
    }

    #[test]
    fn test_plan_degenerate_inputs() {
        for (tests, reps, workers) in [(0, 5, 4), (10, 0, 4), (10, 5, 0)] {
            let entries = plan(tests, reps, workers, 0);
            assert_eq!(
                entries,
                vec![PartitionPlanEntry {
                    repetitions: reps,
                    shard_count: workers as u32,
                    shard_index: 0,
                    is_background: false,
                }]
            );
        }
    }

    #[test]
    fn test_plan_background_workers_appended() {
        let entries = plan(8, 3, 4, 1);

        assert_eq!(entries.len(), 4);
        let background: Vec<_> = entries.iter().filter(|e| e.is_background).collect();
        assert_eq!(background.len(), 1);
        assert_eq!(background[0].shard_count, 1);
        assert_eq!(background[0].repetitions, 3);
        assert!(entries.last().is_some_and(|e| e.is_background));
    }

    #[test]
    fn test_plan_only_background_workers() {
        let entries = plan(8, 2, 2, 5);

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.is_background && e.repetitions == 2));
    }

    #[test]
    fn test_plan_more_workers_than_tests() {
        let entries = plan(2, 1, 6, 0);

        assert_eq!(entries.len(), 6);
        assert_eq!(max_worker_load(&entries, 2), 1);
    }

    #[test]
    fn test_tests_per_shard_remainder() {
        // 10 tests over 4 shards: 3, 3, 2, 2
        assert_eq!(tests_per_shard(10, 1, 4, 0), 3);
        assert_eq!(tests_per_shard(10, 1, 4, 1), 3);
        assert_eq!(tests_per_shard(10, 1, 4, 2), 2);
        assert_eq!(tests_per_shard(10, 1, 4, 3), 2);
        assert_eq!(tests_per_shard(10, 5, 4, 3), 10);
        assert_eq!(tests_per_shard(10, 2, 1, 0), 20);
    }

    #[test]
    fn test_plan_matches_brute_force_for_small_inputs() {
        for tests in 1..=6 {
            for workers in 1..=6 {
                for reps in 1..=6u32 {
                    let entries = plan(tests, reps, workers, 0);
                    let optimum = brute_force_min_max(tests, workers, reps);
                    assert!(
                        max_worker_load(&entries, tests) <= optimum,
                        "tests={} workers={} reps={}: plan {:?} exceeds optimum {}",
                        tests,
                        workers,
                        reps,
                        entries,
                        optimum
                    );
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(300))]

        #[test]
        fn test_plan_conserves_executions(
            tests in 1usize..200,
            reps in 1u32..500,
            workers in 1usize..24,
        ) {
            let entries = plan(tests, reps, workers, 0);

            prop_assert_eq!(entries.len(), workers);
            let total: u64 = entries.iter().map(|e| e.expected_results(tests)).sum();
            prop_assert_eq!(total, tests as u64 * u64::from(reps));
        }

        #[test]
        fn test_plan_shard_indices_cover_each_group(
            tests in 1usize..100,
            reps in 1u32..50,
            workers in 1usize..16,
            background in 0usize..3,
        ) {
            let entries = plan(tests, reps, workers, background);

            prop_assert_eq!(entries.len(), workers);
            let mut idx = 0;
            while idx < entries.len() {
                let count = entries[idx].shard_count as usize;
                prop_assert!(count >= 1);
                for shard in 0..count {
                    prop_assert_eq!(entries[idx + shard].shard_index as usize, shard);
                    prop_assert_eq!(entries[idx + shard].repetitions, entries[idx].repetitions);
                }
                idx += count;
            }
        }
    }
}
