//! In-memory result log.
//!
//! [`ResultLog`] is the stock [`TestDatabase`] used by the CLI. It keeps all
//! records, per test case statistics and the latest campaign counters, and
//! notifies registered listeners about every change.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{CampaignCounters, TestDatabase, TestResultRecord, Verdict};

/// Handle returned by [`ResultLog::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Change notification delivered to listeners.
#[derive(Debug)]
pub enum LogEvent<'a> {
    ResultAppended {
        index: usize,
        record: &'a TestResultRecord,
        background: bool,
    },
    CampaignStatsUpdated(&'a CampaignCounters),
    CampaignReset {
        expected: u64,
        is_resume: bool,
    },
    JobCountChanged(usize),
    TestCaseStatsUpdated {
        test_case: &'a str,
        stats: &'a TestCaseStats,
    },
}

/// Accumulated statistics of one test case in the current campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestCaseStats {
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total_duration_ms: u64,

    /// Executable timestamp of the most recent result.
    pub executable_timestamp: u64,
}

type Listener = Box<dyn FnMut(&LogEvent<'_>) + Send>;

/// Result store with listener notification.
#[derive(Default)]
pub struct ResultLog {
    results: Vec<TestResultRecord>,
    test_cases: BTreeMap<String, TestCaseStats>,
    counters: CampaignCounters,
    job_count: usize,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener that is invoked for every [`LogEvent`].
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&LogEvent<'_>) + Send + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Removes a listener. Returns false if the id was not registered.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Makes the given test cases known, with empty statistics.
    pub fn register_test_cases<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.test_cases.entry(name.into()).or_default();
        }
    }

    /// Appends records without notifying listeners or touching statistics.
    ///
    /// Used for bulk loading of imported trace files.
    pub fn import_results<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = TestResultRecord>,
    {
        self.results.extend(records);
    }

    /// Deletes the records at the given indices.
    ///
    /// Campaign statistics are not adjusted. Indices out of range are ignored.
    pub fn delete_results(&mut self, indices: &[usize]) {
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut remove = sorted.into_iter().peekable();
        let mut idx = 0;
        self.results.retain(|_| {
            let drop = remove.next_if_eq(&idx).is_some();
            idx += 1;
            !drop
        });
    }

    pub fn results(&self) -> &[TestResultRecord] {
        &self.results
    }

    /// Mutable access for trace file maintenance, which rewrites byte ranges.
    pub fn results_mut(&mut self) -> &mut Vec<TestResultRecord> {
        &mut self.results
    }

    pub fn test_case_stats(&self, test_case: &str) -> Option<&TestCaseStats> {
        self.test_cases.get(test_case)
    }

    pub fn test_cases(&self) -> impl Iterator<Item = (&str, &TestCaseStats)> {
        self.test_cases.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Counters as last reported by the orchestrator.
    pub fn counters(&self) -> &CampaignCounters {
        &self.counters
    }

    pub fn job_count(&self) -> usize {
        self.job_count
    }

    fn notify(listeners: &mut [(ListenerId, Listener)], event: &LogEvent<'_>) {
        for (_, listener) in listeners.iter_mut() {
            listener(event);
        }
    }
}

impl TestDatabase for ResultLog {
    fn append_result(&mut self, record: TestResultRecord, background: bool) {
        let stats = self.test_cases.entry(record.test_case.clone()).or_default();
        match record.verdict {
            Verdict::Pass => stats.passed += 1,
            Verdict::Skipped => stats.skipped += 1,
            _ => stats.failed += 1,
        }
        stats.total_duration_ms += record.duration_ms;
        stats.executable_timestamp = record.executable_timestamp;

        self.results.push(record);
        let index = self.results.len() - 1;
        let record = &self.results[index];

        Self::notify(
            &mut self.listeners,
            &LogEvent::ResultAppended {
                index,
                record,
                background,
            },
        );
        if let Some(stats) = self.test_cases.get(&record.test_case) {
            Self::notify(
                &mut self.listeners,
                &LogEvent::TestCaseStatsUpdated {
                    test_case: &record.test_case,
                    stats,
                },
            );
        }
    }

    fn reset_campaign_stats(&mut self, expected: u64, is_resume: bool) {
        if !is_resume {
            for stats in self.test_cases.values_mut() {
                stats.passed = 0;
                stats.failed = 0;
                stats.skipped = 0;
                stats.total_duration_ms = 0;
            }
        }
        self.counters.reset(expected, is_resume);

        Self::notify(
            &mut self.listeners,
            &LogEvent::CampaignReset {
                expected,
                is_resume,
            },
        );
    }

    fn set_job_count(&mut self, count: usize) {
        self.job_count = count;
        Self::notify(&mut self.listeners, &LogEvent::JobCountChanged(count));
    }

    fn campaign_stats_updated(&mut self, counters: &CampaignCounters) {
        self.counters = counters.clone();
        Self::notify(
            &mut self.listeners,
            &LogEvent::CampaignStatsUpdated(&self.counters),
        );
    }
}
