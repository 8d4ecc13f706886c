//! Campaign orchestration.
//!
//! The [`Orchestrator`] turns a partition plan into running workers and
//! forwards their results to a [`TestDatabase`].
//!
//! # Architecture
//!
//! ```text
//!   start(options)
//!        │
//!        │ planner::plan()
//!        ▼
//!  Vec<PartitionPlanEntry> ── Job::spawn() ──► SharedJobs (Arc<Mutex<Vec<Job>>>)
//!                                                   │
//!                                                   │ communicate()
//!                                                   ▼
//!                                              I/O task (io_loop)
//!                                                   │
//!                                                   │ JobEvent
//!                                                   ▼
//!                                            unbounded channel
//!                                                   │
//!          drain() every drain interval ◄───────────┘
//!                │
//!                ├─► CampaignCounters
//!                └─► TestDatabase::append_result / set_job_count
//! ```
//!
//! # Campaign states
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Idle` | no campaign, [`Orchestrator::start`] accepted |
//! | `Running` | workers are executing |
//! | `StopRequested` | workers were asked to terminate |
//! | `Draining` | foreground workers are done, background workers are being stopped |
//!
//! The I/O task is the only producer of the result channel and
//! [`Orchestrator::drain`] its only consumer. The job list lock is held only
//! for the duration of one parse pass or one signal delivery.

pub mod io_loop;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::bytes::Regex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::{self, ArtifactError, ArtifactManager};
use crate::job::{Job, JobError, JobSpec, JobStats, WorkerCommand};
use crate::planner::{self, PartitionPlanEntry};
use crate::results::{CampaignCounters, JobEvent, TestDatabase};

pub use io_loop::SharedJobs;
use io_loop::lock_jobs;

/// Errors when starting a campaign.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("A campaign is already running")]
    AlreadyRunning,

    #[error("Nothing to run: {tests} tests, {repetitions} repetitions, {jobs} jobs")]
    NothingToRun {
        tests: usize,
        repetitions: u32,
        jobs: usize,
    },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("No worker could be started: {0}")]
    NoJobsStarted(JobError),
}

/// Lifecycle state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignState {
    Idle,
    Running,
    StopRequested,
    Draining,
}

/// Settings that stay fixed for the lifetime of an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Directory where the OS writes `core.<pid>` files.
    pub core_dir: PathBuf,

    /// Minimum spacing between I/O passes.
    pub poll_interval: Duration,

    /// Period at which callers are expected to call [`Orchestrator::drain`].
    pub drain_interval: Duration,
}

/// Shortest interval accepted for I/O passes and draining.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            core_dir: PathBuf::from("."),
            poll_interval: Duration::from_millis(150),
            drain_interval: Duration::from_millis(250),
        }
    }
}

/// Options of one campaign.
#[derive(Debug, Clone)]
pub struct CampaignOptions {
    pub executable: PathBuf,

    /// Number of test cases selected by `filter`.
    pub test_count: usize,
    pub repetitions: u32,

    /// Total number of workers, including background workers.
    pub jobs: usize,

    /// Workers that run the whole unfiltered suite in the background.
    pub background_jobs: usize,

    pub filter: String,
    pub run_disabled: bool,
    pub shuffle: bool,
    pub break_on_failure: bool,
    pub break_on_exception: bool,

    /// Wrapping tool command line, empty for none.
    pub tool: Vec<String>,
    pub tool_error_exit_code: Option<i32>,

    /// Stop after this many failures, 0 for no limit.
    pub max_failures: u64,

    pub clean_passed: bool,
    pub clean_core: bool,
    pub seed_pattern: Option<Regex>,

    /// Keep the completed count of the previous campaign.
    pub is_resume: bool,
}

impl Default for CampaignOptions {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            test_count: 0,
            repetitions: 1,
            jobs: 1,
            background_jobs: 0,
            filter: String::new(),
            run_disabled: false,
            shuffle: false,
            break_on_failure: false,
            break_on_exception: false,
            tool: Vec::new(),
            tool_error_exit_code: None,
            max_failures: 0,
            clean_passed: true,
            clean_core: false,
            seed_pattern: None,
            is_resume: false,
        }
    }
}

/// Outcome of [`Orchestrator::start`].
#[derive(Debug)]
pub struct StartReport {
    pub plan: Vec<PartitionPlanEntry>,

    /// Pids of the started workers.
    pub started: Vec<u32>,

    /// Workers that could not be started. The campaign runs without them.
    pub spawn_failures: Vec<JobError>,

    pub trace_dir: PathBuf,
}

/// Drives campaigns and forwards results to the database `D`.
pub struct Orchestrator<D> {
    db: D,
    artifacts: ArtifactManager,
    settings: RunnerSettings,

    jobs: SharedJobs,
    events_tx: UnboundedSender<JobEvent>,
    events_rx: UnboundedReceiver<JobEvent>,
    io_task: Option<(CancellationToken, JoinHandle<()>)>,

    state: CampaignState,
    counters: CampaignCounters,
    max_failures: u64,
    stop_requested: bool,
    background_stopped: bool,

    /// Executable and timestamp of the current campaign.
    executable: Option<(PathBuf, u64)>,
}

impl<D: TestDatabase> Orchestrator<D> {
    /// Intervals shorter than [`MIN_INTERVAL`] are raised to it.
    pub fn new(db: D, artifacts: ArtifactManager, mut settings: RunnerSettings) -> Self {
        settings.poll_interval = settings.poll_interval.max(MIN_INTERVAL);
        settings.drain_interval = settings.drain_interval.max(MIN_INTERVAL);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            db,
            artifacts,
            settings,
            jobs: SharedJobs::default(),
            events_tx,
            events_rx,
            io_task: None,
            state: CampaignState::Idle,
            counters: CampaignCounters::default(),
            max_failures: 0,
            stop_requested: false,
            background_stopped: false,
            executable: None,
        }
    }

    /// Starts a campaign.
    ///
    /// Workers that fail to start are reported in the returned
    /// [`StartReport`]; the campaign fails only if none could be started.
    /// Must be called within a tokio runtime.
    pub fn start(&mut self, options: CampaignOptions) -> Result<StartReport, CampaignError> {
        if self.state != CampaignState::Idle {
            return Err(CampaignError::AlreadyRunning);
        }
        if options.test_count == 0 || options.repetitions == 0 || options.jobs == 0 {
            return Err(CampaignError::NothingToRun {
                tests: options.test_count,
                repetitions: options.repetitions,
                jobs: options.jobs,
            });
        }

        let timestamp =
            artifacts::executable_timestamp(&options.executable).map_err(ArtifactError::from)?;
        let trace_dir = self.artifacts.ensure_trace_dir(timestamp)?;
        let launch = self.artifacts.link_executable(&options.executable, timestamp)?;
        let first_index = self.artifacts.first_free_trace_index(timestamp)?;

        let plan = planner::plan(
            options.test_count,
            options.repetitions,
            options.jobs,
            options.background_jobs,
        );

        let mut started = Vec::new();
        let mut spawn_failures = Vec::new();
        let mut expected = 0;
        {
            let mut jobs = lock_jobs(&self.jobs);
            for (offset, entry) in plan.iter().enumerate() {
                if entry.repetitions == 0 {
                    debug!("Skipping worker {} without repetitions", offset);
                    continue;
                }
                let expected_results = entry.expected_results(options.test_count);
                let spec = self.job_spec(
                    &options,
                    entry,
                    &launch,
                    timestamp,
                    first_index + offset as u32,
                    expected_results,
                );
                match Job::spawn(spec, self.events_tx.clone()) {
                    Ok(job) => {
                        if !entry.is_background {
                            expected += expected_results;
                        }
                        started.push(job.pid());
                        jobs.push(job);
                    }
                    Err(e) => {
                        warn!("{}", e);
                        spawn_failures.push(e);
                    }
                }
            }
        }

        if started.is_empty() {
            self.artifacts
                .release_executable_copy(&options.executable, timestamp);
            let first = spawn_failures.into_iter().next().ok_or(CampaignError::NothingToRun {
                tests: options.test_count,
                repetitions: options.repetitions,
                jobs: options.jobs,
            })?;
            return Err(CampaignError::NoJobsStarted(first));
        }

        self.counters.reset(expected, options.is_resume);
        self.counters.started_at = Some(Utc::now());
        self.counters.running = started.len();
        self.db.reset_campaign_stats(expected, options.is_resume);
        self.db.set_job_count(started.len());
        self.db.campaign_stats_updated(&self.counters);

        let cancel = CancellationToken::new();
        let task = io_loop::spawn(
            Arc::clone(&self.jobs),
            cancel.clone(),
            self.settings.poll_interval,
        );
        self.io_task = Some((cancel, task));

        self.max_failures = options.max_failures;
        self.stop_requested = false;
        self.background_stopped = false;
        self.executable = Some((options.executable, timestamp));
        self.state = CampaignState::Running;

        info!(
            "Campaign started: {} workers, {} results expected, traces in {}",
            started.len(),
            expected,
            trace_dir.display()
        );

        Ok(StartReport {
            plan,
            started,
            spawn_failures,
            trace_dir,
        })
    }

    fn job_spec(
        &self,
        options: &CampaignOptions,
        entry: &PartitionPlanEntry,
        launch: &Path,
        timestamp: u64,
        index: u32,
        expected_results: u64,
    ) -> JobSpec {
        let filter = if entry.is_background {
            ""
        } else {
            options.filter.as_str()
        };
        let command = WorkerCommand::new(launch)
            .tool(options.tool.clone(), options.tool_error_exit_code)
            .repeat(entry.repetitions)
            .filter(filter)
            .run_disabled(options.run_disabled)
            .shuffle(options.shuffle)
            .break_on_failure(options.break_on_failure)
            .break_on_exception(options.break_on_exception)
            .sharding(entry.shard_count, entry.shard_index);

        JobSpec {
            command,
            trace_file: self.artifacts.trace_file_path(timestamp, index),
            background: entry.is_background,
            expected_results,
            executable: options.executable.clone(),
            executable_timestamp: timestamp,
            core_dir: self.settings.core_dir.clone(),
            tool_core_prefix: self.artifacts.tool_core_prefix().to_string(),
            clean_passed: options.clean_passed,
            clean_core: options.clean_core,
            seed_pattern: options.seed_pattern.clone(),
        }
    }

    /// Moves queued results into the database and applies the stopping
    /// policy.
    ///
    /// Call this every [`RunnerSettings::drain_interval`]. Returns whether
    /// the campaign is still active.
    pub fn drain(&mut self) -> bool {
        let mut exited = HashSet::new();
        let mut updated = false;
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                JobEvent::Result { record, background } => {
                    self.counters.record(record.verdict, background);
                    self.db.append_result(record, background);
                    updated = true;
                }
                JobEvent::Exited { pid } => {
                    exited.insert(pid);
                }
            }
        }

        if self.state == CampaignState::Idle {
            return false;
        }

        let (running, foreground) = {
            let mut jobs = lock_jobs(&self.jobs);
            jobs.retain(|job| !exited.contains(&job.pid()));
            let foreground = jobs.iter().filter(|job| !job.is_background()).count();
            (jobs.len(), foreground)
        };
        if running != self.counters.running {
            self.counters.running = running;
            self.db.set_job_count(running);
            updated = true;
        }
        if updated {
            self.db.campaign_stats_updated(&self.counters);
        }

        let failures = self.counters.failed + self.counters.meta_errors;
        if self.max_failures > 0 && failures >= self.max_failures && !self.stop_requested {
            info!("Reached {} failures, stopping campaign", failures);
            self.stop(false);
        }

        if running > 0 && foreground == 0 && !self.background_stopped {
            info!("All foreground workers finished, stopping background workers");
            self.background_stopped = true;
            for job in lock_jobs(&self.jobs).iter_mut() {
                job.terminate(false);
            }
            if self.state == CampaignState::Running {
                self.state = CampaignState::Draining;
            }
        }

        if running == 0 {
            self.finish_campaign();
            return false;
        }
        true
    }

    fn finish_campaign(&mut self) {
        if let Some((cancel, _task)) = self.io_task.take() {
            cancel.cancel();
        }
        if let Some((executable, timestamp)) = self.executable.take() {
            self.artifacts.release_executable_copy(&executable, timestamp);
        }
        self.state = CampaignState::Idle;
        info!(
            "Campaign finished: {} passed, {} failed, {} skipped, {} errors",
            self.counters.passed,
            self.counters.failed,
            self.counters.skipped,
            self.counters.meta_errors
        );
    }

    /// Stops the campaign.
    ///
    /// The first call asks all workers to terminate. A second call, or
    /// `force`, kills them and empties the job list without waiting for
    /// their exit. Does nothing when no campaign is active.
    pub fn stop(&mut self, force: bool) {
        if self.state == CampaignState::Idle {
            return;
        }

        if force || self.stop_requested {
            let killed: Vec<Job> = {
                let mut jobs = lock_jobs(&self.jobs);
                for job in jobs.iter_mut() {
                    job.terminate(true);
                }
                jobs.drain(..).collect()
            };
            info!("Killed {} workers", killed.len());
        } else {
            let mut jobs = lock_jobs(&self.jobs);
            for job in jobs.iter_mut() {
                job.terminate(false);
            }
            info!("Asked {} workers to terminate", jobs.len());
        }
        self.stop_requested = true;
        self.state = CampaignState::StopRequested;
    }

    /// Sends an abort signal to one worker so it dumps core.
    ///
    /// Returns false if no running worker has this pid.
    pub fn abort_job(&self, pid: u32) -> bool {
        let mut jobs = lock_jobs(&self.jobs);
        match jobs.iter_mut().find(|job| job.pid() == pid && !job.is_finished()) {
            Some(job) => {
                job.abort();
                true
            }
            None => {
                debug!("No running worker with pid {}", pid);
                false
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != CampaignState::Idle
    }

    pub fn state(&self) -> CampaignState {
        self.state
    }

    /// Number of workers in the active set.
    pub fn job_count(&self) -> usize {
        lock_jobs(&self.jobs).len()
    }

    pub fn job_stats(&self) -> Vec<JobStats> {
        lock_jobs(&self.jobs)
            .iter()
            .filter(|job| !job.is_finished())
            .map(Job::stats)
            .collect()
    }

    /// Trace files still written by running workers.
    pub fn active_trace_files(&self) -> HashSet<PathBuf> {
        lock_jobs(&self.jobs)
            .iter()
            .map(|job| job.trace_file().to_path_buf())
            .collect()
    }

    /// Changes the cleanup options of the running workers.
    pub fn update_cleanup_options(&self, clean_passed: bool, clean_core: bool) {
        for job in lock_jobs(&self.jobs).iter_mut() {
            job.update_cleanup_options(clean_passed, clean_core);
        }
    }

    pub fn counters(&self) -> &CampaignCounters {
        &self.counters
    }

    pub fn artifacts(&self) -> &ArtifactManager {
        &self.artifacts
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut D {
        &mut self.db
    }

    /// Drains periodically until the campaign is idle.
    pub async fn wait_idle(&mut self) {
        let mut interval = tokio::time::interval(self.settings.drain_interval);
        loop {
            interval.tick().await;
            if !self.drain() {
                break;
            }
        }
    }
}

impl<D> Drop for Orchestrator<D> {
    fn drop(&mut self) {
        let mut jobs = lock_jobs(&self.jobs);
        for job in jobs.iter_mut() {
            job.terminate(true);
        }
        jobs.clear();
        drop(jobs);
        if let Some((cancel, _)) = self.io_task.take() {
            cancel.cancel();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::results::{ResultLog, Verdict};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Emits the tests of its shard out of four, honouring the sharding env.
    const SHARDED: &str = r#"#!/bin/sh
touch "$TEST_PREMATURE_EXIT_FILE"
i=0
for t in A B C D; do
  if [ $((i % ${GTEST_TOTAL_SHARDS:-1})) -eq ${GTEST_SHARD_INDEX:-0} ]; then
    echo "[ RUN      ] Suite.$t"
    echo "[       OK ] Suite.$t (1 ms)"
  fi
  i=$((i + 1))
done
rm -f "$TEST_PREMATURE_EXIT_FILE"
"#;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("unit_test");
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn orchestrator(tmp: &TempDir) -> Orchestrator<ResultLog> {
        let settings = RunnerSettings {
            core_dir: tmp.path().to_path_buf(),
            poll_interval: Duration::from_millis(20),
            drain_interval: Duration::from_millis(20),
        };
        Orchestrator::new(
            ResultLog::new(),
            ArtifactManager::new(tmp.path().join("traces"), true, "vgcore"),
            settings,
        )
    }

    fn options(exe: &Path, test_count: usize, jobs: usize) -> CampaignOptions {
        CampaignOptions {
            executable: exe.to_path_buf(),
            test_count,
            jobs,
            ..Default::default()
        }
    }

    async fn wait_idle(orch: &mut Orchestrator<ResultLog>) {
        tokio::time::timeout(Duration::from_secs(30), orch.wait_idle())
            .await
            .expect("campaign finished");
    }

    #[tokio::test]
    async fn test_sharded_campaign() {
        let tmp = TempDir::new().unwrap();
        let exe = write_script(tmp.path(), SHARDED);
        let mut orch = orchestrator(&tmp);

        let report = orch.start(options(&exe, 4, 2)).unwrap();
        assert_eq!(report.started.len(), 2);
        assert!(report.spawn_failures.is_empty());
        assert!(orch.is_active());
        assert_eq!(orch.counters().expected, 4);

        wait_idle(&mut orch).await;

        assert_eq!(orch.state(), CampaignState::Idle);
        assert_eq!(orch.counters().passed, 4);
        assert_eq!(orch.counters().completed, 4);
        assert_eq!(orch.counters().running, 0);
        let mut names: Vec<_> = orch
            .db()
            .results()
            .iter()
            .map(|r| r.test_case.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Suite.A", "Suite.B", "Suite.C", "Suite.D"]);
        assert_eq!(orch.db().job_count(), 0);
        // passed traces are cleaned and the executable copy released
        assert!(!report.trace_dir.exists());
    }

    #[tokio::test]
    async fn test_max_failures_stops_campaign() {
        let tmp = TempDir::new().unwrap();
        let exe = write_script(
            tmp.path(),
            "#!/bin/sh\necho '[ RUN      ] S.bad'\necho 'x.cc:3: Failure'\necho '[  FAILED  ] S.bad (1 ms)'\necho '[ RUN      ] S.hang'\nexec sleep 30\n",
        );
        let mut orch = orchestrator(&tmp);

        let mut opts = options(&exe, 2, 1);
        opts.max_failures = 1;
        orch.start(opts).unwrap();
        wait_idle(&mut orch).await;

        assert_eq!(orch.counters().failed, 1);
        let results = orch.db().results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].verdict, Verdict::Fail);
        assert_eq!(results[0].failure_file, "x.cc");
    }

    #[tokio::test]
    async fn test_background_workers_do_not_keep_campaign_alive() {
        let tmp = TempDir::new().unwrap();
        let exe = write_script(
            tmp.path(),
            "#!/bin/sh\ncase \"$*\" in\n*--gtest_filter*) echo '[ RUN      ] S.a'; echo '[       OK ] S.a (0 ms)' ;;\n*) exec sleep 30 ;;\nesac\n",
        );
        let mut orch = orchestrator(&tmp);

        let mut opts = options(&exe, 1, 2);
        opts.background_jobs = 1;
        opts.filter = "S.*".to_string();
        let report = orch.start(opts).unwrap();
        assert_eq!(report.plan.iter().filter(|e| e.is_background).count(), 1);
        assert_eq!(orch.counters().expected, 1);

        wait_idle(&mut orch).await;

        assert_eq!(orch.counters().passed, 1);
        assert_eq!(orch.counters().completed, 1);
    }

    #[tokio::test]
    async fn test_stop_twice_kills_and_empties() {
        let tmp = TempDir::new().unwrap();
        let exe = write_script(
            tmp.path(),
            "#!/bin/sh\ntrap '' TERM\necho '[ RUN      ] S.a'\nwhile :; do sleep 1; done\n",
        );
        let mut orch = orchestrator(&tmp);
        orch.stop(false);
        assert_eq!(orch.state(), CampaignState::Idle);

        orch.start(options(&exe, 2, 2)).unwrap();
        assert!(matches!(
            orch.start(options(&exe, 2, 2)),
            Err(CampaignError::AlreadyRunning)
        ));

        orch.stop(false);
        assert_eq!(orch.state(), CampaignState::StopRequested);
        assert_eq!(orch.job_count(), 2);
        orch.stop(false);
        assert_eq!(orch.job_count(), 0);
        assert!(orch.job_stats().is_empty());

        assert!(!orch.drain());
        assert_eq!(orch.state(), CampaignState::Idle);
        assert!(orch.db().results().is_empty());
        orch.stop(true);
    }

    #[tokio::test]
    async fn test_abort_job_reports_crash() {
        let tmp = TempDir::new().unwrap();
        let exe = write_script(
            tmp.path(),
            "#!/bin/sh\ntouch \"$TEST_PREMATURE_EXIT_FILE\"\necho '[ RUN      ] S.hang'\nexec sleep 30\n",
        );
        let mut orch = orchestrator(&tmp);
        orch.start(options(&exe, 1, 1)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let pid = loop {
            let stats = orch.job_stats();
            if let Some(job) = stats.iter().find(|s| s.current_test == "S.hang") {
                break job.pid;
            }
            assert!(std::time::Instant::now() < deadline, "worker never started its test");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert!(!orch.abort_job(pid + 100_000));
        assert!(orch.abort_job(pid));

        wait_idle(&mut orch).await;

        let results = orch.db().results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].verdict, Verdict::Crash);
        assert_eq!(results[0].test_case, "S.hang");
        assert_eq!(orch.counters().failed, 1);
    }

    #[tokio::test]
    async fn test_unlinkable_executable_runs_in_place() {
        let tmp = TempDir::new().unwrap();
        let exe = write_script(tmp.path(), SHARDED);
        let mut orch = orchestrator(&tmp);

        let timestamp = artifacts::executable_timestamp(&exe).unwrap();
        let blocked = orch.artifacts().executable_link_path(&exe, timestamp);
        fs::create_dir_all(&blocked).unwrap();

        let report = orch.start(options(&exe, 4, 2)).unwrap();
        assert_eq!(report.started.len(), 2);
        wait_idle(&mut orch).await;

        assert_eq!(orch.counters().passed, 4);
        assert!(blocked.is_dir());
        assert!(exe.is_file());
    }

    #[tokio::test]
    async fn test_zero_drain_interval_is_raised() {
        let tmp = TempDir::new().unwrap();
        let exe = write_script(tmp.path(), SHARDED);
        let settings = RunnerSettings {
            core_dir: tmp.path().to_path_buf(),
            poll_interval: Duration::ZERO,
            drain_interval: Duration::ZERO,
        };
        let mut orch = Orchestrator::new(
            ResultLog::new(),
            ArtifactManager::new(tmp.path().join("traces"), true, "vgcore"),
            settings,
        );

        orch.start(options(&exe, 4, 1)).unwrap();
        wait_idle(&mut orch).await;
        assert_eq!(orch.counters().passed, 4);
    }

    /// Passes `S.a`, then passes `S.b` once `go` exists.
    fn gated_script(dir: &Path) -> PathBuf {
        write_script(
            dir,
            &format!(
                "#!/bin/sh\n\
                 echo '[ RUN      ] S.a'\n\
                 echo '[       OK ] S.a (0 ms)'\n\
                 while [ ! -f '{}' ]; do sleep 0.05; done\n\
                 echo '[ RUN      ] S.b'\n\
                 echo '[       OK ] S.b (0 ms)'\n",
                dir.join("go").display()
            ),
        )
    }

    async fn wait_for_results(orch: &mut Orchestrator<ResultLog>, count: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while orch.db().results().len() < count {
            assert!(std::time::Instant::now() < deadline, "results never arrived");
            orch.drain();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_active_trace_files_of_running_jobs() {
        let tmp = TempDir::new().unwrap();
        let exe = gated_script(tmp.path());
        let mut orch = orchestrator(&tmp);

        orch.start(options(&exe, 2, 2)).unwrap();
        wait_for_results(&mut orch, 2).await;

        let active = orch.active_trace_files();
        let expected: HashSet<PathBuf> =
            orch.job_stats().into_iter().map(|s| s.trace_file).collect();
        assert_eq!(active.len(), 2);
        assert_eq!(active, expected);
        assert!(active.iter().all(|trace| trace.is_file()));

        fs::write(tmp.path().join("go"), b"").unwrap();
        wait_idle(&mut orch).await;
        assert!(orch.active_trace_files().is_empty());
    }

    #[tokio::test]
    async fn test_update_cleanup_options_mid_run() {
        let tmp = TempDir::new().unwrap();
        let exe = gated_script(tmp.path());
        let mut orch = orchestrator(&tmp);

        orch.start(options(&exe, 2, 1)).unwrap();
        wait_for_results(&mut orch, 1).await;
        assert_eq!(orch.db().results()[0].trace_file, None);

        orch.update_cleanup_options(false, false);
        fs::write(tmp.path().join("go"), b"").unwrap();
        wait_idle(&mut orch).await;

        let results = orch.db().results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].test_case, "S.b");
        let trace = results[1].trace_file.clone().expect("passed output is kept");
        let text = artifacts::extract_trace(&trace, results[1].trace_offset, results[1].trace_length)
            .unwrap();
        assert!(String::from_utf8_lossy(&text).starts_with("[ RUN      ] S.b\n"));
    }

    #[tokio::test]
    async fn test_nothing_to_run() {
        let tmp = TempDir::new().unwrap();
        let exe = write_script(tmp.path(), SHARDED);
        let mut orch = orchestrator(&tmp);

        assert!(matches!(
            orch.start(options(&exe, 0, 2)),
            Err(CampaignError::NothingToRun { .. })
        ));
        assert!(matches!(
            orch.start(options(&tmp.path().join("missing"), 3, 2)),
            Err(CampaignError::Artifact(_))
        ));
        assert!(!orch.is_active());
    }
}
