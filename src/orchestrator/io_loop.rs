//! Background I/O task of a campaign.
//!
//! The task never touches counters or the result database. It locks the
//! shared job list briefly to let every unfinished job consume its pending
//! output, then waits for any pipe to become readable (or a poll interval
//! on platforms without readiness), and repeats. Consecutive passes are
//! spaced at least `spacing` apart.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::select_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::job::{Job, PipeReadiness};

/// Upper bound on waiting for readiness before jobs are checked again.
///
/// Catches exits that are not accompanied by pipe activity.
const RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Job list shared between the orchestrator and the I/O task.
pub type SharedJobs = Arc<Mutex<Vec<Job>>>;

/// Locks the job list, recovering it if a holder panicked.
pub fn lock_jobs(jobs: &SharedJobs) -> MutexGuard<'_, Vec<Job>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Starts the I/O task. It runs until `cancel` is triggered.
pub fn spawn(jobs: SharedJobs, cancel: CancellationToken, spacing: Duration) -> JoinHandle<()> {
    tokio::spawn(run(jobs, cancel, spacing))
}

async fn run(jobs: SharedJobs, cancel: CancellationToken, spacing: Duration) {
    debug!("I/O task started");
    loop {
        let pass_started = Instant::now();
        let (handles, polling) = service_jobs(&jobs);

        let wait = async {
            if polling || handles.is_empty() {
                tokio::time::sleep(spacing).await;
            } else {
                let ready = select_all(handles.iter().map(|h| Box::pin(h.ready())));
                let _ = tokio::time::timeout(RECHECK_INTERVAL, ready).await;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wait => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(pass_started + spacing) => {}
        }
    }
    debug!("I/O task stopped");
}

/// Runs one parse step on every unfinished job.
///
/// Returns the readiness handles to wait on, and whether some job can only
/// be serviced by polling.
fn service_jobs(jobs: &SharedJobs) -> (Vec<PipeReadiness>, bool) {
    let mut jobs = lock_jobs(jobs);
    let mut handles = Vec::new();
    let mut polling = false;

    for job in jobs.iter_mut().filter(|job| !job.is_finished()) {
        if !job.communicate() {
            continue;
        }
        match job.readiness() {
            Some(handle) => handles.push(handle),
            None => polling = true,
        }
    }
    (handles, polling)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::{JobSpec, WorkerCommand};
    use crate::results::{JobEvent, Verdict};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_drives_jobs_until_exit() {
        let tmp = TempDir::new().unwrap();
        let exe = tmp.path().join("unit_test");
        fs::write(
            &exe,
            "#!/bin/sh\necho '[ RUN      ] S.a'\nsleep 0.2\necho '[       OK ] S.a (200 ms)'\n",
        )
        .unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let jobs: SharedJobs = Arc::default();
        for index in 0..2 {
            let spec = JobSpec {
                command: WorkerCommand::new(&exe),
                trace_file: tmp.path().join(format!("trace.{}", index)),
                background: false,
                expected_results: 1,
                executable: exe.clone(),
                executable_timestamp: 0,
                core_dir: tmp.path().to_path_buf(),
                tool_core_prefix: "vgcore".to_string(),
                clean_passed: false,
                clean_core: false,
                seed_pattern: None,
            };
            lock_jobs(&jobs).push(Job::spawn(spec, tx.clone()).unwrap());
        }

        let cancel = CancellationToken::new();
        let task = spawn(Arc::clone(&jobs), cancel.clone(), Duration::from_millis(20));

        let mut passed = 0;
        let mut exited = 0;
        while exited < 2 {
            let event = tokio::time::timeout(Duration::from_secs(20), rx.recv())
                .await
                .expect("job event")
                .unwrap();
            match event {
                JobEvent::Result { record, .. } => {
                    assert_eq!(record.verdict, Verdict::Pass);
                    assert_eq!(record.duration_ms, 200);
                    passed += 1;
                }
                JobEvent::Exited { .. } => exited += 1,
            }
        }
        assert_eq!(passed, 2);
        assert!(lock_jobs(&jobs).iter().all(Job::is_finished));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_task_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let task = spawn(Arc::default(), cancel.clone(), Duration::from_millis(10));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("task stopped")
            .unwrap();
    }
}
