//! gtrun: A parallel GoogleTest campaign runner.
//!
//! This crate runs a GoogleTest executable in many worker processes at
//! once, sharding and repeating its test cases, and turns the output of
//! every worker into per-test result records backed by trace files.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Planner**: Splits tests and repetitions across workers
//! - **Job**: Spawns one worker and parses its output incrementally
//! - **Orchestrator**: Owns the jobs of a campaign and drains their results
//! - **Artifacts**: Trace file and core dump layout and cleanup
//! - **Results**: Result records and the in-memory result log
//!
//! # Example
//!
//! ```no_run
//! use gtrun::artifacts::ArtifactManager;
//! use gtrun::orchestrator::{CampaignOptions, Orchestrator, RunnerSettings};
//! use gtrun::results::ResultLog;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let artifacts = ArtifactManager::new("traces", true, "vgcore");
//!     let mut orchestrator =
//!         Orchestrator::new(ResultLog::new(), artifacts, RunnerSettings::default());
//!
//!     orchestrator.start(CampaignOptions {
//!         executable: "build/unit_test".into(),
//!         test_count: 120,
//!         repetitions: 10,
//!         jobs: 8,
//!         ..Default::default()
//!     })?;
//!     orchestrator.wait_idle().await;
//!
//!     println!("{} failed", orchestrator.counters().failed);
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod config;
pub mod import;
pub mod job;
pub mod listing;
pub mod orchestrator;
pub mod planner;
pub mod report;
pub mod results;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use orchestrator::{CampaignOptions, Orchestrator};
pub use results::{ResultLog, TestResultRecord, Verdict};
