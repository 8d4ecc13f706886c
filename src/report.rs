//! Console output for the CLI.
//!
//! [`ConsoleReporter`] renders a progress bar fed by [`ResultLog`]
//! notifications; the `print_*` functions render plans and summaries.
//!
//! [`ResultLog`]: crate::results::ResultLog

use std::time::Duration;

use console::StyledObject;

use crate::artifacts::extract_trace;
use crate::planner::PartitionPlanEntry;
use crate::results::{CampaignCounters, LogEvent, TestResultRecord, Verdict};

/// Maximum number of trace lines shown per failed result.
const TRACE_LINES: usize = 40;

pub fn verdict_label(verdict: Verdict) -> StyledObject<&'static str> {
    match verdict {
        Verdict::Pass => console::style("PASS").green(),
        Verdict::Skipped => console::style("SKIP").yellow(),
        Verdict::Fail => console::style("FAIL").red(),
        Verdict::Crash => console::style("CRASH").red().bold(),
        Verdict::ToolMetaError => console::style("TOOL").magenta().bold(),
        Verdict::OtherError => console::style("ERR").red().bold(),
    }
}

/// One line describing a result.
pub fn result_line(record: &TestResultRecord) -> String {
    let mut line = format!("{} {}", verdict_label(record.verdict), record.test_case);
    if record.duration_ms > 0 {
        line.push_str(&format!(" ({} ms)", record.duration_ms));
    }
    if !record.failure_file.is_empty() {
        line.push_str(&format!(
            " at {}:{}",
            record.failure_file, record.failure_line
        ));
    }
    if !record.seed.is_empty() {
        line.push_str(&format!(" [seed {}]", record.seed));
    }
    line
}

/// Console reporter that shows campaign progress in the terminal.
pub struct ConsoleReporter {
    progress: indicatif::ProgressBar,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(expected: u64, verbose: bool) -> Self {
        let pb = indicatif::ProgressBar::new(expected);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.enable_steady_tick(Duration::from_millis(200));
        Self {
            progress: pb,
            verbose,
        }
    }

    /// Listener for [`ResultLog::subscribe`](crate::results::ResultLog::subscribe).
    pub fn listener(&self) -> impl FnMut(&LogEvent<'_>) + Send + 'static {
        let pb = self.progress.clone();
        let verbose = self.verbose;
        move |event: &LogEvent<'_>| match event {
            LogEvent::ResultAppended {
                record, background, ..
            } => {
                if verbose || record.verdict.is_failure() {
                    let tag = if *background { " (background)" } else { "" };
                    pb.println(format!("{}{}", result_line(record), tag));
                }
            }
            LogEvent::CampaignStatsUpdated(counters) => {
                pb.set_length(counters.expected.max(counters.completed));
                pb.set_position(counters.completed);
                pb.set_message(progress_message(counters));
            }
            LogEvent::CampaignReset { expected, .. } => pb.set_length(*expected),
            LogEvent::JobCountChanged(_) | LogEvent::TestCaseStatsUpdated { .. } => {}
        }
    }

    pub fn println(&self, line: impl AsRef<str>) {
        self.progress.println(line);
    }

    pub fn finish(&self) {
        self.progress.finish_and_clear();
    }
}

fn progress_message(counters: &CampaignCounters) -> String {
    let mut msg = format!("{} jobs", counters.running);
    if counters.failed > 0 {
        msg.push_str(&format!(", {} failed", counters.failed));
    }
    if counters.meta_errors > 0 {
        msg.push_str(&format!(", {} errors", counters.meta_errors));
    }
    msg
}

/// Prints the partition plan as a table.
pub fn print_plan(plan: &[PartitionPlanEntry], test_count: usize) {
    println!("{:>4}  {:>6}  {:>5}  {:>11}  {:>8}", "job", "shards", "index", "repetitions", "results");
    for (idx, entry) in plan.iter().enumerate() {
        let results = entry.expected_results(test_count);
        let line = format!(
            "{:>4}  {:>6}  {:>5}  {:>11}  {:>8}",
            idx, entry.shard_count, entry.shard_index, entry.repetitions, results
        );
        if entry.is_background {
            println!("{} {}", line, console::style("background").dim());
        } else {
            println!("{}", line);
        }
    }
}

/// Prints the campaign summary and the traces of failed results.
pub fn print_summary(
    counters: &CampaignCounters,
    results: &[TestResultRecord],
    duration: Duration,
    show_traces: bool,
) {
    println!();
    println!("Test Results:");
    println!("  Expected: {}", counters.expected);
    println!("  Passed:   {}", console::style(counters.passed).green());
    println!("  Failed:   {}", console::style(counters.failed).red());
    println!("  Skipped:  {}", console::style(counters.skipped).yellow());
    if counters.meta_errors > 0 {
        println!("  Errors:   {}", console::style(counters.meta_errors).red().bold());
    }
    println!("  Duration: {:?}", duration);

    let failed: Vec<_> = results.iter().filter(|r| r.verdict.is_failure()).collect();
    if failed.is_empty() {
        println!();
        if counters.completed < counters.expected {
            println!(
                "{}",
                console::style(format!(
                    "Campaign stopped after {} of {} results.",
                    counters.completed, counters.expected
                ))
                .yellow()
                .bold()
            );
        } else {
            println!("{}", console::style("All tests passed!").green().bold());
        }
        return;
    }

    println!();
    println!("{}", console::style("Some tests failed.").red().bold());
    println!();
    println!("Failed tests:");
    for record in failed {
        println!("  - {}", result_line(record));
        if let Some(trace) = &record.trace_file {
            println!("    {}", console::style(trace.display()).dim());
        }
        if let Some(core) = &record.core_file {
            println!("    core: {}", console::style(core.display()).dim());
        }
        if show_traces {
            print_trace(record);
        }
    }
}

fn print_trace(record: &TestResultRecord) {
    let Some(trace) = &record.trace_file else {
        return;
    };
    let Ok(snippet) = extract_trace(trace, record.trace_offset, record.trace_length) else {
        return;
    };
    let text = String::from_utf8_lossy(&snippet);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(TRACE_LINES);
    if skip > 0 {
        println!("      {}", console::style(format!("... {} lines omitted", skip)).dim());
    }
    for line in &lines[skip..] {
        println!("      {}", line);
    }
}
