//! Trace and core dump file management.
//!
//! Worker output is stored below a trace root directory, with one
//! sub-directory per executable version (identified by the executable's
//! modification time):
//!
//! ```text
//! <trace_root>/
//! └── trace.1700000000/          executable timestamp
//!     ├── unit_test              hardlinked executable (optional)
//!     ├── trace.0                output of worker 0
//!     ├── trace.1
//!     ├── trace.1.running        premature exit sentinel of a live worker
//!     ├── core.trace.1           core dump of the crash recorded in trace.1
//!     └── vgcore.trace.3         core dump written by the diagnostic tool
//! ```
//!
//! Keeping a hardlink of the executable next to its core dumps allows
//! post-mortem analysis even after the executable has been rebuilt.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use regex::Regex;
use tracing::{debug, warn};

use crate::results::{Provenance, TestResultRecord, Verdict};

/// Prefix of core dumps written by the operating system.
pub const CORE_PREFIX: &str = "core";

/// Errors from trace directory management.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Failed to create trace output directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to scan trace directory {}: {source}", .path.display())]
    Scan { path: PathBuf, source: io::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Path of the sentinel file belonging to a trace file.
pub fn sentinel_path(trace_file: &Path) -> PathBuf {
    let mut name = trace_file.as_os_str().to_owned();
    name.push(".running");
    PathBuf::from(name)
}

/// Path a core dump is renamed to, next to its trace file.
///
/// `prefix` is [`CORE_PREFIX`] for dumps of the executable itself or the
/// diagnostic tool's prefix.
pub fn core_file_path(trace_file: &Path, prefix: &str) -> PathBuf {
    let name = trace_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    trace_file.with_file_name(format!("{}.{}", prefix, name))
}

/// Location where a crashing process leaves its core dump.
pub fn core_dump_path(core_dir: &Path, prefix: &str, pid: u32) -> PathBuf {
    core_dir.join(format!("{}.{}", prefix, pid))
}

/// Modification time of the executable in whole seconds.
pub fn executable_timestamp(executable: &Path) -> io::Result<u64> {
    let modified = fs::metadata(executable)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0))
}

/// Reads `length` bytes at `offset` of a trace file.
///
/// Returns fewer bytes if the file is shorter.
pub fn extract_trace(trace_file: &Path, offset: u64, length: u64) -> io::Result<Vec<u8>> {
    let mut file = fs::File::open(trace_file)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::new();
    file.take(length).read_to_end(&mut data)?;
    Ok(data)
}

/// Outcome of [`ArtifactManager::clean_trace_files`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub removed: Vec<PathBuf>,
    pub compacted: Vec<PathBuf>,
}

/// Manages the trace directory tree.
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    trace_root: PathBuf,
    copy_executable: bool,
    tool_core_prefix: String,
}

impl ArtifactManager {
    pub fn new(
        trace_root: impl Into<PathBuf>,
        copy_executable: bool,
        tool_core_prefix: impl Into<String>,
    ) -> Self {
        Self {
            trace_root: trace_root.into(),
            copy_executable,
            tool_core_prefix: tool_core_prefix.into(),
        }
    }

    pub fn trace_root(&self) -> &Path {
        &self.trace_root
    }

    pub fn tool_core_prefix(&self) -> &str {
        &self.tool_core_prefix
    }

    /// Directory holding all traces of one executable version.
    pub fn trace_dir(&self, executable_timestamp: u64) -> PathBuf {
        self.trace_root
            .join(format!("trace.{}", executable_timestamp))
    }

    pub fn ensure_trace_dir(&self, executable_timestamp: u64) -> Result<PathBuf, ArtifactError> {
        let dir = self.trace_dir(executable_timestamp);
        fs::create_dir_all(&dir).map_err(|source| ArtifactError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Index following the highest existing `trace.N` file.
    pub fn first_free_trace_index(&self, executable_timestamp: u64) -> Result<u32, ArtifactError> {
        let dir = self.trace_dir(executable_timestamp);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(ArtifactError::Scan { path: dir, source }),
        };

        let mut free = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(idx) = trace_index(&entry.file_name().to_string_lossy()) {
                free = free.max(idx + 1);
            }
        }
        Ok(free)
    }

    pub fn trace_file_path(&self, executable_timestamp: u64, index: u32) -> PathBuf {
        self.trace_dir(executable_timestamp)
            .join(format!("trace.{}", index))
    }

    /// Executable path workers are started from.
    ///
    /// This is the hardlink inside the trace directory when copying is
    /// enabled, else the executable itself.
    pub fn executable_link_path(&self, executable: &Path, executable_timestamp: u64) -> PathBuf {
        match executable.file_name() {
            Some(name) if self.copy_executable => self.trace_dir(executable_timestamp).join(name),
            _ => executable.to_path_buf(),
        }
    }

    /// Hardlinks the executable into its trace directory.
    ///
    /// Returns the path to start workers from. An existing link is reused.
    /// If the link cannot be created, for example because the trace
    /// directory is on another filesystem, workers start from the
    /// executable itself.
    pub fn link_executable(
        &self,
        executable: &Path,
        executable_timestamp: u64,
    ) -> Result<PathBuf, ArtifactError> {
        let link = self.executable_link_path(executable, executable_timestamp);
        if link == executable || link.is_file() {
            return Ok(link);
        }
        self.ensure_trace_dir(executable_timestamp)?;
        if let Err(e) = fs::hard_link(executable, &link) {
            warn!(
                "Failed to link {} to {}, running it in place: {}",
                executable.display(),
                link.display(),
                e
            );
            return Ok(executable.to_path_buf());
        }
        debug!("Linked {} to {}", executable.display(), link.display());
        Ok(link)
    }

    /// Removes the executable copy once no core dump depends on it.
    ///
    /// The trace directory is removed too if nothing else is left in it.
    pub fn release_executable_copy(&self, executable: &Path, executable_timestamp: u64) {
        if !self.copy_executable {
            return;
        }
        let dir = self.trace_dir(executable_timestamp);
        let Ok(entries) = fs::read_dir(&dir) else {
            return;
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();

        let core_prefixes = [
            format!("{}.", CORE_PREFIX),
            format!("{}.", self.tool_core_prefix),
        ];
        if names
            .iter()
            .any(|n| core_prefixes.iter().any(|p| n.starts_with(p.as_str())))
        {
            return;
        }

        let link = self.executable_link_path(executable, executable_timestamp);
        if fs::remove_file(&link).is_ok() {
            let link_name = link.file_name().map(|n| n.to_string_lossy().into_owned());
            names.retain(|n| Some(n) != link_name.as_ref());
        }
        if names.is_empty() {
            let _ = fs::remove_dir(&dir);
        }
    }

    /// All `trace.N` files in all executable directories, sorted.
    pub fn search_trace_files(&self) -> Result<Vec<PathBuf>, ArtifactError> {
        let mut files = Vec::new();
        for dir in self.trace_dirs()? {
            let entries = fs::read_dir(&dir).map_err(|source| ArtifactError::Scan {
                path: dir.clone(),
                source,
            })?;
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_file()
                    && trace_index(&entry.file_name().to_string_lossy()).is_some()
                {
                    files.push(entry.path());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn trace_dirs(&self) -> Result<Vec<PathBuf>, ArtifactError> {
        let entries = match fs::read_dir(&self.trace_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ArtifactError::Scan {
                    path: self.trace_root.clone(),
                    source,
                });
            }
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() && trace_index(&entry.file_name().to_string_lossy()).is_some() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Removes files and then any directories left empty.
    ///
    /// Files that cannot be removed are logged and skipped.
    pub fn remove_files<'a, I>(&self, files: I) -> Vec<PathBuf>
    where
        I: IntoIterator<Item = &'a Path>,
    {
        let mut removed = Vec::new();
        let mut dirs = HashSet::new();
        for file in files {
            match fs::remove_file(file) {
                Ok(()) => removed.push(file.to_path_buf()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", file.display(), e),
            }
            if let Some(parent) = file.parent() {
                dirs.insert(parent.to_path_buf());
            }
        }
        for dir in dirs {
            if fs::read_dir(&dir).is_ok_and(|mut d| d.next().is_none()) {
                let _ = fs::remove_dir(&dir);
            }
        }
        removed
    }

    /// Removes trace output of live results.
    ///
    /// Without `clean_failed`, only output of passed and skipped tests is
    /// dropped: files that also hold failures are rewritten to keep just
    /// the failing parts, and the byte ranges of the remaining records are
    /// moved accordingly. With `clean_failed`, all trace files, core dumps
    /// and executable copies referenced by the records are removed.
    /// Imported results are never touched.
    pub fn clean_trace_files(
        &self,
        records: &mut [TestResultRecord],
        clean_failed: bool,
    ) -> CleanReport {
        let mut remove: HashSet<PathBuf> = HashSet::new();
        let mut keep_whole: HashSet<PathBuf> = HashSet::new();
        let mut has_failure: HashSet<PathBuf> = HashSet::new();
        let mut passed: BTreeMap<PathBuf, Vec<(u64, u64)>> = BTreeMap::new();
        let mut executables: HashSet<(PathBuf, u64)> = HashSet::new();

        for record in records.iter() {
            if record.provenance != Provenance::Live {
                continue;
            }
            if let Some(trace) = &record.trace_file {
                remove.insert(trace.clone());
                match record.verdict {
                    Verdict::Fail | Verdict::Crash => {
                        has_failure.insert(trace.clone());
                    }
                    Verdict::ToolMetaError | Verdict::OtherError => {
                        has_failure.insert(trace.clone());
                        keep_whole.insert(trace.clone());
                    }
                    Verdict::Pass | Verdict::Skipped => passed
                        .entry(trace.clone())
                        .or_default()
                        .push((record.trace_offset, record.trace_offset + record.trace_length)),
                }
            }
            if clean_failed {
                if let Some(core) = &record.core_file {
                    remove.insert(core.clone());
                    if let Some(exe) = &record.executable {
                        executables.insert((exe.clone(), record.executable_timestamp));
                    }
                }
            }
        }

        let mut report = CleanReport::default();
        let mut shifts: BTreeMap<PathBuf, Vec<(u64, u64)>> = BTreeMap::new();
        if !clean_failed {
            for trace in &has_failure {
                remove.remove(trace);
                if keep_whole.contains(trace) {
                    continue;
                }
                if let Some(parts) = passed.get(trace) {
                    match compact_trace_file(trace, parts) {
                        Ok(removed_parts) => {
                            shifts.insert(trace.clone(), removed_parts);
                            report.compacted.push(trace.clone());
                        }
                        Err(e) => warn!("Failed to compact {}: {}", trace.display(), e),
                    }
                }
            }
        }
        if self.copy_executable {
            for (exe, ts) in &executables {
                remove.insert(self.executable_link_path(exe, *ts));
            }
        }

        report.removed = self.remove_files(remove.iter().map(PathBuf::as_path));
        report.removed.sort();
        report.compacted.sort();

        let removed: HashSet<&PathBuf> = report.removed.iter().collect();
        for record in records.iter_mut() {
            if record.provenance != Provenance::Live {
                continue;
            }
            if record.core_file.as_ref().is_some_and(|c| removed.contains(c)) {
                record.core_file = None;
            }
            let Some(trace) = record.trace_file.clone() else {
                continue;
            };
            if removed.contains(&trace) {
                record.trace_file = None;
            } else if let Some(parts) = shifts.get(&trace) {
                if matches!(record.verdict, Verdict::Pass | Verdict::Skipped) {
                    record.trace_file = None;
                } else {
                    record.trace_offset -= removed_before(parts, record.trace_offset);
                }
            }
        }

        report
    }

    /// Deletes files in the trace tree that no record references.
    ///
    /// Considers trace files, their sentinels and core dumps. Files in
    /// `active` belong to running workers and are always kept.
    pub fn remove_orphans(
        &self,
        referenced: &HashSet<PathBuf>,
        active: &HashSet<PathBuf>,
    ) -> Result<Vec<PathBuf>, ArtifactError> {
        let pattern = Regex::new(&format!(
            r"^(?:(?:{}|{})\.)?trace\.\d+(?:\.running)?$",
            regex::escape(CORE_PREFIX),
            regex::escape(&self.tool_core_prefix)
        ))
        .map_err(|e| ArtifactError::Io(io::Error::other(e)))?;

        let mut orphans = Vec::new();
        for dir in self.trace_dirs()? {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                if !entry.file_type()?.is_file() || !pattern.is_match(&name) {
                    continue;
                }
                let owner = owning_trace_file(&path, &name);
                if referenced.contains(&path) || active.contains(&owner) {
                    continue;
                }
                orphans.push(path);
            }
        }
        orphans.sort();
        Ok(self.remove_files(orphans.iter().map(PathBuf::as_path)))
    }
}

/// Index of a `trace.N` name.
fn trace_index(name: &str) -> Option<u32> {
    name.strip_prefix("trace.")?.parse().ok()
}

/// Trace file a sentinel or core file belongs to.
fn owning_trace_file(path: &Path, name: &str) -> PathBuf {
    let base = name.strip_suffix(".running").unwrap_or(name);
    let base = match base.find("trace.") {
        Some(pos) => &base[pos..],
        None => base,
    };
    path.with_file_name(base)
}

/// Removes the given `[start, end)` ranges from a file.
///
/// Returns the merged, sorted ranges that were removed.
fn compact_trace_file(path: &Path, parts: &[(u64, u64)]) -> io::Result<Vec<(u64, u64)>> {
    let mut parts = parts.to_vec();
    parts.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::new();
    for (start, end) in parts {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    let data = fs::read(path)?;
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0usize;
    for &(start, end) in &merged {
        let start = (start as usize).min(data.len());
        let end = (end as usize).min(data.len());
        out.extend_from_slice(&data[pos.min(start)..start]);
        pos = pos.max(end);
    }
    out.extend_from_slice(&data[pos.min(data.len())..]);
    fs::write(path, out)?;
    Ok(merged)
}

/// Number of bytes removed in front of `offset`.
fn removed_before(parts: &[(u64, u64)], offset: u64) -> u64 {
    parts
        .iter()
        .filter(|(_, end)| *end <= offset)
        .map(|(start, end)| end - start)
        .sum()
}
