//! Test case listing via `--gtest_list_tests`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::debug;

/// Time the executable gets to print its test list.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(10);

static SUITE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^0-9\s]\S*\.)$").expect("suite pattern is valid"));
static TEST_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+([^0-9\s]\S*)$").expect("test pattern is valid"));

#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("Failed to read test case list from {}: {source}", .path.display())]
    Spawn { path: PathBuf, source: io::Error },

    #[error("Test executable exited with code {code} when querying test case list: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("Test executable did not print its test case list within {} s", .0.as_secs())]
    Timeout(Duration),
}

/// Lists the test cases of `executable` matching `filter`.
pub async fn list_tests(executable: &Path, filter: &str) -> Result<Vec<String>, ListError> {
    list_tests_with_timeout(executable, filter, LIST_TIMEOUT).await
}

pub async fn list_tests_with_timeout(
    executable: &Path,
    filter: &str,
    timeout: Duration,
) -> Result<Vec<String>, ListError> {
    let mut cmd = Command::new(executable);
    cmd.arg("--gtest_list_tests");
    if !filter.is_empty() {
        cmd.arg(format!("--gtest_filter={}", filter));
    }
    cmd.env_remove("GTEST_FILTER")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| ListError::Spawn {
        path: executable.to_path_buf(),
        source,
    })?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ListError::Timeout(timeout))?
        .map_err(|source| ListError::Spawn {
            path: executable.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(ListError::Exit {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        });
    }

    let names = parse_test_list(&String::from_utf8_lossy(&output.stdout));
    debug!("{} lists {} test cases", executable.display(), names.len());
    Ok(names)
}

/// Whether GoogleTest skips this test unless disabled tests are enabled.
pub fn is_disabled(test_case: &str) -> bool {
    test_case
        .split(['.', '/'])
        .any(|part| part.starts_with("DISABLED_"))
}

/// Parses `--gtest_list_tests` output into `Suite.Test` names.
///
/// Trailing `# TypeParam`/`# GetParam()` comments are dropped. Any line
/// that is neither a suite nor a test line ends the current suite.
pub fn parse_test_list(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut suite: Option<&str> = None;

    for line in text.lines() {
        let line = match line.find("  #") {
            Some(pos) => &line[..pos],
            None => line,
        };
        let line = line.trim_end();

        if let Some(caps) = SUITE_LINE.captures(line) {
            suite = caps.get(1).map(|m| m.as_str());
        } else if let Some(prefix) = suite {
            match TEST_LINE.captures(line) {
                Some(caps) => names.push(format!("{}{}", prefix, &caps[1])),
                None => suite = None,
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Running main() from gmock_main.cc
Codec.
  Encode
  Decode
  DISABLED_Huge
Param/Range.
  Check/0  # GetParam() = 1
  Check/1  # GetParam() = 2
Typed/0.  # TypeParam = int
  Works
1Bad.
  Ignored
";

    #[test]
    fn test_parse_listing() {
        assert_eq!(
            parse_test_list(LISTING),
            vec![
                "Codec.Encode",
                "Codec.Decode",
                "Codec.DISABLED_Huge",
                "Param/Range.Check/0",
                "Param/Range.Check/1",
                "Typed/0.Works",
            ]
        );
    }

    #[test]
    fn test_disabled_names() {
        assert!(is_disabled("Codec.DISABLED_Huge"));
        assert!(is_disabled("DISABLED_Codec.Encode"));
        assert!(is_disabled("Inst/DISABLED_Range.Check/0"));
        assert!(!is_disabled("Codec.Encode_DISABLED_"));
    }

    #[test]
    fn test_other_line_ends_suite() {
        let text = "A.\n  one\nnoise here\n  two\nB.\n  three\n";
        assert_eq!(parse_test_list(text), vec!["A.one", "B.three"]);
        assert!(parse_test_list("").is_empty());
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("unit_test");
            fs::write(&path, body).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn test_list_passes_filter() {
            let tmp = TempDir::new().unwrap();
            let exe = script(
                tmp.path(),
                "#!/bin/sh\n[ \"$1\" = --gtest_list_tests ] || exit 2\n[ \"$2\" = '--gtest_filter=S.*' ] || exit 3\nprintf 'S.\\n  a\\n  b\\n'\n",
            );

            let names = list_tests(&exe, "S.*").await.unwrap();
            assert_eq!(names, vec!["S.a", "S.b"]);
        }

        #[tokio::test]
        async fn test_list_exit_code() {
            let tmp = TempDir::new().unwrap();
            let exe = script(tmp.path(), "#!/bin/sh\necho 'bad flag' >&2\nexit 1\n");

            let err = list_tests(&exe, "").await.unwrap_err();
            assert!(matches!(err, ListError::Exit { code: 1, ref stderr } if stderr == "bad flag"));
        }

        #[tokio::test]
        async fn test_list_timeout() {
            let tmp = TempDir::new().unwrap();
            let exe = script(tmp.path(), "#!/bin/sh\nexec sleep 10\n");

            let err = list_tests_with_timeout(&exe, "", Duration::from_millis(200))
                .await
                .unwrap_err();
            assert!(matches!(err, ListError::Timeout(_)));
        }

        #[tokio::test]
        async fn test_list_missing_executable() {
            let err = list_tests(Path::new("/nonexistent/unit_test"), "")
                .await
                .unwrap_err();
            assert!(matches!(err, ListError::Spawn { .. }));
        }
    }
}
