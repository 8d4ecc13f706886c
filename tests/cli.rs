use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn gtrun() -> Command {
    Command::cargo_bin("gtrun").unwrap()
}

#[test]
fn test_help() {
    gtrun()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Parallel GoogleTest campaign runner"));
}

#[test]
fn test_plan_json() {
    let output = gtrun()
        .args(["plan", "--tests", "1", "--repetitions", "100", "--jobs", "4", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entries = plan.as_array().unwrap();
    assert_eq!(entries.len(), 4);
    for entry in entries {
        assert_eq!(entry["repetitions"], 25);
        assert_eq!(entry["shard_count"], 1);
        assert_eq!(entry["is_background"], false);
    }
}

#[test]
fn test_plan_table() {
    gtrun()
        .args(["plan", "--tests", "10", "--jobs", "3", "--background-jobs", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("shards"))
        .stdout(predicate::str::contains("background"))
        .stdout(predicate::str::contains("Longest worker runs"));
}

#[test]
fn test_validate_valid_config() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("gtrun.toml");
    fs::write(
        &config,
        "[campaign]\njobs = 3\nrepetitions = 7\n\n[tool]\ncommand = \"valgrind -q\"\n",
    )
    .unwrap();

    gtrun()
        .args(["--config", config.to_str().unwrap(), "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Jobs: 3"))
        .stdout(predicate::str::contains("Repetitions: 7"))
        .stdout(predicate::str::contains("Tool: valgrind -q (error exit code 125)"));
}

#[test]
fn test_validate_invalid_config() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("gtrun.toml");
    fs::write(&config, "[campaign]\nworkers = 3\n").unwrap();

    gtrun()
        .args(["--config", config.to_str().unwrap(), "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_validate_rejects_zero_interval() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("gtrun.toml");
    fs::write(&config, "[runner]\ndrain_interval_ms = 0\n").unwrap();

    gtrun()
        .args(["--config", config.to_str().unwrap(), "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("drain_interval_ms must be greater than 0"));
}

#[test]
fn test_init_refuses_to_overwrite() {
    let tmp = TempDir::new().unwrap();

    gtrun()
        .current_dir(tmp.path())
        .args(["init", "--executable", "build/unit_test"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created gtrun.toml"));

    let content = fs::read_to_string(tmp.path().join("gtrun.toml")).unwrap();
    assert!(content.contains("executable = \"build/unit_test\""));

    gtrun()
        .current_dir(tmp.path())
        .arg("validate")
        .assert()
        .success();

    gtrun()
        .current_dir(tmp.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_import_trace_file() {
    let tmp = TempDir::new().unwrap();
    let trace = tmp.path().join("trace.0");
    fs::write(
        &trace,
        "[ RUN      ] Codec.Encode\n\
         [       OK ] Codec.Encode (3 ms)\n\
         [ RUN      ] Codec.Decode\n\
         codec_test.cc:12: Failure\n\
         [  FAILED  ] Codec.Decode (5 ms)\n",
    )
    .unwrap();

    gtrun()
        .current_dir(tmp.path())
        .args(["import", "trace.0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PASS Codec.Encode (3 ms)"))
        .stdout(predicate::str::contains("FAIL Codec.Decode (5 ms) at codec_test.cc:12"))
        .stdout(predicate::str::contains("Imported 2 results, 1 failed"));
}

#[cfg(unix)]
mod campaign {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Lists four tests and runs its shard of them; `Suite.D` fails if
    /// `FAIL_D` is set.
    const FAKE_GTEST: &str = r#"#!/bin/sh
if [ "$1" = --gtest_list_tests ]; then
  printf 'Suite.\n  A\n  B\n  C\n  DISABLED_X\n  D\n'
  exit 0
fi
touch "$TEST_PREMATURE_EXIT_FILE"
i=0
for t in A B C D; do
  if [ $((i % ${GTEST_TOTAL_SHARDS:-1})) -eq ${GTEST_SHARD_INDEX:-0} ]; then
    echo "[ RUN      ] Suite.$t"
    if [ "$t" = D ] && [ -n "$FAIL_D" ]; then
      echo "suite_test.cc:7: Failure"
      echo "[  FAILED  ] Suite.$t (1 ms)"
    else
      echo "[       OK ] Suite.$t (1 ms)"
    fi
  fi
  i=$((i + 1))
done
rm -f "$TEST_PREMATURE_EXIT_FILE"
[ -z "$FAIL_D" ]
"#;

    fn setup() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let exe = tmp.path().join("unit_test");
        fs::write(&exe, FAKE_GTEST).unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let config = tmp.path().join("gtrun.toml");
        fs::write(
            &config,
            format!(
                "[campaign]\nexecutable = \"{}\"\njobs = 2\n\n\
                 [artifacts]\ntrace_dir = \"{}\"\ncore_dir = \"{}\"\n\n\
                 [runner]\npoll_interval_ms = 20\ndrain_interval_ms = 20\n",
                exe.display(),
                tmp.path().join("traces").display(),
                tmp.path().display()
            ),
        )
        .unwrap();
        (tmp, config)
    }

    fn run(dir: &Path, config: &Path) -> Command {
        let mut cmd = gtrun();
        cmd.current_dir(dir)
            .args(["--config", config.to_str().unwrap(), "run"])
            .env_remove("FAIL_D")
            .timeout(std::time::Duration::from_secs(60));
        cmd
    }

    #[test]
    fn test_list() {
        let (tmp, config) = setup();

        gtrun()
            .current_dir(tmp.path())
            .args(["--config", config.to_str().unwrap(), "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Suite.A\nSuite.B\nSuite.C\nSuite.DISABLED_X\nSuite.D\n"));
    }

    #[test]
    fn test_run_all_pass() {
        let (tmp, config) = setup();

        run(tmp.path(), &config)
            .assert()
            .success()
            .stdout(predicate::str::contains("Passed:   4"))
            .stdout(predicate::str::contains("All tests passed!"));
    }

    #[test]
    fn test_run_with_failure() {
        let (tmp, config) = setup();
        let json = tmp.path().join("results.json");

        run(tmp.path(), &config)
            .env("FAIL_D", "1")
            .args(["--json", json.to_str().unwrap()])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Some tests failed."))
            .stdout(predicate::str::contains("FAIL Suite.D (1 ms) at suite_test.cc:7"));

        let results: serde_json::Value =
            serde_json::from_slice(&fs::read(&json).unwrap()).unwrap();
        let results = results.as_array().unwrap();
        assert_eq!(results.len(), 4);
        let failed: Vec<_> = results
            .iter()
            .filter(|r| r["verdict"] == "fail")
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["test_case"], "Suite.D");
        // the failed trace stays, compacted to the failing test's output
        let trace = PathBuf::from(failed[0]["trace_file"].as_str().unwrap());
        let content = fs::read_to_string(trace).unwrap();
        assert!(content.contains("[  FAILED  ] Suite.D"));
        assert!(!content.contains("[       OK ]"));
    }
}
