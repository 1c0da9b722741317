//! Integration tests for script execution against a real interpreter
//!
//! Each test skips itself when no Python interpreter is available in the
//! environment.

use pyengine::python::{PythonEnv, ScriptRunner};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::oneshot;
use tokio::time::timeout;

fn system_python() -> Option<PathBuf> {
    for candidate in ["python3", "python"] {
        let works = std::process::Command::new(candidate)
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        if works {
            return Some(PathBuf::from(candidate));
        }
    }
    None
}

fn make_runner(home: &std::path::Path) -> Option<ScriptRunner> {
    let python = system_python()?;
    let env = PythonEnv::with_interpreter(home.to_path_buf(), python);
    Some(ScriptRunner::new(Arc::new(env)))
}

#[tokio::test]
async fn script_output_is_captured() {
    let dir = tempdir().unwrap();
    let Some(runner) = make_runner(dir.path()) else {
        eprintln!("Skipping script_output_is_captured: no python interpreter");
        return;
    };

    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let result = runner
        .run_script("E1", "result = 10 + 20\nprint(result)", &[], 5000, cancel_rx)
        .await;

    assert!(result.success, "stderr: {}", result.stderr);
    assert_eq!(result.stdout.trim(), "30");
    assert!(!result.cancelled);
    assert!(result.execution_time_ms >= 0);
}

#[tokio::test]
async fn arguments_reach_sys_argv() {
    let dir = tempdir().unwrap();
    let Some(runner) = make_runner(dir.path()) else {
        eprintln!("Skipping arguments_reach_sys_argv: no python interpreter");
        return;
    };

    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let arguments = [json!("alpha"), json!(7), json!(true)];
    let result = runner
        .run_script(
            "E2",
            "import sys\nprint(sys.argv[1], sys.argv[2], sys.argv[3])",
            &arguments,
            5000,
            cancel_rx,
        )
        .await;

    assert!(result.success, "stderr: {}", result.stderr);
    assert_eq!(result.stdout.trim(), "alpha 7 true");
}

#[tokio::test]
async fn nonzero_exit_reports_error_code() {
    let dir = tempdir().unwrap();
    let Some(runner) = make_runner(dir.path()) else {
        eprintln!("Skipping nonzero_exit_reports_error_code: no python interpreter");
        return;
    };

    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let result = runner
        .run_script("E3", "import sys\nsys.exit(3)", &[], 5000, cancel_rx)
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(3));
}

#[tokio::test]
async fn stderr_is_captured_separately() {
    let dir = tempdir().unwrap();
    let Some(runner) = make_runner(dir.path()) else {
        eprintln!("Skipping stderr_is_captured_separately: no python interpreter");
        return;
    };

    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let result = runner
        .run_script(
            "E4",
            "import sys\nprint('out')\nprint('err', file=sys.stderr)",
            &[],
            5000,
            cancel_rx,
        )
        .await;

    assert!(result.success);
    assert_eq!(result.stdout.trim(), "out");
    assert_eq!(result.stderr.trim(), "err");
}

#[tokio::test]
async fn timeout_kills_the_child() {
    let dir = tempdir().unwrap();
    let Some(runner) = make_runner(dir.path()) else {
        eprintln!("Skipping timeout_kills_the_child: no python interpreter");
        return;
    };

    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let result = runner
        .run_script(
            "E5",
            "import time\ntime.sleep(5)\nprint('done')",
            &[],
            500,
            cancel_rx,
        )
        .await;

    assert!(!result.success);
    assert!(!result.cancelled);
    assert!(
        result.stderr.contains("timed out"),
        "stderr: {}",
        result.stderr
    );
    assert!(result.execution_time_ms >= 500);
    assert!(result.execution_time_ms < 2000);
    assert!(!result.stdout.contains("done"));
}

#[tokio::test]
async fn cancellation_produces_a_cancelled_result() {
    let dir = tempdir().unwrap();
    let Some(runner) = make_runner(dir.path()) else {
        eprintln!("Skipping cancellation_produces_a_cancelled_result: no python interpreter");
        return;
    };
    let runner = Arc::new(runner);

    let (cancel_tx, cancel_rx) = oneshot::channel();
    let task_runner = Arc::clone(&runner);
    let task = tokio::spawn(async move {
        task_runner
            .run_script("E6", "import time\ntime.sleep(30)", &[], 0, cancel_rx)
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel_tx.send(()).unwrap();

    let result = timeout(Duration::from_secs(2), task)
        .await
        .expect("cancel took too long")
        .unwrap();

    assert!(result.cancelled);
    assert!(!result.success);
    assert!(
        result.stderr.contains("canceled by user"),
        "stderr: {}",
        result.stderr
    );
}

#[tokio::test]
async fn spawn_failure_is_a_process_error() {
    let dir = tempdir().unwrap();
    let env = PythonEnv::with_interpreter(
        dir.path().to_path_buf(),
        PathBuf::from("/nonexistent/python-binary"),
    );
    let runner = ScriptRunner::new(Arc::new(env));

    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let result = runner.run_script("E7", "print(1)", &[], 0, cancel_rx).await;

    assert!(!result.success);
    assert!(
        result.stderr.contains("Process error occurred."),
        "stderr: {}",
        result.stderr
    );
}

#[tokio::test]
async fn syntax_check_accepts_valid_and_flags_invalid() {
    let dir = tempdir().unwrap();
    let Some(runner) = make_runner(dir.path()) else {
        eprintln!("Skipping syntax_check_accepts_valid_and_flags_invalid: no python interpreter");
        return;
    };

    let (_tx, cancel_rx) = oneshot::channel();
    let good = runner
        .check_syntax("S1", "def fine():\n    return 1\n", cancel_rx)
        .await;
    assert!(good.success, "stderr: {}", good.stderr);

    let (_tx, cancel_rx) = oneshot::channel();
    let bad = runner.check_syntax("S2", "def broken(:\n", cancel_rx).await;
    assert!(!bad.success);
    assert!(
        bad.stderr.contains("SyntaxError"),
        "stderr: {}",
        bad.stderr
    );
}

#[tokio::test]
async fn syntax_check_does_not_execute_the_script() {
    let dir = tempdir().unwrap();
    let Some(runner) = make_runner(dir.path()) else {
        eprintln!("Skipping syntax_check_does_not_execute_the_script: no python interpreter");
        return;
    };

    let (_tx, cancel_rx) = oneshot::channel();
    let result = runner
        .check_syntax("S3", "print('side effect')", cancel_rx)
        .await;

    assert!(result.success);
    assert!(!result.stdout.contains("side effect"));
}
