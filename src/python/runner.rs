//! Script execution - spawn, time out, cancel, and harvest Python children

use super::{PythonEnv, PythonResult};
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, timeout};

/// Grace period between killing a child and giving up on reaping it.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Probe executed with the script source as `sys.argv[1]`; compiling
/// instead of executing keeps syntax checking side-effect free, and passing
/// the source as an argument avoids any escaping of its content.
const SYNTAX_PROBE: &str = concat!(
    "import sys\n",
    "try:\n",
    "    compile(sys.argv[1], '<string>', 'exec')\n",
    "except SyntaxError as e:\n",
    "    print('SyntaxError: {} at line {}'.format(e.msg, e.lineno), file=sys.stderr)\n",
    "    sys.exit(1)\n",
);

/// Spawns and supervises Python children for script execution.
pub struct ScriptRunner {
    env: Arc<PythonEnv>,
}

/// How a supervised child ended.
enum Outcome {
    Exited(std::process::ExitStatus),
    ProcessError(std::io::Error),
    TimedOut,
    Cancelled,
}

impl ScriptRunner {
    pub fn new(env: Arc<PythonEnv>) -> Self {
        Self { env }
    }

    /// Run a script to completion.
    ///
    /// The script is passed via `-c`; arguments become `sys.argv[1..]`, each
    /// JSON scalar rendered as its JSON text (strings verbatim, numbers in
    /// decimal form, booleans `true`/`false`). A non-positive `timeout_ms`
    /// disables the deadline. Exactly one result is produced, whether the
    /// child exits, times out, is cancelled, or fails to spawn.
    pub async fn run_script(
        &self,
        execution_id: &str,
        script: &str,
        arguments: &[Value],
        timeout_ms: i64,
        cancel: oneshot::Receiver<()>,
    ) -> PythonResult {
        let started = Instant::now();

        let mut cmd = self.env.command();
        cmd.arg("-c").arg(script);
        for argument in arguments {
            cmd.arg(argument_text(argument));
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!("Failed to spawn interpreter for {execution_id}: {err}");
                return PythonResult {
                    execution_id: execution_id.to_string(),
                    success: false,
                    stderr: format!("{err} Process error occurred."),
                    execution_time_ms: started.elapsed().as_millis() as i64,
                    ..Default::default()
                };
            }
        };

        let stdout_task = drain_pipe(child.stdout.take());
        let stderr_task = drain_pipe(child.stderr.take());

        let outcome = supervise(&mut child, timeout_ms, cancel).await;

        if matches!(outcome, Outcome::TimedOut | Outcome::Cancelled) {
            let _ = child.start_kill();
            let _ = timeout(KILL_GRACE, child.wait()).await;
        }

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let mut result = PythonResult {
            execution_id: execution_id.to_string(),
            stdout,
            stderr,
            ..Default::default()
        };

        match outcome {
            Outcome::Exited(status) => {
                result.success = status.success();
                result.error_code = status.code().filter(|code| *code != 0).map(i64::from);
            }
            Outcome::ProcessError(err) => {
                result.success = false;
                result.stderr.push_str(&format!("{err} Process error occurred."));
            }
            Outcome::TimedOut => {
                tracing::warn!("Execution {execution_id} timed out after {timeout_ms} ms");
                result.success = false;
                result.stderr.push_str("Execution timed out.");
            }
            Outcome::Cancelled => {
                tracing::info!("Execution {execution_id} cancelled");
                result.success = false;
                result.cancelled = true;
                result.stderr.push_str("Execution canceled by user.");
            }
        }

        result.execution_time_ms = started.elapsed().as_millis() as i64;
        result
    }

    /// Compile-check a script without executing it. The `SyntaxError` text,
    /// if any, arrives on stderr of the result.
    pub async fn check_syntax(
        &self,
        execution_id: &str,
        script: &str,
        cancel: oneshot::Receiver<()>,
    ) -> PythonResult {
        let arguments = [Value::String(script.to_string())];
        self.run_script(execution_id, SYNTAX_PROBE, &arguments, 0, cancel)
            .await
    }
}

/// Wait for child exit, deadline, or cancellation, whichever comes first.
async fn supervise(
    child: &mut Child,
    timeout_ms: i64,
    mut cancel: oneshot::Receiver<()>,
) -> Outcome {
    let deadline = (timeout_ms > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_millis(timeout_ms as u64));

    tokio::select! {
        res = child.wait() => match res {
            Ok(status) => Outcome::Exited(status),
            Err(err) => Outcome::ProcessError(err),
        },
        _ = &mut cancel => Outcome::Cancelled,
        _ = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        } => Outcome::TimedOut,
    }
}

/// Read a child pipe to the end on a separate task.
fn drain_pipe<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return String::new();
        };
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes).await;
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

/// Render one script argument for `sys.argv`: strings pass through verbatim,
/// every other scalar uses its JSON text.
pub fn argument_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
