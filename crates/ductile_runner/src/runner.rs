//! Subprocess lifecycle: spawn, feed, drain, deadline, classify.

use crate::cancel::CancellationToken;
use chrono::{DateTime, Utc};
use ductile_protocol::{
    decode_response, decode_response_lenient, encode_request, LenientDecode, ProtocolError,
    Request, Response,
};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How often the wait loop re-checks cancellation and the deadline.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Grace between SIGTERM and SIGKILL.
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// How much raw stdout to quote in diagnostics.
const SNIPPET_LEN: usize = 256;

/// Errors from one plugin invocation.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn plugin {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write request to plugin stdin: {0}")]
    StdinWrite(#[source] io::Error),

    #[error("plugin exceeded its deadline and was killed (stderr: {stderr:?})")]
    Timeout { stderr: String },

    #[error("plugin invocation cancelled")]
    Cancelled,

    #[error("plugin exited with {code} and produced no output (stderr: {stderr:?})")]
    ExitFailure { code: String, stderr: String },

    #[error("plugin protocol error: {reason} (stdout: {snippet:?})")]
    Protocol {
        reason: String,
        snippet: String,
        /// Full stdout, preserved for the operator.
        raw: Vec<u8>,
        /// Best-effort lenient parse, if stdout was almost a response.
        parsed: Option<Response>,
        stderr: String,
    },

    #[error("plugin I/O error: {0}")]
    Io(#[source] io::Error),
}

impl RunnerError {
    /// Whether the dispatcher should retry the job.
    ///
    /// Timeouts, cancellation, and plumbing failures are transient. A
    /// protocol error is only retryable when a lenient parse recovered a
    /// response that explicitly asked for retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunnerError::Timeout { .. }
            | RunnerError::Cancelled
            | RunnerError::StdinWrite(_)
            | RunnerError::ExitFailure { .. }
            | RunnerError::Io(_) => true,
            RunnerError::Spawn { .. } => false,
            RunnerError::Protocol { parsed, .. } => {
                matches!(parsed, Some(resp) if resp.retry == Some(true))
            }
        }
    }
}

/// Executes plugin binaries under the envelope protocol.
pub struct PluginRunner {
    kill_grace: Duration,
}

impl Default for PluginRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRunner {
    pub fn new() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Override the SIGTERM -> SIGKILL grace (tests use a short one).
    pub fn with_kill_grace(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Run one plugin invocation to completion.
    ///
    /// `deadline` is absolute; it is the same instant the request
    /// envelope carries in `deadline_at`, so the plugin and the runner
    /// agree on when time is up.
    pub async fn run(
        &self,
        executable: &Path,
        request: &Request,
        deadline: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Response, RunnerError> {
        let encoded = encode_request(request).map_err(|e| RunnerError::Protocol {
            reason: e.to_string(),
            snippet: String::new(),
            raw: Vec::new(),
            parsed: None,
            stderr: String::new(),
        })?;

        let mut child = Command::new(executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                path: executable.to_path_buf(),
                source,
            })?;

        debug!(
            "Spawned plugin {} for job {} (pid {:?})",
            executable.display(),
            request.job_id,
            child.id()
        );

        // Feed the request and close stdin so the plugin sees EOF.
        let mut stdin = child.stdin.take().ok_or_else(|| {
            RunnerError::Io(io::Error::other("child stdin was not piped"))
        })?;
        if let Err(e) = stdin.write_all(&encoded).await {
            self.terminate(&mut child).await;
            return Err(RunnerError::StdinWrite(e));
        }
        drop(stdin);

        // Drain both output pipes concurrently while waiting for exit.
        let mut stdout_pipe = child.stdout.take().ok_or_else(|| {
            RunnerError::Io(io::Error::other("child stdout was not piped"))
        })?;
        let mut stderr_pipe = child.stderr.take().ok_or_else(|| {
            RunnerError::Io(io::Error::other("child stderr was not piped"))
        })?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let status = loop {
            if cancel.is_cancelled() {
                self.terminate(&mut child).await;
                collect_bounded(stdout_task).await;
                collect_bounded(stderr_task).await;
                return Err(RunnerError::Cancelled);
            }
            let remaining = (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                self.terminate(&mut child).await;
                collect_bounded(stdout_task).await;
                let stderr = String::from_utf8_lossy(&collect_bounded(stderr_task).await)
                    .trim()
                    .to_string();
                return Err(RunnerError::Timeout { stderr });
            }

            // Child::wait is cancel safe, so bailing out of the timeout
            // does not lose the exit status.
            match tokio::time::timeout(remaining.min(WAIT_POLL_INTERVAL), child.wait()).await {
                Ok(Ok(status)) => break status,
                Ok(Err(e)) => return Err(RunnerError::Io(e)),
                Err(_elapsed) => continue,
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default())
            .trim()
            .to_string();

        if !status.success() && stdout.iter().all(u8::is_ascii_whitespace) {
            let code = status
                .code()
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "a signal".to_string());
            return Err(RunnerError::ExitFailure { code, stderr });
        }

        match decode_response(&stdout) {
            Ok(response) => Ok(response),
            Err(strict_err) => Err(protocol_error(strict_err, stdout, stderr)),
        }
    }

    /// SIGTERM, wait out the grace, then SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                debug!("SIGTERM to {} failed: {}", pid, e);
            }
            match tokio::time::timeout(self.kill_grace, child.wait()).await {
                Ok(_) => return,
                Err(_elapsed) => {
                    warn!("Plugin ignored SIGTERM for {:?}, killing", self.kill_grace);
                }
            }
        }
        let _ = child.kill().await;
    }
}

/// Drain a pipe-reader task after the child was killed.
///
/// A killed plugin may leave grandchildren holding the pipe's write end
/// open, so this waits only briefly for whatever bytes made it out and
/// then abandons the reader.
async fn collect_bounded(mut task: tokio::task::JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(Duration::from_millis(500), &mut task).await {
        Ok(result) => result.unwrap_or_default(),
        Err(_elapsed) => {
            task.abort();
            Vec::new()
        }
    }
}

fn protocol_error(strict_err: ProtocolError, stdout: Vec<u8>, stderr: String) -> RunnerError {
    let snippet = String::from_utf8_lossy(&stdout[..stdout.len().min(SNIPPET_LEN)]).into_owned();
    match decode_response_lenient(&stdout) {
        LenientDecode::Parsed(parsed) => RunnerError::Protocol {
            reason: strict_err.to_string(),
            snippet,
            raw: stdout,
            parsed: Some(parsed),
            stderr,
        },
        LenientDecode::Garbage { raw, error } => RunnerError::Protocol {
            reason: error,
            snippet,
            raw,
            parsed: None,
            stderr,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ductile_protocol::{Command as PluginCommand, ResponseStatus, PROTOCOL_VERSION};
    use serde_json::Map;
    use std::os::unix::fs::PermissionsExt;

    fn script_plugin(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn request() -> Request {
        Request {
            protocol: PROTOCOL_VERSION,
            job_id: "job-1".into(),
            command: PluginCommand::Poll,
            config: Map::new(),
            state: Map::new(),
            context: None,
            workspace_dir: None,
            event: None,
            deadline_at: Utc::now() + chrono::Duration::seconds(30),
        }
    }

    fn deadline_in(ms: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(ms)
    }

    #[tokio::test]
    async fn well_behaved_plugin_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(
            dir.path(),
            "ok",
            r#"cat > /dev/null
printf '{"status":"ok","state_updates":{"seen":1}}\n'"#,
        );

        let runner = PluginRunner::new();
        let response = runner
            .run(&plugin, &request(), deadline_in(30_000), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.state_updates.get("seen"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn garbage_stdout_surfaces_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(
            dir.path(),
            "garbage",
            r#"cat > /dev/null
echo 'Traceback (most recent call last):'"#,
        );

        let runner = PluginRunner::new();
        let err = runner
            .run(&plugin, &request(), deadline_in(30_000), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RunnerError::Protocol { raw, parsed, .. } => {
                assert!(String::from_utf8_lossy(&raw).contains("Traceback"));
                assert!(parsed.is_none());
            }
            other => panic!("expected Protocol, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_fields_fail_strict_but_parse_leniently() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(
            dir.path(),
            "extra",
            r#"cat > /dev/null
printf '{"status":"ok","unexpected":1}\n'"#,
        );

        let runner = PluginRunner::new();
        let err = runner
            .run(&plugin, &request(), deadline_in(30_000), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RunnerError::Protocol { parsed, .. } => {
                assert_eq!(parsed.unwrap().status, ResponseStatus::Ok);
            }
            other => panic!("expected Protocol, got {other:?}"),
        }
        // Without an explicit retry:true the protocol error is final.
        let dir2 = tempfile::tempdir().unwrap();
        let plugin2 = script_plugin(
            dir2.path(),
            "extra-retry",
            r#"cat > /dev/null
printf '{"status":"error","error":"flaky","retry":true,"unexpected":1}\n'"#,
        );
        let err2 = runner
            .run(&plugin2, &request(), deadline_in(30_000), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err2.is_retryable());
    }

    #[tokio::test]
    async fn nonzero_exit_with_empty_stdout_decorates_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(
            dir.path(),
            "crash",
            r#"cat > /dev/null
echo 'cannot reach upstream' >&2
exit 3"#,
        );

        let runner = PluginRunner::new();
        let err = runner
            .run(&plugin, &request(), deadline_in(30_000), &CancellationToken::new())
            .await
            .unwrap_err();
        match &err {
            RunnerError::ExitFailure { code, stderr } => {
                assert!(code.contains("3"));
                assert!(stderr.contains("cannot reach upstream"));
            }
            other => panic!("expected ExitFailure, got {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn deadline_kills_the_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(
            dir.path(),
            "slow",
            r#"cat > /dev/null
sleep 30
printf '{"status":"ok"}\n'"#,
        );

        let runner = PluginRunner::with_kill_grace(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = runner
            .run(&plugin, &request(), deadline_in(400), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_stops_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script_plugin(
            dir.path(),
            "slow",
            r#"cat > /dev/null
sleep 30"#,
        );

        let cancel = CancellationToken::new();
        let runner = PluginRunner::with_kill_grace(Duration::from_millis(200));
        let req = request();
        let run = runner.run(&plugin, &req, deadline_in(60_000), &cancel);
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(run, canceller);
        assert!(matches!(result, Err(RunnerError::Cancelled)));
    }
}
