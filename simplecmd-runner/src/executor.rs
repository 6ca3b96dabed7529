use crate::process::{LiveSinks, OutputCapture};
use chrono::{DateTime, Utc};
use simplecmd_core::{CommandSpec, ExecutionResult, Outcome, SimpleCmdError, Status};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

/// How long to keep collecting output from a killed child before returning.
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Runs one external command, optionally bounded by a timeout
pub struct ProcessRunner {
    spec: CommandSpec,
    sinks: LiveSinks,
}

impl ProcessRunner {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_spec(CommandSpec::new(program).with_args(args))
    }

    pub fn from_spec(spec: CommandSpec) -> Self {
        Self {
            spec,
            sinks: LiveSinks::default(),
        }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Bound the run by `timeout`. Zero means wait indefinitely.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.spec.timeout = if timeout.is_zero() { None } else { Some(timeout) };
    }

    /// Bound the run by `secs` seconds. Zero or negative means wait indefinitely.
    pub fn set_timeout_secs(&mut self, secs: i64) {
        self.set_timeout(Duration::from_secs(u64::try_from(secs).unwrap_or(0)));
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    /// Mirror the child's stdout and stderr, together, to `sink`.
    pub fn with_sink<W>(mut self, sink: W) -> Self
    where
        W: Write + Send + 'static,
    {
        self.sinks.combined.push(Box::new(sink));
        self
    }

    /// Mirror the child's stdout to `sink`.
    pub fn with_stdout_sink<W>(mut self, sink: W) -> Self
    where
        W: Write + Send + 'static,
    {
        self.sinks.stdout.push(Box::new(sink));
        self
    }

    /// Mirror the child's stderr to `sink`.
    pub fn with_stderr_sink<W>(mut self, sink: W) -> Self
    where
        W: Write + Send + 'static,
    {
        self.sinks.stderr.push(Box::new(sink));
        self
    }

    pub fn status(&self) -> Status {
        Status::NotStarted
    }

    pub fn output(&self) -> &str {
        ""
    }

    pub fn exit_code(&self) -> i32 {
        0
    }

    /// Run with the child's stdout and stderr mirrored to this process's own.
    pub async fn run_with_output(self) -> ExecutionResult {
        self.with_stdout_sink(io::stdout())
            .with_stderr_sink(io::stderr())
            .run()
            .await
    }

    /// Run the command to completion or until the timeout fires.
    ///
    /// Completion means the child exited and its output reached end of
    /// stream; the timeout bounds both.
    pub async fn run(self) -> ExecutionResult {
        let ProcessRunner { spec, sinks } = self;
        let mut run = RunRecord::begin(&spec);

        debug!(
            execution_id = %run.id,
            command = %run.command,
            timeout_ms = ?spec.effective_timeout().map(|t| t.as_millis() as u64),
            "Starting process"
        );

        let (mut capture, stdout, stderr) = match OutputCapture::open(sinks) {
            Ok(capture) => capture,
            Err(e) => return run.finish(Outcome::SpawnFailed, String::new(), Some(SimpleCmdError::Pipe(e))),
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let spawned = cmd.spawn();
        // Closes our copies of the pipes' write ends so the capture sees EOF.
        drop(cmd);

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                debug!(execution_id = %run.id, program = %spec.program, error = %e, "Failed to start process");
                let error = SimpleCmdError::Spawn {
                    program: spec.program.clone(),
                    source: e,
                };
                return run.finish(Outcome::SpawnFailed, String::new(), Some(error));
            }
        };

        run.status = Status::Running;
        run.pid = child.id();
        debug!(execution_id = %run.id, pid = ?run.pid, "Process running");

        let waited = match spec.effective_timeout() {
            None => wait_for_completion(&mut child, &mut capture).await,
            Some(timeout) => {
                tokio::select! {
                    waited = wait_for_completion(&mut child, &mut capture) => waited,
                    () = tokio::time::sleep(timeout) => {
                        warn!(
                            execution_id = %run.id,
                            pid = ?run.pid,
                            timeout_ms = timeout.as_millis() as u64,
                            "Process timed out, killing it"
                        );
                        // Fails when the child already exited and only its output was still open.
                        let killed = child.start_kill();
                        if killed.is_ok() {
                            // SIGKILL cannot be ignored, so reaping returns promptly.
                            if let Err(e) = child.wait().await {
                                warn!(execution_id = %run.id, pid = ?run.pid, error = %e, "Failed to reap killed process");
                            }
                        }
                        let output = capture.settle(KILL_DRAIN_GRACE).await;
                        return run.finish(Outcome::TimedOut, output, killed.err().map(SimpleCmdError::Kill));
                    }
                }
            }
        };

        let output = capture.snapshot();
        match waited {
            Ok(status) => {
                let (outcome, error) = classify_exit(status);
                run.finish(outcome, output, error)
            }
            Err(e) => run.finish(Outcome::WaitFailed, output, Some(SimpleCmdError::Wait(e))),
        }
    }
}

/// Wait for the child to exit and then for its output to reach end of stream.
async fn wait_for_completion(child: &mut Child, capture: &mut OutputCapture) -> io::Result<ExitStatus> {
    let status = child.wait().await?;
    capture.closed().await;
    Ok(status)
}

/// Map an OS exit status onto an outcome and, for anything but a clean exit, an error.
fn classify_exit(status: ExitStatus) -> (Outcome, Option<SimpleCmdError>) {
    if let Some(code) = status.code() {
        let error = (code != 0).then_some(SimpleCmdError::Exit { code });
        return (Outcome::Exited(code), error);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (Outcome::Signaled(signal), Some(SimpleCmdError::Signal { signal }));
        }
    }

    let error = std::io::Error::other(format!("no exit code available: {}", status));
    (Outcome::WaitFailed, Some(SimpleCmdError::Wait(error)))
}

/// Resolve a bare program name on PATH the way the child will see it.
fn resolve_program(spec: &CommandSpec) -> PathBuf {
    if spec.program.contains(std::path::MAIN_SEPARATOR) || spec.program.contains('/') {
        return PathBuf::from(&spec.program);
    }

    let path_override = spec.env.iter().rev().find(|(k, _)| k == "PATH");
    let resolved = match path_override {
        Some((_, path)) => which::which_in(&spec.program, Some(path), "."),
        None => which::which(&spec.program),
    };
    resolved.unwrap_or_else(|_| PathBuf::from(&spec.program))
}

/// Bookkeeping for a single run; `finish` is the only way to produce a result.
struct RunRecord {
    id: Uuid,
    command: String,
    pid: Option<u32>,
    status: Status,
    started_at: DateTime<Utc>,
    start_instant: Instant,
}

impl RunRecord {
    fn begin(spec: &CommandSpec) -> Self {
        let program = resolve_program(spec);
        let command = std::iter::once(program.display().to_string())
            .chain(spec.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            id: Uuid::new_v4(),
            command,
            pid: None,
            status: Status::NotStarted,
            started_at: Utc::now(),
            start_instant: Instant::now(),
        }
    }

    fn finish(self, outcome: Outcome, output: String, error: Option<SimpleCmdError>) -> ExecutionResult {
        let status = match (self.status, outcome) {
            (Status::NotStarted, _) => Status::NotStarted,
            (_, Outcome::TimedOut) => Status::CompletedWithTimeout,
            _ => Status::Completed,
        };

        debug!(
            execution_id = %self.id,
            status = %status,
            exit_code = outcome.exit_code(),
            "Process finished"
        );

        ExecutionResult {
            id: self.id,
            command: self.command,
            pid: self.pid,
            status,
            outcome,
            output,
            error,
            started_at: self.started_at,
            completed_at: Some(Utc::now()),
            duration_ms: self.start_instant.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CaptureBuffer;
    use simplecmd_core::{ERR_CODE, ERR_CODE_PROCESS};

    fn sh(script: &str) -> ProcessRunner {
        ProcessRunner::new("sh", ["-c", script])
    }

    fn process_alive(pid: u32) -> bool {
        std::process::Command::new("sh")
            .args(["-c", &format!("kill -0 {}", pid)])
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_runner_echo_completes() {
        let result = ProcessRunner::new("echo", ["hello"]).run().await;

        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.output(), "hello\n");
        assert_eq!(result.status(), Status::Completed);
        assert!(result.error().is_none());
        assert!(result.pid.is_some());
    }

    #[tokio::test]
    async fn test_runner_timeout_kills_process() {
        let started = Instant::now();
        let result = ProcessRunner::new("sleep", ["5"])
            .with_timeout(Duration::from_millis(100))
            .run()
            .await;

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(result.exit_code(), ERR_CODE_PROCESS);
        assert_eq!(result.outcome, Outcome::TimedOut);
        assert_eq!(result.status(), Status::CompletedWithTimeout);
        assert!(result.is_timeout());
        // The kill succeeded, so the timeout carries no error.
        assert!(result.error().is_none());

        let pid = result.pid.unwrap();
        assert!(!process_alive(pid), "process {} still running", pid);
    }

    #[tokio::test]
    async fn test_runner_nonzero_exit_reports_code_and_error() {
        let (code, output, error) = ProcessRunner::new("false", Vec::<String>::new())
            .run()
            .await
            .into_parts();

        assert_eq!(code, 1);
        assert_eq!(output, "");
        assert_eq!(error.and_then(|e| e.exit_code()), Some(1));
    }

    #[tokio::test]
    async fn test_runner_false_status_completed() {
        let result = ProcessRunner::new("false", Vec::<String>::new()).run().await;
        assert_eq!(result.status(), Status::Completed);
        assert!(result.error().is_some());
    }

    #[tokio::test]
    async fn test_runner_spawn_failure() {
        let result = ProcessRunner::new("/nonexistent/binary", Vec::<String>::new())
            .run()
            .await;

        assert_eq!(result.exit_code(), ERR_CODE);
        assert_eq!(result.outcome, Outcome::SpawnFailed);
        assert_eq!(result.output(), "");
        assert_eq!(result.status(), Status::NotStarted);
        assert!(result.pid.is_none());
        assert!(matches!(result.error(), Some(SimpleCmdError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_runner_spawn_failure_with_timeout() {
        let result = ProcessRunner::new("/nonexistent/binary", Vec::<String>::new())
            .with_timeout(Duration::from_secs(1))
            .run()
            .await;

        assert_eq!(result.exit_code(), ERR_CODE);
        assert_eq!(result.status(), Status::NotStarted);
    }

    #[tokio::test]
    async fn test_runner_exit_code_propagates() {
        let result = sh("echo before; exit 7").run().await;

        assert_eq!(result.exit_code(), 7);
        assert_eq!(result.output(), "before\n");
        assert_eq!(result.status(), Status::Completed);
    }

    #[tokio::test]
    async fn test_runner_combined_output_in_order() {
        let result = sh("echo out; echo err 1>&2; echo out2; echo err2 1>&2").run().await;
        assert_eq!(result.output(), "out\nerr\nout2\nerr2\n");
    }

    #[tokio::test]
    async fn test_runner_live_sink_sees_same_output() {
        let mirror = CaptureBuffer::new();
        let result = sh("echo out; echo err 1>&2")
            .with_sink(mirror.clone())
            .run()
            .await;

        assert_eq!(result.output(), "out\nerr\n");
        assert_eq!(mirror.snapshot(), result.output());
    }

    #[tokio::test]
    async fn test_runner_stream_sinks_receive_their_own_stream() {
        let out = CaptureBuffer::new();
        let err = CaptureBuffer::new();
        let both = CaptureBuffer::new();
        let result = sh("echo to-stdout; echo to-stderr 1>&2")
            .with_stdout_sink(out.clone())
            .with_stderr_sink(err.clone())
            .with_sink(both.clone())
            .run()
            .await;

        assert_eq!(out.snapshot(), "to-stdout\n");
        assert_eq!(err.snapshot(), "to-stderr\n");
        assert_eq!(both.len(), result.output().len());
        assert!(result.output().contains("to-stdout\n"));
        assert!(result.output().contains("to-stderr\n"));
        assert_eq!(result.status(), Status::Completed);
    }

    #[tokio::test]
    async fn test_runner_stderr_sink_only() {
        let err = CaptureBuffer::new();
        let result = sh("echo quiet; echo loud 1>&2")
            .with_stderr_sink(err.clone())
            .run()
            .await;

        assert_eq!(err.snapshot(), "loud\n");
        assert_eq!(result.output().len(), "quiet\nloud\n".len());
    }

    #[tokio::test]
    async fn test_runner_run_with_output_still_captures() {
        let result = sh("echo mirrored; echo mirrored-err 1>&2").run_with_output().await;

        assert_eq!(result.exit_code(), 0);
        assert!(result.output().contains("mirrored\n"));
        assert!(result.output().contains("mirrored-err\n"));
    }

    #[tokio::test]
    async fn test_runner_timeout_covers_open_output() {
        let started = Instant::now();
        let result = sh("sleep 4 & echo hi")
            .with_timeout(Duration::from_millis(500))
            .run()
            .await;

        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert_eq!(result.exit_code(), ERR_CODE_PROCESS);
        assert_eq!(result.status(), Status::CompletedWithTimeout);
        assert_eq!(result.output(), "hi\n");
        // The shell itself had already exited, so the kill reports that.
        assert!(matches!(result.error(), Some(SimpleCmdError::Kill(_))));
    }

    #[tokio::test]
    async fn test_runner_zero_timeout_is_unbounded() {
        let mut runner = sh("sleep 0.2; echo done");
        runner.set_timeout(Duration::ZERO);
        assert_eq!(runner.spec().effective_timeout(), None);

        let result = runner.run().await;
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.output(), "done\n");
        assert_eq!(result.status(), Status::Completed);
    }

    #[tokio::test]
    async fn test_runner_negative_timeout_secs_is_unbounded() {
        let mut runner = sh("echo ok");
        runner.set_timeout_secs(-1);
        assert_eq!(runner.spec().effective_timeout(), None);
        assert_eq!(runner.run().await.status(), Status::Completed);
    }

    #[tokio::test]
    async fn test_runner_finishes_within_timeout() {
        let mut runner = sh("echo fast");
        runner.set_timeout_secs(5);

        let result = runner.run().await;
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.output(), "fast\n");
        assert_eq!(result.status(), Status::Completed);
    }

    #[tokio::test]
    async fn test_runner_nonzero_exit_within_timeout() {
        let result = sh("exit 3").with_timeout(Duration::from_secs(5)).run().await;
        assert_eq!(result.exit_code(), 3);
        assert!(matches!(result.error(), Some(SimpleCmdError::Exit { code: 3 })));
    }

    #[tokio::test]
    async fn test_runner_timeout_keeps_partial_output() {
        let result = sh("echo started; exec sleep 5")
            .with_timeout(Duration::from_millis(500))
            .run()
            .await;

        assert_eq!(result.status(), Status::CompletedWithTimeout);
        assert_eq!(result.output(), "started\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runner_signaled_child() {
        let result = sh("kill -9 $$").run().await;

        assert_eq!(result.outcome, Outcome::Signaled(9));
        assert_eq!(result.exit_code(), ERR_CODE);
        assert_eq!(result.status(), Status::Completed);
        assert!(matches!(result.error(), Some(SimpleCmdError::Signal { signal: 9 })));
    }

    #[tokio::test]
    async fn test_runner_env_and_working_dir() {
        let spec = CommandSpec::new("sh")
            .with_args(["-c", "echo $SIMPLECMD_TEST_VAR; pwd"])
            .with_env("SIMPLECMD_TEST_VAR", "bar")
            .with_working_dir("/");

        let result = ProcessRunner::from_spec(spec).run().await;
        assert_eq!(result.output(), "bar\n/\n");
    }

    #[tokio::test]
    async fn test_runner_command_shows_resolved_program() {
        let result = ProcessRunner::new("sh", ["-c", "true"]).run().await;
        assert!(result.command.starts_with('/'), "got: {}", result.command);
        assert!(result.command.ends_with("sh -c true"), "got: {}", result.command);
    }

    #[tokio::test]
    async fn test_runner_reads_are_idempotent() {
        let result = ProcessRunner::new("echo", ["again"]).run().await;

        let first = (result.exit_code(), result.output().to_string(), result.status());
        let second = (result.exit_code(), result.output().to_string(), result.status());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_runner_summary() {
        let result = ProcessRunner::new("echo", ["hello"]).run().await;
        let summary = result.to_string();

        assert!(summary.starts_with("Exec the command: "));
        assert!(summary.contains("Status          : completed\n"));
        assert!(summary.contains("ExitCode        : 0\n"));
        assert!(summary.contains("Output          : hello\n"));
    }

    #[test]
    fn test_runner_defaults_before_run() {
        let runner = ProcessRunner::new("echo", ["hello"]);
        assert_eq!(runner.status(), Status::NotStarted);
        assert_eq!(runner.output(), "");
        assert_eq!(runner.exit_code(), 0);
        assert_eq!(runner.spec().command_line(), "echo hello");
    }

    #[test]
    fn test_resolve_program_keeps_paths() {
        let spec = CommandSpec::new("/bin/sh");
        assert_eq!(resolve_program(&spec), PathBuf::from("/bin/sh"));

        let spec = CommandSpec::new("definitely-not-a-real-program-xyz");
        assert_eq!(
            resolve_program(&spec),
            PathBuf::from("definitely-not-a-real-program-xyz")
        );
    }
}
