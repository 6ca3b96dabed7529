use crate::error::SimpleCmdError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Spawn or wait failed without a usable process exit status.
pub const ERR_CODE: i32 = -1;

/// Execution was forcibly terminated after the timeout elapsed.
pub const ERR_CODE_PROCESS: i32 = -2;

/// Lifecycle status of a process run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    #[serde(rename = "not started")]
    NotStarted,
    #[serde(rename = "in progress")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "completed with timeout")]
    CompletedWithTimeout,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NotStarted => "not started",
            Status::Running => "in progress",
            Status::Completed => "completed",
            Status::CompletedWithTimeout => "completed with timeout",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    /// The executable could not be started.
    SpawnFailed,
    /// Waiting on the child failed without an exit status.
    WaitFailed,
    /// The timeout fired and the child was killed.
    TimedOut,
    /// The child exited on its own with this code.
    Exited(i32),
    /// The child was terminated by a signal the runner did not send.
    Signaled(i32),
}

impl Outcome {
    /// Project the outcome onto the integer exit code contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::SpawnFailed | Outcome::WaitFailed | Outcome::Signaled(_) => ERR_CODE,
            Outcome::TimedOut => ERR_CODE_PROCESS,
            Outcome::Exited(code) => *code,
        }
    }
}

/// An external command to run: program, arguments and launch settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Bound the run by `timeout`. A zero duration means no bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    /// Bound the run by `secs` seconds. Zero or negative means no bound.
    pub fn with_timeout_secs(self, secs: i64) -> Self {
        let secs = u64::try_from(secs).unwrap_or(0);
        self.with_timeout(Duration::from_secs(secs))
    }

    /// The timeout that actually applies, ignoring a zero value set directly on the field.
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }

    /// Program and arguments joined by spaces.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Immutable record of one run of a command
#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub id: Uuid,
    pub command: String,
    pub pid: Option<u32>,
    pub status: Status,
    pub outcome: Outcome,
    pub output: String,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SimpleCmdError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

fn serialize_error<S>(error: &Option<SimpleCmdError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match error {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

impl ExecutionResult {
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn error(&self) -> Option<&SimpleCmdError> {
        self.error.as_ref()
    }

    pub fn is_timeout(&self) -> bool {
        self.status == Status::CompletedWithTimeout
    }

    /// Split into the `(exit code, output, error)` triple.
    pub fn into_parts(self) -> (i32, String, Option<SimpleCmdError>) {
        (self.outcome.exit_code(), self.output, self.error)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Exec the command: {}", self.command)?;
        writeln!(f, "Status          : {}", self.status)?;
        writeln!(f, "ExitCode        : {}", self.exit_code())?;
        writeln!(f, "Output          : {}", self.output)
    }
}
