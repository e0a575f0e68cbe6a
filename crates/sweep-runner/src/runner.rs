use crate::config::SweepSpec;
use crate::error::RunnerError;
use crate::expand::InstanceParams;
use crate::process::ScopedProcess;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Written by the solver into its `--output` directory.
pub const RESULT_FILE: &str = "tasks.txt";

/// Exit status of `timeout(1)` when it had to signal the command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// 128 + SIGKILL; what `timeout(1)` reports when KILL was needed.
pub const KILLED_EXIT_CODE: i32 = 137;

const OUTPUT_SUBDIR: &str = "output";
const STDOUT_LOG: &str = "stdout.log";
const STDERR_LOG: &str = "stderr.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
        }
    }
}

/// How one instance ended. Only a success carries a count and a duration.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub completed_tasks: Option<u64>,
    pub runtime: Option<Duration>,
}

impl RunOutcome {
    pub fn succeeded(completed_tasks: u64, runtime: Duration) -> Self {
        Self {
            status: RunStatus::Succeeded,
            exit_code: Some(0),
            completed_tasks: Some(completed_tasks),
            runtime: Some(runtime),
        }
    }

    pub fn failed(exit_code: Option<i32>) -> Self {
        Self {
            status: RunStatus::Failed,
            exit_code,
            completed_tasks: None,
            runtime: None,
        }
    }

    pub fn timed_out(exit_code: Option<i32>) -> Self {
        Self {
            status: RunStatus::TimedOut,
            exit_code,
            completed_tasks: None,
            runtime: None,
        }
    }

    pub fn runtime_s(&self) -> Option<f64> {
        self.runtime.map(|d| d.as_secs_f64())
    }
}

/// Position of an instance in the sweep, for progress lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub sequence: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub binary: PathBuf,
    pub timeout_command: String,
    pub timeout: Duration,
    /// Extra time past `timeout` before the runner kills the group itself.
    pub kill_grace: Duration,
    pub poll_interval: Duration,
}

impl RunnerConfig {
    pub fn from_spec(spec: &SweepSpec) -> Self {
        Self {
            binary: spec.binary_path(),
            timeout_command: spec.timeout_wrapper().to_string(),
            timeout: spec.time_limit(),
            kill_grace: spec.kill_grace(),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Runs one instance of the solver under the timeout wrapper.
#[derive(Debug, Clone)]
pub struct InstanceRunner {
    config: RunnerConfig,
}

impl InstanceRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// `<wrapper> <timeout_s> <binary> --output=<dir> --k=v ...`
    pub fn command_line(&self, output_dir: &Path, params: &InstanceParams) -> Vec<String> {
        let mut argv = vec![
            self.config.timeout_command.clone(),
            self.config.timeout.as_secs().to_string(),
            self.config.binary.to_string_lossy().to_string(),
            format!("--output={}", output_dir.display()),
        ];
        argv.extend(params.to_args());
        argv
    }

    pub fn run(
        &self,
        params: &InstanceParams,
        dispatch: Dispatch,
    ) -> Result<RunOutcome, RunnerError> {
        let scratch = tempfile::Builder::new()
            .prefix("sweep-instance-")
            .tempdir()
            .map_err(RunnerError::Scratch)?;
        let output_dir = scratch.path().join(OUTPUT_SUBDIR);
        fs::create_dir(&output_dir).map_err(RunnerError::Scratch)?;
        let stdout_path = scratch.path().join(STDOUT_LOG);
        let stderr_path = scratch.path().join(STDERR_LOG);

        let argv = self.command_line(&output_dir, params);
        info!(
            "Running command ({}/{}): {}",
            dispatch.sequence,
            dispatch.total,
            shell_join(&argv)
        );

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(
            File::create(&stdout_path).map_err(RunnerError::Capture)?,
        ));
        cmd.stderr(Stdio::from(
            File::create(&stderr_path).map_err(RunnerError::Capture)?,
        ));

        let started = Instant::now();
        // Declared after `scratch` so the group is killed before the
        // directory is removed.
        let mut process = ScopedProcess::spawn(cmd).map_err(|source| RunnerError::Spawn {
            command: argv[0].clone(),
            source,
        })?;
        let deadline = self.config.timeout + self.config.kill_grace;
        let (status, backstop_fired) = match process
            .wait_timeout(deadline, self.config.poll_interval)
            .map_err(RunnerError::Wait)?
        {
            Some(status) => (status, false),
            None => {
                warn!(
                    "instance {}/{} still running {:.1}s after launch; killing process group {}",
                    dispatch.sequence,
                    dispatch.total,
                    deadline.as_secs_f64(),
                    process.id()
                );
                (process.terminate().map_err(RunnerError::Wait)?, true)
            }
        };
        let runtime = started.elapsed();

        let outcome = match classify_exit(status, backstop_fired, runtime, self.config.timeout) {
            RunStatus::Succeeded => {
                let count = parse_completed_tasks(&output_dir.join(RESULT_FILE))?;
                RunOutcome::succeeded(count, runtime)
            }
            RunStatus::Failed => {
                debug!(
                    "instance {}/{} failed with {}: {}",
                    dispatch.sequence,
                    dispatch.total,
                    describe_status(&status),
                    stderr_tail(&stderr_path)
                );
                RunOutcome::failed(status.code())
            }
            RunStatus::TimedOut => {
                info!(
                    "instance {}/{} timed out after {}s",
                    dispatch.sequence,
                    dispatch.total,
                    self.config.timeout.as_secs()
                );
                RunOutcome::timed_out(status.code())
            }
        };
        drop(process);
        Ok(outcome)
    }
}

/// Exit code 124 always means the wrapper fired; 137 only counts as a
/// timeout once the limit has actually elapsed, since a solver killed for
/// another reason reports the same code.
pub fn classify_exit(
    status: ExitStatus,
    backstop_fired: bool,
    runtime: Duration,
    timeout: Duration,
) -> RunStatus {
    if backstop_fired {
        return RunStatus::TimedOut;
    }
    match status.code() {
        Some(0) => RunStatus::Succeeded,
        Some(TIMEOUT_EXIT_CODE) => RunStatus::TimedOut,
        Some(KILLED_EXIT_CODE) if runtime >= timeout => RunStatus::TimedOut,
        _ => RunStatus::Failed,
    }
}

/// The completed-task count is the last whitespace-separated token of the
/// last non-empty line.
pub fn parse_completed_tasks(path: &Path) -> Result<u64, RunnerError> {
    let contents = fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            RunnerError::MissingResult {
                path: path.to_path_buf(),
            }
        } else {
            RunnerError::ReadResult {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    let line = contents
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("");
    line.split_whitespace()
        .last()
        .and_then(|token| token.parse::<u64>().ok())
        .ok_or_else(|| RunnerError::MalformedResult {
            path: path.to_path_buf(),
            line: line.to_string(),
        })
}

fn describe_status(status: &ExitStatus) -> String {
    status
        .code()
        .map(|c| format!("exit code {}", c))
        .unwrap_or_else(|| "signal".to_string())
}

fn stderr_tail(path: &Path) -> String {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| {
            s.lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| l.trim().to_string())
        })
        .unwrap_or_else(|| "no stderr output".to_string())
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
