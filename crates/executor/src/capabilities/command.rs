//! External command execution as argument vectors with timeouts.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::CapabilityError;

/// Captured output of a finished external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for running external programs.
///
/// Implementations receive a full argument vector; there is no shell in
/// between, so operand values can never be reinterpreted as syntax.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `argv[0]` with `argv[1..]` as arguments.
    ///
    /// The process is killed once `timeout` elapses and the call fails
    /// with [`CapabilityError::Timeout`].
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, CapabilityError>;
}

/// Command runner backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    /// Creates a new system command runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, CapabilityError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| CapabilityError::Io(std::io::Error::other("empty argument vector")))?;

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| CapabilityError::Timeout {
                program: program.clone(),
                timeout_secs: timeout.as_secs(),
            })??;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[derive(Debug, Default)]
struct InMemoryCommandState {
    invocations: Vec<Vec<String>>,
    timeouts_remaining: HashMap<String, u32>,
    exit_codes: HashMap<String, i32>,
    hanging: HashMap<String, bool>,
}

/// In-memory command runner for testing.
///
/// Records every invocation and can be scripted to time out, hang past
/// the caller's deadline, or exit non-zero per program.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCommandRunner {
    state: Arc<RwLock<InMemoryCommandState>>,
}

impl InMemoryCommandRunner {
    /// Creates a new in-memory command runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` invocations of `program` fail with a timeout.
    pub fn time_out_times(&self, program: &str, n: u32) {
        self.state
            .write()
            .unwrap()
            .timeouts_remaining
            .insert(program.to_string(), n);
    }

    /// Makes every invocation of `program` exit with the given status.
    pub fn set_exit_code(&self, program: &str, code: i32) {
        self.state
            .write()
            .unwrap()
            .exit_codes
            .insert(program.to_string(), code);
    }

    /// Makes `program` sleep past the caller's deadline.
    pub fn hang(&self, program: &str) {
        self.state
            .write()
            .unwrap()
            .hanging
            .insert(program.to_string(), true);
    }

    /// Returns every recorded invocation.
    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.state.read().unwrap().invocations.clone()
    }

    /// Returns the invocations of a specific program.
    pub fn invocations_of(&self, program: &str) -> Vec<Vec<String>> {
        self.state
            .read()
            .unwrap()
            .invocations
            .iter()
            .filter(|argv| argv.first().is_some_and(|p| p == program))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandRunner for InMemoryCommandRunner {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, CapabilityError> {
        let program = argv
            .first()
            .cloned()
            .ok_or_else(|| CapabilityError::Io(std::io::Error::other("empty argument vector")))?;

        let (timed_out, hangs, exit_code) = {
            let mut state = self.state.write().unwrap();
            state.invocations.push(argv.to_vec());

            let timed_out = match state.timeouts_remaining.get_mut(&program) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            let hangs = state.hanging.get(&program).copied().unwrap_or(false);
            let exit_code = state.exit_codes.get(&program).copied().unwrap_or(0);
            (timed_out, hangs, exit_code)
        };

        if hangs {
            tokio::time::sleep(timeout + Duration::from_millis(50)).await;
        }

        if timed_out {
            return Err(CapabilityError::Timeout {
                program,
                timeout_secs: timeout.as_secs(),
            });
        }

        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn records_invocations() {
        let runner = InMemoryCommandRunner::new();
        runner
            .run(&argv(&["wget", "-q", "url"]), Duration::from_secs(1))
            .await
            .unwrap();
        runner
            .run(&argv(&["tar", "xzf", "file"]), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(runner.invocations().len(), 2);
        assert_eq!(runner.invocations_of("wget").len(), 1);
    }

    #[tokio::test]
    async fn scripted_timeouts_are_consumed() {
        let runner = InMemoryCommandRunner::new();
        runner.time_out_times("wget", 2);

        for _ in 0..2 {
            let result = runner.run(&argv(&["wget", "url"]), Duration::from_secs(1)).await;
            assert!(matches!(result, Err(CapabilityError::Timeout { .. })));
        }
        let result = runner.run(&argv(&["wget", "url"]), Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn scripted_exit_codes() {
        let runner = InMemoryCommandRunner::new();
        runner.set_exit_code("certbot", 1);

        let output = runner
            .run(&argv(&["certbot", "--apache"]), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, 1);
    }

    #[tokio::test]
    async fn system_runner_runs_true() {
        let runner = SystemCommandRunner::new();
        let output = runner
            .run(&argv(&["true"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success());
    }

    #[tokio::test]
    async fn system_runner_reports_nonzero_exit() {
        let runner = SystemCommandRunner::new();
        let output = runner
            .run(&argv(&["false"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 1);
    }

    #[tokio::test]
    async fn system_runner_enforces_timeout() {
        let runner = SystemCommandRunner::new();
        let result = runner
            .run(&argv(&["sleep", "5"]), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(CapabilityError::Timeout { .. })));
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let runner = SystemCommandRunner::new();
        let result = runner.run(&[], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CapabilityError::Io(_))));
    }
}
