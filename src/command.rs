//! External process invocation
//!
//! The extractor is reached only through [`CommandRunner`], so tests can
//! substitute a scripted runner for the real process.

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Lossy stderr text, trimmed, for log lines and error messages
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Capability to run a program with a fixed argument list
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs real processes with `tokio::process`
#[derive(Debug, Clone)]
pub struct ProcessCommandRunner {
    timeout: Duration,
}

impl ProcessCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        ProcessCommandRunner { timeout }
    }
}

impl Default for ProcessCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let started = Instant::now();
        debug!("Spawning program={} args={:?}", program, args);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!("Failed to spawn program={}: {}", program, e);
                RelayError::extraction_failed(None, format!("failed to spawn {}: {}", program, e))
            })?;

        // Dropping the future on timeout drops the child, which kills it
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!("program={} timed out after {:?}", program, self.timeout);
                RelayError::extraction_failed(
                    None,
                    format!("{} timed out after {:?}", program, self.timeout),
                )
            })?
            .map_err(|e| RelayError::extraction_failed(None, format!("wait failed: {}", e)))?;

        debug!(
            "program={} exited with {:?} in {:?}",
            program,
            output.status.code(),
            started.elapsed()
        );

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
