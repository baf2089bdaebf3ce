//! The uniform execution result shape.
//!
//! Commands, pipelines, and scripts all report back through [`ExecutionResult`].
//! Failure paths are expected to produce this shape too, with a non-zero exit
//! code and a human-readable stderr message, rather than letting an internal
//! error escape unformatted.

use std::time::Duration;

/// Result of executing a command, pipeline, or script.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Identifier of the process record created for this invocation.
    pub process_id: u32,
    /// The originating command string.
    pub command: String,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code (0 = success).
    pub exit_code: i32,
    /// Wall-clock execution time.
    pub execution_time: Duration,
}

impl ExecutionResult {
    /// Successful result carrying only stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            process_id: 0,
            command: String::new(),
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            execution_time: Duration::ZERO,
        }
    }

    /// Failed result carrying a stderr message and exit code.
    pub fn error(stderr: impl Into<String>, exit_code: i32) -> Self {
        let mut stderr = stderr.into();
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        Self {
            process_id: 0,
            command: String::new(),
            stdout: String::new(),
            stderr,
            exit_code,
            execution_time: Duration::ZERO,
        }
    }

    /// True when the exit code signals success.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stamp the process-level bookkeeping fields onto this result.
    pub(crate) fn finalized(
        mut self,
        process_id: u32,
        command: &str,
        execution_time: Duration,
    ) -> Self {
        self.process_id = process_id;
        self.command = command.to_string();
        self.execution_time = execution_time;
        self
    }
}
