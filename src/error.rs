//! Error taxonomy for the shell execution core.
//!
//! Script-side failures ([`ShellError`]) carry the 1-based line they
//! originated from; module-side failures ([`ModuleError`]) carry the module
//! name, the failed operation, and optional diagnostic context for logging.
//! Job-control operations do not appear here: they are advisory and report
//! failure through `bool`/`Option` returns instead.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while parsing or executing shell scripts.
#[derive(Debug, Error)]
pub enum ShellError {
    /// Syntax error found during parsing. Aborts the whole parse; no partial
    /// statement list is produced.
    #[error("syntax error on line {line}: {message}")]
    Syntax {
        /// 1-based line number.
        line: u32,
        /// Human-readable description.
        message: String,
    },

    /// Execution error, wrapped with the originating statement's context.
    #[error("error on line {line} (`{statement}`): {message}")]
    Script {
        /// 1-based line number of the failing statement.
        line: u32,
        /// The raw statement text.
        statement: String,
        /// Human-readable description.
        message: String,
    },
}

impl ShellError {
    /// Wrap a bare message with statement context, preserving the innermost
    /// location when the error is already statement-scoped.
    pub(crate) fn in_statement(self, line: u32, statement: &str) -> ShellError {
        match self {
            ShellError::Syntax { message, .. } => ShellError::Script {
                line,
                statement: statement.to_string(),
                message,
            },
            script @ ShellError::Script { .. } => script,
        }
    }
}

/// Diagnostic context attached to module execution failures.
#[derive(Debug, Clone, Default)]
pub struct ModuleDiagnostics {
    /// Process id the execution was running under.
    pub process_id: u32,
    /// Wall-clock time spent before the failure.
    pub execution_time: Duration,
    /// Partially captured stdout, if any.
    pub stdout: String,
    /// Partially captured stderr, if any.
    pub stderr: String,
}

/// Errors raised by the module runtime host.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// The binary failed validation, compilation, or instantiation.
    #[error("failed to load module `{module}`: {reason}")]
    Load {
        /// Name the module was loaded under.
        module: String,
        /// Underlying failure description.
        reason: String,
    },

    /// The named export is missing, not callable, or trapped during execution.
    #[error("execution failed in module `{module}`: {reason}")]
    Execution {
        /// Name of the module.
        module: String,
        /// Underlying failure description.
        reason: String,
        /// Diagnostics captured up to the failure.
        diagnostics: ModuleDiagnostics,
    },

    /// The wall-clock execution budget elapsed before the call returned.
    #[error("module `{module}` timed out after {timeout:?}")]
    Timeout {
        /// Name of the module.
        module: String,
        /// The configured budget.
        timeout: Duration,
        /// Diagnostics captured up to the timeout.
        diagnostics: ModuleDiagnostics,
    },

    /// Linear-memory allocation or growth exceeded the configured bounds.
    #[error("memory error in module `{module}`: {reason}")]
    Memory {
        /// Name of the module.
        module: String,
        /// Underlying failure description.
        reason: String,
    },
}

impl ModuleError {
    /// The module name the error is attributed to.
    pub fn module_name(&self) -> &str {
        match self {
            ModuleError::Load { module, .. }
            | ModuleError::Execution { module, .. }
            | ModuleError::Timeout { module, .. }
            | ModuleError::Memory { module, .. } => module,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_display() {
        let e = ShellError::Syntax {
            line: 3,
            message: "invalid variable name".into(),
        };
        assert_eq!(e.to_string(), "syntax error on line 3: invalid variable name");
    }

    #[test]
    fn test_in_statement_preserves_inner_location() {
        let inner = ShellError::Script {
            line: 5,
            statement: "echo $x".into(),
            message: "boom".into(),
        };
        // Re-wrapping at an outer loop statement keeps the inner line.
        let wrapped = inner.in_statement(2, "while true");
        match wrapped {
            ShellError::Script { line, .. } => assert_eq!(line, 5),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_module_error_name() {
        let e = ModuleError::Load {
            module: "tool".into(),
            reason: "bad magic".into(),
        };
        assert_eq!(e.module_name(), "tool");
    }
}
