//! Script parsing and interpretation.
//!
//! `parser` turns raw script text into a flat sequence of typed statements;
//! `executor` groups them into blocks and drives execution, delegating
//! command statements to the pipeline engine. `condition` implements the
//! shell-test-style boolean evaluator and `expand` the variable expansion
//! both rely on.

pub mod condition;
pub mod executor;
pub mod expand;
pub mod parser;

pub use executor::{ExecOptions, ExecutionContext, ScriptExecutor};
pub use parser::{parse_script, ConditionalKind, LoopHeader, ScriptStatement, StatementKind};
