//! Pipeline parsing and execution.
//!
//! A command line is parsed into a [`CommandPipeline`] of stages connected
//! stdout-to-stdin, then executed by the [`PipelineEngine`] which dispatches
//! each stage to a built-in handler, a registry command, or a module binary
//! resolved through the virtual filesystem.

mod engine;
mod parse;

pub use engine::{PipelineContext, PipelineEngine};
pub use parse::{
    parse_pipeline, CommandPipeline, PipelineStage, Redirect, RedirectKind,
};
pub(crate) use parse::{extract_redirects, tokenize};
