//! A sandboxed shell execution core.
//!
//! Scripts are parsed into typed statements, interpreted by the script
//! executor, and run through a pipeline engine that dispatches to built-in
//! commands, PATH-resolved guest modules (WebAssembly binaries executed by
//! the runtime host), and job-control builtins. All file access goes
//! through a virtual filesystem capability supplied by the embedder.
//!
//! The [`Shell`] facade wires the pieces together for the common case:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use limpet::{MemoryVfs, Shell, ShellConfig};
//! # async fn demo() -> anyhow::Result<()> {
//! let vfs = Arc::new(MemoryVfs::new());
//! let mut shell = Shell::new(&ShellConfig::default(), vfs)?;
//! let result = shell.execute("VAR=hello\necho $VAR").await;
//! assert_eq!(result.stdout, "hello\n");
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod result;
pub mod runtime;
pub mod script;
pub mod vfs;

use std::sync::Arc;

pub use commands::{CommandInvocation, CommandRegistry, ShellCommand};
pub use config::{RuntimeConfig, ScriptConfig, ShellConfig};
pub use error::{ModuleError, ShellError};
pub use jobs::{Job, JobStatus, JobTable};
pub use pipeline::{parse_pipeline, CommandPipeline, PipelineContext, PipelineEngine};
pub use result::ExecutionResult;
pub use runtime::{ModuleHost, ModuleInvocation};
pub use script::{parse_script, ExecOptions, ExecutionContext, ScriptExecutor};
pub use vfs::{MemoryVfs, Vfs, VfsError};

/// Ready-wired shell: registry with the standard builtins, a fresh job
/// table, and a module runtime host, all sharing the given filesystem.
/// Variables, functions, and the working directory persist across
/// [`Shell::execute`] calls.
pub struct Shell {
    executor: ScriptExecutor,
    engine: Arc<PipelineEngine>,
    options: ExecOptions,
    ctx: ExecutionContext,
}

impl Shell {
    pub fn new(config: &ShellConfig, vfs: Arc<dyn Vfs>) -> anyhow::Result<Self> {
        let host = Arc::new(ModuleHost::new(&config.runtime)?);
        let engine = Arc::new(PipelineEngine::new(
            Arc::new(CommandRegistry::with_builtins()),
            vfs,
            Arc::new(JobTable::new()),
            host,
        ));
        Ok(Self {
            executor: ScriptExecutor::new(engine.clone()),
            engine,
            options: ExecOptions::from(&config.script),
            ctx: ExecutionContext::new(),
        })
    }

    /// Run a script, carrying shell state over from previous calls.
    pub async fn execute(&mut self, script: &str) -> ExecutionResult {
        let ctx = std::mem::take(&mut self.ctx);
        let (result, ctx) = self.executor.run(script, ctx, &self.options).await;
        self.ctx = ctx;
        result
    }

    /// The shared job table.
    pub fn jobs(&self) -> &Arc<JobTable> {
        self.engine.jobs()
    }

    /// Drain pending job notifications.
    pub fn take_notifications(&self) -> Vec<String> {
        self.engine.jobs().take_notifications()
    }

    /// Current working directory of the shell.
    pub fn cwd(&self) -> &str {
        self.ctx.cwd()
    }
}
