//! Pipeline execution and job control.
//!
//! Every pipeline invocation creates a job record before execution and
//! completes it afterward, so the job table always converges to the real
//! outcome. Dispatch order for a stage: engine builtins that need engine
//! state (`cd`, `jobs`, `fg`, `bg`, `kill`, `disown`), then the command
//! registry, then PATH-style resolution against the VFS, where a hit is
//! executed as a guest module. An unresolvable name exits 127.
//!
//! Background pipelines (`&`) return immediately with a job-started message
//! and complete their record from a spawned task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::commands::{CommandInvocation, CommandRegistry};
use crate::error::ModuleError;
use crate::jobs::JobTable;
use crate::result::ExecutionResult;
use crate::runtime::{ModuleHost, ModuleInvocation};
use crate::vfs::{normalize_path, resolve_path, Vfs};

use super::parse::{CommandPipeline, PipelineStage, RedirectKind};

/// Default PATH when the environment does not set one.
const DEFAULT_PATH: &str = "/bin:/usr/bin";

/// Per-invocation execution context handed to the engine. `cwd` is written
/// back by `cd`.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Exported environment variables.
    pub env: HashMap<String, String>,
    /// Working directory.
    pub cwd: String,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
            cwd: "/".to_string(),
        }
    }
}

/// Executes pipelines against the engine's collaborators.
#[derive(Clone)]
pub struct PipelineEngine {
    registry: Arc<CommandRegistry>,
    vfs: Arc<dyn Vfs>,
    jobs: Arc<JobTable>,
    host: Arc<ModuleHost>,
}

impl PipelineEngine {
    pub fn new(
        registry: Arc<CommandRegistry>,
        vfs: Arc<dyn Vfs>,
        jobs: Arc<JobTable>,
        host: Arc<ModuleHost>,
    ) -> Self {
        Self {
            registry,
            vfs,
            jobs,
            host,
        }
    }

    /// The job table shared with embedders.
    pub fn jobs(&self) -> &Arc<JobTable> {
        &self.jobs
    }

    /// The filesystem handle.
    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    /// Execute a parsed pipeline. Always returns the uniform result shape;
    /// failures surface as non-zero exit codes with stderr text.
    pub async fn execute(
        &self,
        pipeline: &CommandPipeline,
        ctx: &mut PipelineContext,
    ) -> ExecutionResult {
        let command_text = render_pipeline(pipeline);
        let started = Instant::now();

        if pipeline.background {
            let (job_id, pid) = self.jobs.start_job(&command_text, false);
            let engine = self.clone();
            let stages = pipeline.stages.clone();
            let mut bg_ctx = ctx.clone();
            tokio::spawn(async move {
                let result = engine.run_stages(&stages, &mut bg_ctx).await;
                engine.jobs.complete_job(job_id, result.exit_code);
            });
            return ExecutionResult::success(format!("[{}] {}\n", job_id, pid)).finalized(
                pid,
                &command_text,
                started.elapsed(),
            );
        }

        let (job_id, pid) = self.jobs.start_job(&command_text, true);
        // Fast path: one stage, no redirection. Observably identical to the
        // general path.
        let result = if pipeline.stages.len() == 1 && pipeline.stages[0].redirects.is_empty() {
            self.run_stage(&pipeline.stages[0], String::new(), ctx).await
        } else {
            self.run_stages(&pipeline.stages, ctx).await
        };
        self.jobs.complete_job(job_id, result.exit_code);
        result.finalized(pid, &command_text, started.elapsed())
    }

    /// General path: thread each stage's stdout into the next stage's
    /// stdin, binding redirections to the VFS.
    async fn run_stages(
        &self,
        stages: &[PipelineStage],
        ctx: &mut PipelineContext,
    ) -> ExecutionResult {
        let mut piped = String::new();
        let mut stderr_all = String::new();
        let mut final_stdout = String::new();
        let mut exit_code = 0;

        for (i, stage) in stages.iter().enumerate() {
            let mut stage_stdin = if i == 0 {
                String::new()
            } else {
                std::mem::take(&mut piped)
            };

            for redirect in &stage.redirects {
                if redirect.kind == RedirectKind::Read {
                    let path = normalize_path(&resolve_path(&ctx.cwd, &redirect.target));
                    match self.vfs.read_file(&path).await {
                        Ok(bytes) => stage_stdin = String::from_utf8_lossy(&bytes).into_owned(),
                        Err(_) => {
                            return ExecutionResult::error(
                                format!("{}: No such file or directory", redirect.target),
                                1,
                            )
                        }
                    }
                }
            }

            let mut result = self.run_stage(stage, stage_stdin, ctx).await;

            for redirect in &stage.redirects {
                let path = normalize_path(&resolve_path(&ctx.cwd, &redirect.target));
                let write = match redirect.kind {
                    RedirectKind::Write => {
                        let data = std::mem::take(&mut result.stdout);
                        Some(self.vfs.write_file(&path, data.as_bytes()).await)
                    }
                    RedirectKind::Append => {
                        let data = std::mem::take(&mut result.stdout);
                        Some(self.vfs.append_file(&path, data.as_bytes()).await)
                    }
                    RedirectKind::Stderr => {
                        let data = std::mem::take(&mut result.stderr);
                        Some(self.vfs.write_file(&path, data.as_bytes()).await)
                    }
                    RedirectKind::Both => {
                        let mut data = std::mem::take(&mut result.stdout);
                        data.push_str(&std::mem::take(&mut result.stderr));
                        Some(self.vfs.write_file(&path, data.as_bytes()).await)
                    }
                    RedirectKind::Read => None,
                };
                if let Some(Err(e)) = write {
                    return ExecutionResult::error(format!("{}: {}", redirect.target, e), 1);
                }
            }

            stderr_all.push_str(&result.stderr);
            exit_code = result.exit_code;
            if i + 1 == stages.len() {
                final_stdout = result.stdout;
            } else {
                piped = result.stdout;
            }
        }

        ExecutionResult {
            stdout: final_stdout,
            stderr: stderr_all,
            exit_code,
            ..ExecutionResult::success("")
        }
    }

    async fn run_stage(
        &self,
        stage: &PipelineStage,
        stdin: String,
        ctx: &mut PipelineContext,
    ) -> ExecutionResult {
        match stage.name.as_str() {
            "cd" => return self.builtin_cd(&stage.args, ctx).await,
            "jobs" => return self.builtin_jobs(),
            "fg" | "bg" | "kill" | "disown" => {
                return self.builtin_job_control(&stage.name, &stage.args)
            }
            _ => {}
        }

        if let Some(command) = self.registry.get(&stage.name) {
            let invocation = CommandInvocation {
                args: stage.args.clone(),
                stdin,
                env: ctx.env.clone(),
                cwd: ctx.cwd.clone(),
                vfs: self.vfs.clone(),
            };
            return command.execute(invocation).await;
        }

        match self.resolve_binary(&stage.name, ctx).await {
            Some(binary) => self.run_module(&stage.name, &binary, stage, stdin, ctx).await,
            None => ExecutionResult::error(format!("{}: command not found", stage.name), 127),
        }
    }

    async fn builtin_cd(&self, args: &[String], ctx: &mut PipelineContext) -> ExecutionResult {
        let target = args.first().map(String::as_str).unwrap_or("/");
        let path = normalize_path(&resolve_path(&ctx.cwd, target));
        if self.vfs.is_directory(&path).await {
            ctx.cwd = path;
            ExecutionResult::success("")
        } else {
            ExecutionResult::error(format!("cd: {}: No such directory", target), 1)
        }
    }

    fn builtin_jobs(&self) -> ExecutionResult {
        let mut out = String::new();
        for job in self.jobs.list_jobs() {
            out.push_str(&format!("[{}] {} {}\n", job.id, job.status, job.command));
        }
        ExecutionResult::success(out)
    }

    fn builtin_job_control(&self, name: &str, args: &[String]) -> ExecutionResult {
        let Some(id) = args.first().and_then(|a| a.trim_start_matches('%').parse::<u32>().ok())
        else {
            return ExecutionResult::error(format!("usage: {} job-id", name), 1);
        };
        let ok = match name {
            "fg" => self.jobs.foreground_job(id),
            "bg" => self.jobs.background_job(id),
            "kill" => self.jobs.kill_job(id),
            _ => self.jobs.remove_job(id),
        };
        if ok {
            match self.jobs.get_job(id) {
                Some(job) if name == "fg" => ExecutionResult::success(format!("{}\n", job.command)),
                _ => ExecutionResult::success(""),
            }
        } else {
            ExecutionResult::error(format!("{}: no such job: {}", name, id), 1)
        }
    }

    /// PATH-style lookup of a guest binary. Names with a slash resolve
    /// directly; bare names try `{dir}/{name}` and `{dir}/{name}.wasm` for
    /// each PATH entry.
    async fn resolve_binary(&self, name: &str, ctx: &PipelineContext) -> Option<Vec<u8>> {
        if name.contains('/') {
            let path = normalize_path(&resolve_path(&ctx.cwd, name));
            return self.vfs.read_file(&path).await.ok();
        }
        let path_var = ctx
            .env
            .get("PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_PATH.to_string());
        for dir in path_var.split(':').filter(|d| !d.is_empty()) {
            for candidate in [format!("{}/{}", dir, name), format!("{}/{}.wasm", dir, name)] {
                if let Ok(bytes) = self.vfs.read_file(&candidate).await {
                    return Some(bytes);
                }
            }
        }
        None
    }

    async fn run_module(
        &self,
        name: &str,
        binary: &[u8],
        stage: &PipelineStage,
        stdin: String,
        ctx: &PipelineContext,
    ) -> ExecutionResult {
        let invocation = ModuleInvocation {
            args: stage.args.clone(),
            env: ctx.env.clone(),
            stdin,
        };
        match self.host.execute(name, binary, "main", invocation).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(module = name, error = %err, "module execution failed");
                let code = match &err {
                    ModuleError::Load { .. } | ModuleError::Memory { .. } => 126,
                    ModuleError::Timeout { .. } => 124,
                    ModuleError::Execution { .. } => 1,
                };
                ExecutionResult::error(err.to_string(), code)
            }
        }
    }
}

/// Reconstruct the command text for job records.
fn render_pipeline(pipeline: &CommandPipeline) -> String {
    let mut text = pipeline
        .stages
        .iter()
        .map(|stage| {
            let mut words = vec![stage.name.clone()];
            words.extend(stage.args.iter().cloned());
            for redirect in &stage.redirects {
                words.push(format!("{} {}", redirect.kind.symbol(), redirect.target));
            }
            words.join(" ")
        })
        .collect::<Vec<_>>()
        .join(" | ");
    if pipeline.background {
        text.push_str(" &");
    }
    text
}
