//! Script execution.
//!
//! The executor takes the parser's flat statement list, groups it into
//! blocks (if/elif/else, loops, function bodies), and walks the blocks,
//! delegating command statements to the pipeline engine. Context flows
//! through execution as a value: each statement receives the context and
//! yields an updated one, so state transitions stay explicit.
//!
//! Two halting mechanisms exist: `exit` (and any command finishing with a
//! non-zero exit code) clears the continue flag and stops the whole script,
//! while `return` unwinds only the innermost function frame. `return`
//! outside any function behaves like `exit`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::config::ScriptConfig;
use crate::error::ShellError;
use crate::pipeline::{parse_pipeline, PipelineContext, PipelineEngine};
use crate::result::ExecutionResult;

use super::condition;
use super::expand::expand;
use super::parser::{
    parse_script, ConditionalKind, LoopHeader, ScriptStatement, StatementKind,
};

/// Hard cap on `while`/`until` condition re-checks per loop.
pub(crate) const MAX_LOOP_ITERATIONS: usize = 10_000;

/// Hard cap on nested function calls. Each nesting level keeps its
/// in-flight block futures on the poll stack, so the cap must stay well
/// under what a default thread stack can hold.
const MAX_CALL_DEPTH: usize = 16;

/// Per-run execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Wall-clock budget for the whole script.
    pub timeout: Option<Duration>,
    /// Emit per-statement debug traces.
    pub debug: bool,
}

impl From<&ScriptConfig> for ExecOptions {
    fn from(config: &ScriptConfig) -> Self {
        Self {
            timeout: Some(config.timeout),
            debug: config.debug,
        }
    }
}

/// One function invocation on the call stack.
#[derive(Debug, Clone)]
struct CallFrame {
    function: String,
    saved_locals: HashMap<String, String>,
    call_line: u32,
}

/// Interpreter state threaded through execution.
///
/// The `with_*` methods are pure transformations: they consume the context
/// and return the updated one, which keeps every state change visible at
/// the call site.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    local_vars: HashMap<String, String>,
    env_vars: HashMap<String, String>,
    functions: HashMap<String, Vec<ScriptStatement>>,
    cwd: String,
    last_exit_status: i32,
    should_continue: bool,
    call_stack: Vec<CallFrame>,
    returning: bool,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Fresh context: empty variables, cwd `/`, exit status 0.
    pub fn new() -> Self {
        Self {
            local_vars: HashMap::new(),
            env_vars: HashMap::new(),
            functions: HashMap::new(),
            cwd: "/".to_string(),
            last_exit_status: 0,
            should_continue: true,
            call_stack: Vec::new(),
            returning: false,
        }
    }

    /// Look up a variable. Locals shadow environment variables; `$?` maps
    /// to the last exit status. Unset names return `None`.
    pub fn var(&self, name: &str) -> Option<String> {
        if name == "?" {
            return Some(self.last_exit_status.to_string());
        }
        self.local_vars
            .get(name)
            .or_else(|| self.env_vars.get(name))
            .cloned()
    }

    /// Set a shell-local variable.
    pub fn with_local(mut self, name: &str, value: &str) -> Self {
        self.local_vars.insert(name.to_string(), value.to_string());
        self
    }

    /// Set an exported environment variable.
    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.env_vars.insert(name.to_string(), value.to_string());
        self
    }

    /// Record the exit status of the last command.
    pub fn with_exit_status(mut self, code: i32) -> Self {
        self.last_exit_status = code;
        self
    }

    /// Change the working directory.
    pub fn with_cwd(mut self, cwd: &str) -> Self {
        self.cwd = cwd.to_string();
        self
    }

    /// Define (or redefine) a function.
    pub fn with_function(mut self, name: &str, body: Vec<ScriptStatement>) -> Self {
        self.functions.insert(name.to_string(), body);
        self
    }

    /// Stop execution of all remaining statements.
    pub fn halted(mut self) -> Self {
        self.should_continue = false;
        self
    }

    /// Re-arm a context for a fresh script run. Halting is scoped to one
    /// script; variables, functions, and the exit status carry over.
    fn resumed(mut self) -> Self {
        self.should_continue = true;
        self.returning = false;
        self
    }

    /// Current working directory.
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Exit status of the most recent command.
    pub fn exit_status(&self) -> i32 {
        self.last_exit_status
    }

    /// Whether execution may proceed.
    pub fn should_continue(&self) -> bool {
        self.should_continue
    }

    /// Exported environment variables.
    pub fn env_vars(&self) -> &HashMap<String, String> {
        &self.env_vars
    }
}

/// A statement list grouped into executable blocks.
#[derive(Debug, Clone)]
enum Block {
    Single(ScriptStatement),
    If {
        branches: Vec<IfBranch>,
    },
    Loop {
        header: LoopHeader,
        body: Vec<Block>,
        line: u32,
        raw: String,
    },
    FunctionDef {
        name: String,
        body: Vec<ScriptStatement>,
    },
}

#[derive(Debug, Clone)]
struct IfBranch {
    /// `None` marks the `else` branch.
    condition: Option<String>,
    body: Vec<Block>,
}

/// Drives script execution against a pipeline engine.
pub struct ScriptExecutor {
    engine: Arc<PipelineEngine>,
}

impl ScriptExecutor {
    pub fn new(engine: Arc<PipelineEngine>) -> Self {
        Self { engine }
    }

    /// Parse and execute a script. Syntax errors come back as an exit-2
    /// result without running anything.
    pub async fn run(
        &self,
        script: &str,
        ctx: ExecutionContext,
        opts: &ExecOptions,
    ) -> (ExecutionResult, ExecutionContext) {
        match parse_script(script) {
            Ok(statements) => self.execute_script(&statements, ctx, opts).await,
            Err(err) => (ExecutionResult::error(err.to_string(), 2), ctx),
        }
    }

    /// Execute already-parsed statements. Always yields an
    /// [`ExecutionResult`]; internal errors are formatted onto stderr with
    /// a non-zero exit code rather than escaping as `Err`.
    pub async fn execute_script(
        &self,
        statements: &[ScriptStatement],
        ctx: ExecutionContext,
        opts: &ExecOptions,
    ) -> (ExecutionResult, ExecutionContext) {
        let started = Instant::now();
        let ctx = ctx.resumed();
        let fallback = ctx.clone();

        let blocks = match group_blocks(statements) {
            Ok(blocks) => blocks,
            Err(err) => {
                return (
                    finish_result(String::new(), format!("{}\n", err), 2, started),
                    fallback,
                )
            }
        };

        let mut run = ScriptRun {
            engine: &self.engine,
            opts,
            stdout: String::new(),
            stderr: String::new(),
        };

        let outcome = match opts.timeout {
            Some(budget) => match timeout(budget, run.run_blocks(&blocks, ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(?budget, "script execution timed out");
                    run.stderr.push_str("script execution timed out\n");
                    return (
                        finish_result(run.stdout, run.stderr, 1, started),
                        fallback,
                    );
                }
            },
            None => run.run_blocks(&blocks, ctx).await,
        };

        match outcome {
            Ok(ctx) => {
                let code = ctx.last_exit_status;
                (finish_result(run.stdout, run.stderr, code, started), ctx)
            }
            Err(err) => {
                run.stderr.push_str(&format!("{}\n", err));
                (finish_result(run.stdout, run.stderr, 1, started), fallback)
            }
        }
    }
}

fn finish_result(stdout: String, stderr: String, exit_code: i32, started: Instant) -> ExecutionResult {
    ExecutionResult {
        process_id: 0,
        command: String::new(),
        stdout,
        stderr,
        exit_code,
        execution_time: started.elapsed(),
    }
}

/// Mutable state for one script run: the output buffers accumulate across
/// statements while the context flows by value.
struct ScriptRun<'a> {
    engine: &'a Arc<PipelineEngine>,
    opts: &'a ExecOptions,
    stdout: String,
    stderr: String,
}

impl ScriptRun<'_> {
    /// Run a block list. Boxed for recursion through nested blocks.
    fn run_blocks<'b>(
        &'b mut self,
        blocks: &'b [Block],
        ctx: ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionContext, ShellError>> + Send + 'b>> {
        Box::pin(async move {
            let mut ctx = ctx;
            for block in blocks {
                if !ctx.should_continue || ctx.returning {
                    break;
                }
                ctx = self.run_block(block, ctx).await?;
            }
            Ok(ctx)
        })
    }

    async fn run_block(
        &mut self,
        block: &Block,
        mut ctx: ExecutionContext,
    ) -> Result<ExecutionContext, ShellError> {
        match block {
            Block::Single(stmt) => self.run_statement(stmt, ctx).await,
            Block::If { branches } => {
                for branch in branches {
                    let taken = match &branch.condition {
                        Some(cond) => condition::evaluate(cond, &ctx),
                        None => true,
                    };
                    if taken {
                        return self.run_blocks(&branch.body, ctx).await;
                    }
                }
                Ok(ctx)
            }
            Block::Loop {
                header,
                body,
                line,
                raw,
            } => self.run_loop(header, body, *line, raw, ctx).await,
            Block::FunctionDef { name, body } => {
                ctx = ctx.with_function(name, body.clone());
                Ok(ctx)
            }
        }
    }

    async fn run_loop(
        &mut self,
        header: &LoopHeader,
        body: &[Block],
        line: u32,
        raw: &str,
        mut ctx: ExecutionContext,
    ) -> Result<ExecutionContext, ShellError> {
        match header {
            LoopHeader::For { var, items, .. } => {
                // Items expand (and word-split) at iteration time.
                let mut values = Vec::new();
                for item in items {
                    let expanded = expand(item, &ctx);
                    values.extend(expanded.split_whitespace().map(str::to_string));
                }
                for value in values {
                    ctx = ctx.with_local(var, &value);
                    ctx = self.run_blocks(body, ctx).await?;
                    if !ctx.should_continue || ctx.returning {
                        break;
                    }
                }
                Ok(ctx)
            }
            LoopHeader::While { condition, .. } | LoopHeader::Until { condition, .. } => {
                let invert = matches!(header, LoopHeader::Until { .. });
                // `i` numbers the attempted condition re-checks; the
                // 10,000th attempt errors instead of evaluating.
                for i in 1.. {
                    if i == MAX_LOOP_ITERATIONS {
                        return Err(ShellError::Script {
                            line,
                            statement: raw.to_string(),
                            message: "exceeded maximum loop iterations".to_string(),
                        });
                    }
                    let mut proceed = condition::evaluate(condition, &ctx);
                    if invert {
                        proceed = !proceed;
                    }
                    if !proceed {
                        break;
                    }
                    ctx = self.run_blocks(body, ctx).await?;
                    if !ctx.should_continue || ctx.returning {
                        break;
                    }
                }
                Ok(ctx)
            }
            // `do`/`done` lines are consumed during grouping.
            LoopHeader::Do | LoopHeader::Done => Ok(ctx),
        }
    }

    async fn run_statement(
        &mut self,
        stmt: &ScriptStatement,
        mut ctx: ExecutionContext,
    ) -> Result<ExecutionContext, ShellError> {
        if self.opts.debug {
            tracing::debug!(line = stmt.line, raw = %stmt.raw, "executing statement");
        }

        match &stmt.kind {
            StatementKind::Empty | StatementKind::Comment => Ok(ctx),

            StatementKind::Assignment {
                name,
                value,
                exported,
            } => {
                let value = expand(value, &ctx);
                ctx = if *exported {
                    ctx.with_env(name, &value)
                } else {
                    ctx.with_local(name, &value)
                };
                Ok(ctx)
            }

            StatementKind::Exit { code } => {
                ctx.last_exit_status = code.unwrap_or(0);
                Ok(ctx.halted())
            }

            StatementKind::Return { code } => {
                if ctx.call_stack.is_empty() {
                    // No frame to unwind; behaves like exit.
                    ctx.last_exit_status = code.unwrap_or(ctx.last_exit_status);
                    return Ok(ctx.halted());
                }
                ctx.last_exit_status = code.unwrap_or(ctx.last_exit_status);
                ctx.returning = true;
                Ok(ctx)
            }

            StatementKind::Command { name, args, .. } => {
                let callee = expand(name, &ctx);
                if ctx.functions.contains_key(&callee) {
                    let args: Vec<String> = args.iter().map(|a| expand(a, &ctx)).collect();
                    return self.call_function(&callee, args, stmt, ctx).await;
                }
                self.run_command_line(stmt, ctx).await
            }

            // These never survive grouping; reaching one means the script
            // used the keyword outside its block.
            StatementKind::Conditional { .. }
            | StatementKind::Loop(_)
            | StatementKind::Function { .. } => Err(ShellError::Script {
                line: stmt.line,
                statement: stmt.raw.clone(),
                message: "unexpected keyword outside its block".to_string(),
            }),
        }
    }

    /// Execute a command statement through the pipeline engine. The whole
    /// raw line is expanded first and re-parsed as a pipeline, so variables
    /// holding spaces word-split and `$VAR` pipes compose naturally.
    async fn run_command_line(
        &mut self,
        stmt: &ScriptStatement,
        mut ctx: ExecutionContext,
    ) -> Result<ExecutionContext, ShellError> {
        let expanded = expand(stmt.raw.trim(), &ctx);
        let pipeline = parse_pipeline(&expanded).map_err(|message| ShellError::Script {
            line: stmt.line,
            statement: stmt.raw.clone(),
            message,
        })?;

        let mut pctx = PipelineContext {
            env: ctx.env_vars.clone(),
            cwd: ctx.cwd.clone(),
        };
        let result = self.engine.execute(&pipeline, &mut pctx).await;

        self.stdout.push_str(&result.stdout);
        self.stderr.push_str(&result.stderr);
        ctx.cwd = pctx.cwd;
        ctx.last_exit_status = result.exit_code;
        if result.exit_code != 0 {
            // Any failing command stops the script.
            ctx = ctx.halted();
        }
        Ok(ctx)
    }

    async fn call_function(
        &mut self,
        name: &str,
        args: Vec<String>,
        stmt: &ScriptStatement,
        ctx: ExecutionContext,
    ) -> Result<ExecutionContext, ShellError> {
        if ctx.call_stack.len() >= MAX_CALL_DEPTH {
            return Err(ShellError::Script {
                line: stmt.line,
                statement: stmt.raw.clone(),
                message: format!("maximum function call depth exceeded in `{}`", name),
            });
        }
        let Some(body) = ctx.functions.get(name).cloned() else {
            return Err(ShellError::Script {
                line: stmt.line,
                statement: stmt.raw.clone(),
                message: format!("undefined function: {}", name),
            });
        };
        let blocks = group_blocks(&body).map_err(|e| e.in_statement(stmt.line, &stmt.raw))?;

        let mut fctx = ctx;
        fctx.call_stack.push(CallFrame {
            function: name.to_string(),
            saved_locals: fctx.local_vars.clone(),
            call_line: stmt.line,
        });
        fctx.local_vars.insert("0".to_string(), name.to_string());
        for (i, arg) in args.iter().enumerate() {
            fctx.local_vars.insert((i + 1).to_string(), arg.clone());
        }
        fctx.local_vars
            .insert("#".to_string(), args.len().to_string());
        fctx.local_vars.insert("@".to_string(), args.join(" "));

        let mut fctx = self.run_blocks(&blocks, fctx).await?;

        if let Some(frame) = fctx.call_stack.pop() {
            tracing::debug!(function = %frame.function, call_line = frame.call_line, "function returned");
            fctx.local_vars = frame.saved_locals;
        }
        fctx.returning = false;
        // A non-zero function result halts the script like any failing command.
        if fctx.last_exit_status != 0 {
            fctx = fctx.halted();
        }
        Ok(fctx)
    }
}

/// Group a flat statement list into nested blocks.
fn group_blocks(statements: &[ScriptStatement]) -> Result<Vec<Block>, ShellError> {
    let mut pos = 0;
    let blocks = collect_blocks(statements, &mut pos, Stop::TopLevel)?;
    if pos < statements.len() {
        return Err(unexpected(&statements[pos]));
    }
    Ok(blocks)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    TopLevel,
    IfBranch,
    LoopBody,
}

/// Collect blocks until this nesting level's terminator (left unconsumed
/// for the caller to inspect) or end of input.
fn collect_blocks(
    statements: &[ScriptStatement],
    pos: &mut usize,
    stop: Stop,
) -> Result<Vec<Block>, ShellError> {
    let mut blocks = Vec::new();
    while *pos < statements.len() {
        let stmt = &statements[*pos];
        match &stmt.kind {
            StatementKind::Empty | StatementKind::Comment => {
                *pos += 1;
            }
            StatementKind::Conditional {
                kind: ConditionalKind::If,
                condition,
            } => {
                *pos += 1;
                blocks.push(parse_if(statements, pos, stmt, condition.clone())?);
            }
            StatementKind::Conditional {
                kind: ConditionalKind::Then,
                ..
            } => {
                if stop != Stop::IfBranch {
                    return Err(unexpected(stmt));
                }
                *pos += 1;
            }
            StatementKind::Conditional { .. } => {
                // elif / else / fi terminate an if-branch.
                if stop == Stop::IfBranch {
                    return Ok(blocks);
                }
                return Err(unexpected(stmt));
            }
            StatementKind::Loop(header) => match header {
                LoopHeader::For { .. } | LoopHeader::While { .. } | LoopHeader::Until { .. } => {
                    *pos += 1;
                    blocks.push(parse_loop(statements, pos, stmt, header.clone())?);
                }
                LoopHeader::Done => {
                    if stop == Stop::LoopBody {
                        return Ok(blocks);
                    }
                    return Err(unexpected(stmt));
                }
                LoopHeader::Do => return Err(unexpected(stmt)),
            },
            StatementKind::Function { name, inline_body } => {
                *pos += 1;
                blocks.push(parse_function(statements, pos, stmt, name, inline_body.as_deref())?);
            }
            StatementKind::Command { name, args, .. } if name == "}" && args.is_empty() => {
                return Err(unexpected(stmt));
            }
            _ => {
                blocks.push(Block::Single(stmt.clone()));
                *pos += 1;
            }
        }
    }
    Ok(blocks)
}

fn parse_if(
    statements: &[ScriptStatement],
    pos: &mut usize,
    if_stmt: &ScriptStatement,
    condition: Option<String>,
) -> Result<Block, ShellError> {
    let mut branches = Vec::new();
    let mut pending: Option<Option<String>> = Some(Some(condition.unwrap_or_default()));

    while let Some(cond) = pending.take() {
        let body = collect_blocks(statements, pos, Stop::IfBranch)?;
        branches.push(IfBranch {
            condition: cond,
            body,
        });
        match statements.get(*pos).map(|s| &s.kind) {
            Some(StatementKind::Conditional {
                kind: ConditionalKind::Elif,
                condition,
            }) => {
                *pos += 1;
                pending = Some(Some(condition.clone().unwrap_or_default()));
            }
            Some(StatementKind::Conditional {
                kind: ConditionalKind::Else,
                ..
            }) => {
                *pos += 1;
                pending = Some(None);
            }
            Some(StatementKind::Conditional {
                kind: ConditionalKind::Fi,
                ..
            }) => {
                *pos += 1;
                return Ok(Block::If { branches });
            }
            _ => {
                return Err(ShellError::Syntax {
                    line: if_stmt.line,
                    message: "missing `fi`".to_string(),
                })
            }
        }
    }
    Ok(Block::If { branches })
}

fn parse_loop(
    statements: &[ScriptStatement],
    pos: &mut usize,
    header_stmt: &ScriptStatement,
    header: LoopHeader,
) -> Result<Block, ShellError> {
    let has_do = match &header {
        LoopHeader::For { has_do, .. }
        | LoopHeader::While { has_do, .. }
        | LoopHeader::Until { has_do, .. } => *has_do,
        _ => true,
    };

    if !has_do {
        while matches!(
            statements.get(*pos).map(|s| &s.kind),
            Some(StatementKind::Empty | StatementKind::Comment)
        ) {
            *pos += 1;
        }
        match statements.get(*pos).map(|s| &s.kind) {
            Some(StatementKind::Loop(LoopHeader::Do)) => *pos += 1,
            _ => {
                return Err(ShellError::Syntax {
                    line: header_stmt.line,
                    message: "missing `do`".to_string(),
                })
            }
        }
    }

    let body = collect_blocks(statements, pos, Stop::LoopBody)?;
    match statements.get(*pos).map(|s| &s.kind) {
        Some(StatementKind::Loop(LoopHeader::Done)) => *pos += 1,
        _ => {
            return Err(ShellError::Syntax {
                line: header_stmt.line,
                message: "missing `done`".to_string(),
            })
        }
    }

    Ok(Block::Loop {
        header,
        body,
        line: header_stmt.line,
        raw: header_stmt.raw.clone(),
    })
}

fn parse_function(
    statements: &[ScriptStatement],
    pos: &mut usize,
    def_stmt: &ScriptStatement,
    name: &str,
    inline_body: Option<&str>,
) -> Result<Block, ShellError> {
    let body = match inline_body {
        Some(text) => {
            let src = text
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            let mut body = parse_script(&src)
                .map_err(|e| e.in_statement(def_stmt.line, &def_stmt.raw))?;
            for stmt in &mut body {
                stmt.line = def_stmt.line;
            }
            body
        }
        None => {
            let mut body = Vec::new();
            let mut depth = 1u32;
            while *pos < statements.len() {
                let stmt = &statements[*pos];
                *pos += 1;
                match &stmt.kind {
                    StatementKind::Function {
                        inline_body: None, ..
                    } => {
                        depth += 1;
                        body.push(stmt.clone());
                    }
                    StatementKind::Command {
                        name: cmd, args, ..
                    } if cmd == "}" && args.is_empty() => {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(Block::FunctionDef {
                                name: name.to_string(),
                                body,
                            });
                        }
                        body.push(stmt.clone());
                    }
                    _ => body.push(stmt.clone()),
                }
            }
            return Err(ShellError::Syntax {
                line: def_stmt.line,
                message: format!("missing `}}` closing body of `{}`", name),
            });
        }
    };
    Ok(Block::FunctionDef {
        name: name.to_string(),
        body,
    })
}

fn unexpected(stmt: &ScriptStatement) -> ShellError {
    let word = stmt.raw.trim().split_whitespace().next().unwrap_or("");
    ShellError::Syntax {
        line: stmt.line,
        message: format!("unexpected `{}`", word),
    }
}
