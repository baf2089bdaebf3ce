//! Built-in commands and the command registry.
//!
//! Each builtin implements [`ShellCommand`] and receives a fully prepared
//! [`CommandInvocation`]: expanded arguments, the stdin text piped into it,
//! the exported environment, the working directory, and a VFS handle.
//! Builtins never panic on bad input; they report through the result's
//! stderr and exit code.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;

use crate::result::ExecutionResult;
use crate::vfs::{resolve_path, Vfs};

/// Everything a command needs to run one invocation.
#[derive(Clone)]
pub struct CommandInvocation {
    /// Arguments after the command name, already expanded.
    pub args: Vec<String>,
    /// Text piped into the command.
    pub stdin: String,
    /// Exported environment variables.
    pub env: HashMap<String, String>,
    /// Working directory at invocation time.
    pub cwd: String,
    /// Filesystem handle.
    pub vfs: Arc<dyn Vfs>,
}

/// A command callable from the shell.
#[async_trait]
pub trait ShellCommand: Send + Sync {
    /// Name the command is dispatched under.
    fn name(&self) -> &'static str;

    /// Run one invocation.
    async fn execute(&self, inv: CommandInvocation) -> ExecutionResult;
}

/// Name → command lookup table.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn ShellCommand>>,
}

impl CommandRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the standard builtins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoCommand));
        registry.register(Arc::new(CatCommand));
        registry.register(Arc::new(TrueCommand));
        registry.register(Arc::new(FalseCommand));
        registry.register(Arc::new(PwdCommand));
        registry.register(Arc::new(SleepCommand));
        registry.register(Arc::new(EnvCommand));
        registry.register(Arc::new(GrepCommand));
        registry.register(Arc::new(WcCommand));
        registry
    }

    /// Add (or replace) a command.
    pub fn register(&mut self, command: Arc<dyn ShellCommand>) {
        self.commands.insert(command.name().to_string(), command);
    }

    /// Look up a command by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ShellCommand>> {
        self.commands.get(name).cloned()
    }

    /// Whether a command is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.commands.keys().cloned().sorted().collect()
    }
}

/// `echo [-n] args...`
struct EchoCommand;

#[async_trait]
impl ShellCommand for EchoCommand {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn execute(&self, inv: CommandInvocation) -> ExecutionResult {
        let mut args = inv.args.as_slice();
        let mut newline = true;
        if args.first().map(String::as_str) == Some("-n") {
            newline = false;
            args = &args[1..];
        }
        let mut out = args.join(" ");
        if newline {
            out.push('\n');
        }
        ExecutionResult::success(out)
    }
}

/// `cat [file...]` — concatenates files, or echoes stdin with no args.
struct CatCommand;

#[async_trait]
impl ShellCommand for CatCommand {
    fn name(&self) -> &'static str {
        "cat"
    }

    async fn execute(&self, inv: CommandInvocation) -> ExecutionResult {
        if inv.args.is_empty() {
            return ExecutionResult::success(inv.stdin);
        }
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = 0;
        for arg in &inv.args {
            let path = resolve_path(&inv.cwd, arg);
            match inv.vfs.read_file(&path).await {
                Ok(bytes) => stdout.push_str(&String::from_utf8_lossy(&bytes)),
                Err(_) => {
                    stderr.push_str(&format!("cat: {}: No such file or directory\n", arg));
                    exit_code = 1;
                }
            }
        }
        ExecutionResult {
            stdout,
            stderr,
            exit_code,
            ..ExecutionResult::success("")
        }
    }
}

struct TrueCommand;

#[async_trait]
impl ShellCommand for TrueCommand {
    fn name(&self) -> &'static str {
        "true"
    }

    async fn execute(&self, _inv: CommandInvocation) -> ExecutionResult {
        ExecutionResult::success("")
    }
}

struct FalseCommand;

#[async_trait]
impl ShellCommand for FalseCommand {
    fn name(&self) -> &'static str {
        "false"
    }

    async fn execute(&self, _inv: CommandInvocation) -> ExecutionResult {
        ExecutionResult::error("", 1)
    }
}

struct PwdCommand;

#[async_trait]
impl ShellCommand for PwdCommand {
    fn name(&self) -> &'static str {
        "pwd"
    }

    async fn execute(&self, inv: CommandInvocation) -> ExecutionResult {
        ExecutionResult::success(format!("{}\n", inv.cwd))
    }
}

/// `sleep seconds` — fractional seconds accepted.
struct SleepCommand;

#[async_trait]
impl ShellCommand for SleepCommand {
    fn name(&self) -> &'static str {
        "sleep"
    }

    async fn execute(&self, inv: CommandInvocation) -> ExecutionResult {
        let Some(arg) = inv.args.first() else {
            return ExecutionResult::error("sleep: missing operand", 1);
        };
        match arg.parse::<f64>() {
            Ok(secs) if secs >= 0.0 => {
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                ExecutionResult::success("")
            }
            _ => ExecutionResult::error(format!("sleep: invalid time interval: {}", arg), 1),
        }
    }
}

/// `env` — exported variables, sorted by name.
struct EnvCommand;

#[async_trait]
impl ShellCommand for EnvCommand {
    fn name(&self) -> &'static str {
        "env"
    }

    async fn execute(&self, inv: CommandInvocation) -> ExecutionResult {
        let out = inv
            .env
            .iter()
            .sorted()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect::<String>();
        ExecutionResult::success(out)
    }
}

/// `grep pattern [file...]` — regex match over stdin or files. Exits 1
/// when nothing matches, 2 on usage or pattern errors.
struct GrepCommand;

#[async_trait]
impl ShellCommand for GrepCommand {
    fn name(&self) -> &'static str {
        "grep"
    }

    async fn execute(&self, inv: CommandInvocation) -> ExecutionResult {
        let Some(pattern) = inv.args.first() else {
            return ExecutionResult::error("usage: grep pattern [file...]", 2);
        };
        let re = match regex::Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => return ExecutionResult::error(format!("grep: bad pattern: {}", e), 2),
        };

        let mut inputs: Vec<(Option<&str>, String)> = Vec::new();
        let files = &inv.args[1..];
        if files.is_empty() {
            inputs.push((None, inv.stdin.clone()));
        } else {
            for file in files {
                let path = resolve_path(&inv.cwd, file);
                match inv.vfs.read_file(&path).await {
                    Ok(bytes) => {
                        inputs.push((Some(file.as_str()), String::from_utf8_lossy(&bytes).into_owned()))
                    }
                    Err(_) => {
                        return ExecutionResult::error(
                            format!("grep: {}: No such file or directory", file),
                            2,
                        )
                    }
                }
            }
        }

        let label_matches = files.len() > 1;
        let mut stdout = String::new();
        let mut matched = false;
        for (label, text) in &inputs {
            for line in text.lines() {
                if re.is_match(line) {
                    matched = true;
                    match (label_matches, label) {
                        (true, Some(name)) => stdout.push_str(&format!("{}:{}\n", name, line)),
                        _ => stdout.push_str(&format!("{}\n", line)),
                    }
                }
            }
        }
        if matched {
            ExecutionResult::success(stdout)
        } else {
            ExecutionResult::error("", 1)
        }
    }
}

/// `wc [file...]` — line, word, and byte counts.
struct WcCommand;

#[async_trait]
impl ShellCommand for WcCommand {
    fn name(&self) -> &'static str {
        "wc"
    }

    async fn execute(&self, inv: CommandInvocation) -> ExecutionResult {
        fn counts(text: &str) -> (usize, usize, usize) {
            (text.lines().count(), text.split_whitespace().count(), text.len())
        }

        if inv.args.is_empty() {
            let (l, w, b) = counts(&inv.stdin);
            return ExecutionResult::success(format!("{:7} {:7} {:7}\n", l, w, b));
        }

        let mut stdout = String::new();
        let mut totals = (0, 0, 0);
        for arg in &inv.args {
            let path = resolve_path(&inv.cwd, arg);
            match inv.vfs.read_file(&path).await {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let (l, w, b) = counts(&text);
                    totals = (totals.0 + l, totals.1 + w, totals.2 + b);
                    stdout.push_str(&format!("{:7} {:7} {:7} {}\n", l, w, b, arg));
                }
                Err(_) => {
                    return ExecutionResult::error(
                        format!("wc: {}: No such file or directory", arg),
                        1,
                    )
                }
            }
        }
        if inv.args.len() > 1 {
            stdout.push_str(&format!(
                "{:7} {:7} {:7} total\n",
                totals.0, totals.1, totals.2
            ));
        }
        ExecutionResult::success(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryVfs;

    fn inv(args: &[&str], stdin: &str) -> CommandInvocation {
        CommandInvocation {
            args: args.iter().map(|s| s.to_string()).collect(),
            stdin: stdin.to_string(),
            env: HashMap::new(),
            cwd: "/".to_string(),
            vfs: Arc::new(MemoryVfs::new()),
        }
    }

    #[tokio::test]
    async fn test_echo_joins_args() {
        let r = EchoCommand.execute(inv(&["hello", "world"], "")).await;
        assert_eq!(r.stdout, "hello world\n");
        assert!(r.is_success());
    }

    #[tokio::test]
    async fn test_echo_n_suppresses_newline() {
        let r = EchoCommand.execute(inv(&["-n", "hi"], "")).await;
        assert_eq!(r.stdout, "hi");
    }

    #[tokio::test]
    async fn test_cat_passes_stdin_through() {
        let r = CatCommand.execute(inv(&[], "piped text")).await;
        assert_eq!(r.stdout, "piped text");
    }

    #[tokio::test]
    async fn test_cat_reads_files() {
        let vfs = Arc::new(MemoryVfs::new());
        vfs.add_file("/notes.txt", b"line one\n");
        let mut invocation = inv(&["notes.txt"], "");
        invocation.vfs = vfs;
        let r = CatCommand.execute(invocation).await;
        assert_eq!(r.stdout, "line one\n");
    }

    #[tokio::test]
    async fn test_cat_missing_file() {
        let r = CatCommand.execute(inv(&["nope.txt"], "")).await;
        assert_eq!(r.exit_code, 1);
        assert!(r.stderr.contains("nope.txt"));
    }

    #[tokio::test]
    async fn test_true_and_false() {
        assert_eq!(TrueCommand.execute(inv(&[], "")).await.exit_code, 0);
        assert_eq!(FalseCommand.execute(inv(&[], "")).await.exit_code, 1);
    }

    #[tokio::test]
    async fn test_pwd_reports_cwd() {
        let mut invocation = inv(&[], "");
        invocation.cwd = "/home/user".to_string();
        let r = PwdCommand.execute(invocation).await;
        assert_eq!(r.stdout, "/home/user\n");
    }

    #[tokio::test]
    async fn test_sleep_rejects_bad_interval() {
        let r = SleepCommand.execute(inv(&["soon"], "")).await;
        assert_eq!(r.exit_code, 1);
        assert!(r.stderr.contains("invalid time interval"));
    }

    #[tokio::test]
    async fn test_env_sorts_variables() {
        let mut invocation = inv(&[], "");
        invocation.env.insert("ZED".into(), "1".into());
        invocation.env.insert("ALPHA".into(), "2".into());
        let r = EnvCommand.execute(invocation).await;
        assert_eq!(r.stdout, "ALPHA=2\nZED=1\n");
    }

    #[tokio::test]
    async fn test_grep_filters_stdin() {
        let r = GrepCommand
            .execute(inv(&["todo"], "one todo\ntwo done\nanother todo\n"))
            .await;
        assert_eq!(r.stdout, "one todo\nanother todo\n");
        assert!(r.is_success());
    }

    #[tokio::test]
    async fn test_grep_no_match_exits_one() {
        let r = GrepCommand.execute(inv(&["missing"], "nothing here\n")).await;
        assert_eq!(r.exit_code, 1);
        assert_eq!(r.stdout, "");
    }

    #[tokio::test]
    async fn test_wc_counts_stdin() {
        let r = WcCommand.execute(inv(&[], "a b\nc\n")).await;
        assert!(r.stdout.contains('2'));
        assert!(r.stdout.contains('3'));
    }

    #[test]
    fn test_registry_with_builtins() {
        let registry = CommandRegistry::with_builtins();
        assert!(registry.contains("echo"));
        assert!(registry.contains("grep"));
        assert!(!registry.contains("frobnicate"));
        let names = registry.names();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
