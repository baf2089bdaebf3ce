//! Command line → pipeline parsing.
//!
//! Splits a command line on `|` (quote-aware), extracts redirection
//! operators per stage with the pattern `(>>|>|<|2>|&>)\s*target`, and
//! tokenizes the remaining text with shlex. A trailing `&` marks the whole
//! pipeline as a background job.

use std::sync::OnceLock;

use regex::Regex;

/// Kind of an I/O redirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// `>` — stdout to file (truncate).
    Write,
    /// `>>` — stdout to file (append).
    Append,
    /// `<` — stdin from file.
    Read,
    /// `2>` — stderr to file.
    Stderr,
    /// `&>` — stdout and stderr to file.
    Both,
}

impl RedirectKind {
    /// The operator token as written on the command line.
    pub fn symbol(self) -> &'static str {
        match self {
            RedirectKind::Write => ">",
            RedirectKind::Append => ">>",
            RedirectKind::Read => "<",
            RedirectKind::Stderr => "2>",
            RedirectKind::Both => "&>",
        }
    }
}

/// A single redirection bound to a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// What is being redirected.
    pub kind: RedirectKind,
    /// Target path, resolved against the cwd at execution time.
    pub target: String,
}

/// One stage of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStage {
    /// Command name.
    pub name: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Redirections attached to this stage.
    pub redirects: Vec<Redirect>,
}

/// An ordered chain of stages with a background flag.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPipeline {
    /// Stages in execution order.
    pub stages: Vec<PipelineStage>,
    /// Whether the pipeline runs as a background job (`&`).
    pub background: bool,
}

fn redirect_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(>>|>|<|2>|&>)\s*([^\s|]+)").unwrap())
}

/// Extract redirections from a stage's text, returning the remaining text
/// and the redirects in source order.
pub(crate) fn extract_redirects(text: &str) -> Result<(String, Vec<Redirect>), String> {
    let mut redirects = Vec::new();
    for caps in redirect_re().captures_iter(text) {
        let kind = match &caps[1] {
            ">>" => RedirectKind::Append,
            ">" => RedirectKind::Write,
            "<" => RedirectKind::Read,
            "2>" => RedirectKind::Stderr,
            "&>" => RedirectKind::Both,
            other => return Err(format!("unknown redirection operator: {}", other)),
        };
        redirects.push(Redirect {
            kind,
            target: caps[2].to_string(),
        });
    }
    let remaining = redirect_re().replace_all(text, " ").trim().to_string();
    Ok((remaining, redirects))
}

/// Tokenize command text, honoring quotes.
pub(crate) fn tokenize(text: &str) -> Result<Vec<String>, String> {
    shlex::split(text).ok_or_else(|| format!("unmatched quote in: {}", text.trim()))
}

/// Split a command line on `|` at the top level (quotes respected).
fn split_stages(line: &str) -> Vec<String> {
    let mut stages = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    for c in line.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '|' if !in_single && !in_double => {
                stages.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    stages.push(current);
    stages
}

/// Parse a command line into a [`CommandPipeline`].
pub fn parse_pipeline(line: &str) -> Result<CommandPipeline, String> {
    let mut line = line.trim();
    if line.is_empty() {
        return Err("empty command".to_string());
    }

    // Trailing `&` runs the pipeline in the background.
    let background = line.ends_with('&');
    if background {
        line = line[..line.len() - 1].trim_end();
        if line.is_empty() {
            return Err("empty command before &".to_string());
        }
    }

    let mut stages = Vec::new();
    for stage_text in split_stages(line) {
        let (remaining, redirects) = extract_redirects(&stage_text)?;
        let tokens = tokenize(&remaining)?;
        let mut tokens = tokens.into_iter();
        let name = tokens
            .next()
            .ok_or_else(|| "empty pipeline stage".to_string())?;
        stages.push(PipelineStage {
            name,
            args: tokens.collect(),
            redirects,
        });
    }

    Ok(CommandPipeline { stages, background })
}
