//! Script parser — raw text to a flat sequence of typed statements.
//!
//! Each line is classified by fixed-priority rules: empty → comment →
//! assignment → conditional keyword → loop keyword → function signature →
//! exit/return → command. A parse failure on any line aborts the whole parse
//! with a 1-based line number; partial results are never returned.
//!
//! Block structure (which statements belong to an `if` branch or a loop
//! body) is not resolved here; the executor's grouping pass does that over
//! the flat statement list.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::ShellError;
use crate::pipeline::{extract_redirects, tokenize, Redirect};

/// A single parsed statement. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptStatement {
    /// Original source line, untrimmed.
    pub raw: String,
    /// 1-based line number.
    pub line: u32,
    /// Classified statement content.
    pub kind: StatementKind,
}

impl ScriptStatement {
    /// Whether the statement does anything when executed.
    pub fn requires_execution(&self) -> bool {
        !matches!(self.kind, StatementKind::Comment | StatementKind::Empty)
    }
}

/// Tagged statement content, one variant per statement kind.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    /// Blank line.
    Empty,
    /// `# ...`
    Comment,
    /// `NAME=value` or `export NAME=value`.
    Assignment {
        /// Variable name (validated identifier).
        name: String,
        /// Right-hand side, quotes stripped, unexpanded.
        value: String,
        /// Whether the assignment is exported to the environment.
        exported: bool,
    },
    /// `if`/`elif`/`else`/`then`/`fi` keyword line.
    Conditional {
        /// Which keyword introduced the line.
        kind: ConditionalKind,
        /// Condition text for `if`/`elif`.
        condition: Option<String>,
    },
    /// `for`/`while`/`until`/`do`/`done` keyword line.
    Loop(LoopHeader),
    /// Function definition signature.
    Function {
        /// Function name (validated identifier).
        name: String,
        /// Body when the definition fits on one line.
        inline_body: Option<String>,
    },
    /// `exit [code]` — terminates the whole script.
    Exit {
        /// Exit code; defaults to 0.
        code: Option<i32>,
    },
    /// `return [code]` — unwinds the innermost function frame.
    Return {
        /// Return code; defaults to 0.
        code: Option<i32>,
    },
    /// Anything else: a command line.
    Command {
        /// Command name, unexpanded.
        name: String,
        /// Arguments, unexpanded.
        args: Vec<String>,
        /// Redirections extracted from the line.
        redirects: Vec<Redirect>,
        /// Trailing `&`.
        background: bool,
    },
}

/// Conditional keyword kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalKind {
    /// `if <condition>`
    If,
    /// `elif <condition>`
    Elif,
    /// `then`
    Then,
    /// `else`
    Else,
    /// `fi`
    Fi,
}

/// Loop keyword lines.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopHeader {
    /// `for VAR in items...`
    For {
        /// Loop variable.
        var: String,
        /// Literal item list (expanded at execution time).
        items: Vec<String>,
        /// Whether the line ended with `; do`.
        has_do: bool,
    },
    /// `while <condition>`
    While {
        /// Condition text.
        condition: String,
        /// Whether the line ended with `; do`.
        has_do: bool,
    },
    /// `until <condition>`
    Until {
        /// Condition text.
        condition: String,
        /// Whether the line ended with `; do`.
        has_do: bool,
    },
    /// `do`
    Do,
    /// `done`
    Done,
}

fn assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(export\s+)?([^\s=]+)=(.*)$").unwrap())
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
}

fn function_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // name() [ { [inline-body] [}] ]
    RE.get_or_init(|| Regex::new(r"^([^\s(]+)\s*\(\)\s*(?:\{\s*(.*?)\s*(\})?)?\s*$").unwrap())
}

/// Check a name against the identifier rule `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_re().is_match(name)
}

/// Parse script text into statements. Fail-fast: the first bad line aborts
/// the parse and reports its 1-based line number. Empty input yields an
/// empty statement list.
pub fn parse_script(text: &str) -> Result<Vec<ScriptStatement>, ShellError> {
    let mut statements = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = (idx + 1) as u32;
        let kind = classify_line(raw).map_err(|message| ShellError::Syntax { line, message })?;
        statements.push(ScriptStatement {
            raw: raw.to_string(),
            line,
            kind,
        });
    }
    Ok(statements)
}

/// Classify one line by the fixed-priority rules.
fn classify_line(raw: &str) -> Result<StatementKind, String> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Ok(StatementKind::Empty);
    }
    if trimmed.starts_with('#') {
        return Ok(StatementKind::Comment);
    }
    if let Some(kind) = try_assignment(trimmed)? {
        return Ok(kind);
    }
    if let Some(kind) = try_conditional(trimmed)? {
        return Ok(kind);
    }
    if let Some(kind) = try_loop(trimmed)? {
        return Ok(kind);
    }
    if let Some(kind) = try_function(trimmed)? {
        return Ok(kind);
    }
    if let Some(kind) = try_exit_return(trimmed)? {
        return Ok(kind);
    }
    parse_command(trimmed)
}

fn try_assignment(trimmed: &str) -> Result<Option<StatementKind>, String> {
    let Some(caps) = assignment_re().captures(trimmed) else {
        return Ok(None);
    };
    let name = caps[2].to_string();
    if !is_valid_identifier(&name) {
        return Err(format!("invalid variable name: {}", name));
    }
    Ok(Some(StatementKind::Assignment {
        name,
        value: strip_quotes(&caps[3]).to_string(),
        exported: caps.get(1).is_some(),
    }))
}

fn try_conditional(trimmed: &str) -> Result<Option<StatementKind>, String> {
    let kind = match keyword_of(trimmed) {
        Some("if") => ConditionalKind::If,
        Some("elif") => ConditionalKind::Elif,
        Some("then") => ConditionalKind::Then,
        Some("else") => ConditionalKind::Else,
        Some("fi") => ConditionalKind::Fi,
        _ => return Ok(None),
    };

    let condition = match kind {
        ConditionalKind::If | ConditionalKind::Elif => {
            let keyword_len = if kind == ConditionalKind::If { 2 } else { 4 };
            let rest = strip_then_suffix(trimmed[keyword_len..].trim());
            if rest.is_empty() {
                return Err(format!(
                    "missing condition after `{}`",
                    if kind == ConditionalKind::If { "if" } else { "elif" }
                ));
            }
            Some(rest.to_string())
        }
        _ => {
            if !rest_after_keyword(trimmed).is_empty() {
                return Err(format!("unexpected text after `{}`", keyword_of(trimmed).unwrap()));
            }
            None
        }
    };

    Ok(Some(StatementKind::Conditional { kind, condition }))
}

fn try_loop(trimmed: &str) -> Result<Option<StatementKind>, String> {
    let header = match keyword_of(trimmed) {
        Some("for") => {
            let rest = strip_do_suffix(trimmed[3..].trim());
            let tokens = tokenize(rest)?;
            let mut iter = tokens.into_iter();
            let var = iter.next().ok_or("missing loop variable after `for`")?;
            if !is_valid_identifier(&var) {
                return Err(format!("invalid variable name: {}", var));
            }
            match iter.next().as_deref() {
                Some("in") => {}
                _ => return Err("expected `in` after loop variable".to_string()),
            }
            LoopHeader::For {
                var,
                items: iter.collect(),
                has_do: has_do_suffix(trimmed),
            }
        }
        Some("while") => {
            let condition = strip_do_suffix(trimmed[5..].trim()).to_string();
            if condition.is_empty() {
                return Err("missing condition after `while`".to_string());
            }
            LoopHeader::While {
                condition,
                has_do: has_do_suffix(trimmed),
            }
        }
        Some("until") => {
            let condition = strip_do_suffix(trimmed[5..].trim()).to_string();
            if condition.is_empty() {
                return Err("missing condition after `until`".to_string());
            }
            LoopHeader::Until {
                condition,
                has_do: has_do_suffix(trimmed),
            }
        }
        Some("do") => LoopHeader::Do,
        Some("done") => LoopHeader::Done,
        _ => return Ok(None),
    };
    Ok(Some(StatementKind::Loop(header)))
}

fn try_function(trimmed: &str) -> Result<Option<StatementKind>, String> {
    if !trimmed.contains("()") {
        return Ok(None);
    }
    let Some(caps) = function_re().captures(trimmed) else {
        return Ok(None);
    };
    let name = caps[1].to_string();
    if !is_valid_identifier(&name) {
        return Err(format!("invalid function name: {}", name));
    }
    // A body captured between `{` and a closing `}` on the same line is an
    // inline definition; otherwise the executor collects the body lines.
    let inline_body = match (caps.get(2), caps.get(3)) {
        (Some(body), Some(_)) => Some(body.as_str().trim_end_matches(';').trim().to_string()),
        (Some(body), None) if !body.as_str().is_empty() => {
            return Err(format!("unterminated function body on definition line: {}", name));
        }
        _ => None,
    };
    Ok(Some(StatementKind::Function { name, inline_body }))
}

fn try_exit_return(trimmed: &str) -> Result<Option<StatementKind>, String> {
    let keyword = match keyword_of(trimmed) {
        Some(k @ ("exit" | "return")) => k,
        _ => return Ok(None),
    };
    let rest = rest_after_keyword(trimmed);
    let code = if rest.is_empty() {
        None
    } else {
        Some(
            rest.parse::<i32>()
                .map_err(|_| format!("numeric argument required: {}", rest))?,
        )
    };
    Ok(Some(if keyword == "exit" {
        StatementKind::Exit { code }
    } else {
        StatementKind::Return { code }
    }))
}

fn parse_command(trimmed: &str) -> Result<StatementKind, String> {
    let mut text = trimmed;
    let background = text.ends_with('&');
    if background {
        text = text[..text.len() - 1].trim_end();
        if text.is_empty() {
            return Err("missing command before &".to_string());
        }
    }

    let (remaining, redirects) = extract_redirects(text)?;
    let tokens = tokenize(&remaining)?;
    let mut iter = tokens.into_iter();
    let name = iter.next().ok_or("missing command")?;
    Ok(StatementKind::Command {
        name,
        args: iter.collect(),
        redirects,
        background,
    })
}

/// First whitespace-delimited word of the line, if it is purely a keyword
/// candidate (a word possibly followed by more text).
fn keyword_of(trimmed: &str) -> Option<&str> {
    Some(trimmed.split_whitespace().next().unwrap_or(trimmed))
}

fn rest_after_keyword(trimmed: &str) -> &str {
    match trimmed.find(char::is_whitespace) {
        Some(i) => trimmed[i..].trim(),
        None => "",
    }
}

/// Strip a trailing `; then` / `;then` from an if/elif line.
fn strip_then_suffix(text: &str) -> &str {
    let t = text.trim_end();
    for suffix in ["; then", ";then"] {
        if let Some(stripped) = t.strip_suffix(suffix) {
            return stripped.trim_end_matches(';').trim();
        }
    }
    t.trim_end_matches(';').trim()
}

/// Strip a trailing `; do` / `;do` from a loop header line.
fn strip_do_suffix(text: &str) -> &str {
    let t = text.trim_end();
    for suffix in ["; do", ";do"] {
        if let Some(stripped) = t.strip_suffix(suffix) {
            return stripped.trim_end_matches(';').trim();
        }
    }
    t.trim_end_matches(';').trim()
}

fn has_do_suffix(trimmed: &str) -> bool {
    let t = trimmed.trim_end();
    t.ends_with("; do") || t.ends_with(";do")
}

/// Strip one layer of matched surrounding quotes.
fn strip_quotes(value: &str) -> &str {
    let v = value.trim();
    if v.len() >= 2
        && ((v.starts_with('"') && v.ends_with('"')) || (v.starts_with('\'') && v.ends_with('\'')))
    {
        &v[1..v.len() - 1]
    } else {
        v
    }
}
