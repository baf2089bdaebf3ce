//! Shell-test-style condition evaluation.
//!
//! After variable expansion the condition is matched against an ordered list
//! of rules: string equality/inequality, numeric comparison, `-n`/`-z`
//! checks, then plain truthiness (non-empty string is true, with `true` and
//! `false` as literals). Exit-status conditions (`$? -eq 0`) are covered by
//! the numeric rule once `$?` has been expanded.
//!
//! This is an ordered fallback, not an expression grammar: a condition that
//! could match several rules resolves to the first one. That is a documented
//! approximation of the source system, kept deliberately.

use std::sync::OnceLock;

use regex::Regex;

use super::executor::ExecutionContext;
use super::expand::expand;

fn equality_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^("[^"]*"|\S+)\s*(==|=|!=)\s*("[^"]*"|\S+)$"#).unwrap())
}

fn numeric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\S+)\s+-(eq|ne|gt|ge|lt|le)\s+(\S+)$").unwrap())
}

fn nonempty_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^-(n|z)\s+(.*)$"#).unwrap())
}

/// Evaluate a condition against the execution context.
pub fn evaluate(condition: &str, ctx: &ExecutionContext) -> bool {
    let expanded = expand(strip_brackets(condition), ctx);
    let expanded = expanded.trim();

    // 1. String equality / inequality.
    if let Some(caps) = equality_re().captures(expanded) {
        let left = unquote(&caps[1]);
        let right = unquote(&caps[3]);
        return match &caps[2] {
            "!=" => left != right,
            _ => left == right,
        };
    }

    // 2. Numeric comparison. Non-numeric operands fail this rule only; the
    //    evaluator falls through to the remaining rules.
    if let Some(caps) = numeric_re().captures(expanded) {
        let left = unquote(&caps[1]).parse::<i64>();
        let right = unquote(&caps[3]).parse::<i64>();
        if let (Ok(l), Ok(r)) = (left, right) {
            return match &caps[2] {
                "eq" => l == r,
                "ne" => l != r,
                "gt" => l > r,
                "ge" => l >= r,
                "lt" => l < r,
                "le" => l <= r,
                _ => unreachable!(),
            };
        }
    }

    // 3. -n / -z checks.
    if let Some(caps) = nonempty_re().captures(expanded) {
        let operand = unquote(caps[2].trim());
        return match &caps[1] {
            "n" => !operand.is_empty(),
            _ => operand.is_empty(),
        };
    }

    // 4. Truthiness of the expanded text.
    match unquote(expanded).as_str() {
        "" | "false" => false,
        _ => true,
    }
}

/// Strip surrounding `[ ... ]` / `[[ ... ]]` test brackets.
fn strip_brackets(condition: &str) -> &str {
    let t = condition.trim();
    for (open, close) in [("[[", "]]"), ("[", "]")] {
        if let Some(inner) = t.strip_prefix(open).and_then(|s| s.strip_suffix(close)) {
            return inner.trim();
        }
    }
    t
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(vars: &[(&str, &str)]) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        for (k, v) in vars {
            ctx = ctx.with_local(k, v);
        }
        ctx
    }

    #[test]
    fn test_quoted_equality_unset_and_set() {
        // With X unset the comparison is "" = "test", which is false.
        let ctx = ExecutionContext::new();
        assert!(!evaluate(r#""$X" = "test""#, &ctx));

        let ctx = ctx_with(&[("X", "test")]);
        assert!(evaluate(r#""$X" = "test""#, &ctx));
    }

    #[test]
    fn test_inequality() {
        let ctx = ctx_with(&[("X", "a")]);
        assert!(evaluate(r#""$X" != "b""#, &ctx));
        assert!(!evaluate(r#""$X" != "a""#, &ctx));
    }

    #[test]
    fn test_numeric_comparisons() {
        let ctx = ctx_with(&[("N", "5")]);
        assert!(evaluate("$N -eq 5", &ctx));
        assert!(evaluate("$N -ge 5", &ctx));
        assert!(evaluate("$N -gt 4", &ctx));
        assert!(evaluate("$N -lt 6", &ctx));
        assert!(!evaluate("$N -ne 5", &ctx));
        assert!(evaluate("3 -le $N", &ctx));
    }

    #[test]
    fn test_non_numeric_falls_through_to_truthiness() {
        let ctx = ctx_with(&[("N", "abc")]);
        // `abc -eq 5` fails the numeric rule; the expanded text is non-empty
        // so the final truthiness rule applies.
        assert!(evaluate("$N -eq 5", &ctx));
    }

    #[test]
    fn test_n_and_z_checks() {
        let ctx = ctx_with(&[("SET", "v")]);
        assert!(evaluate("-n \"$SET\"", &ctx));
        assert!(!evaluate("-n \"$UNSET\"", &ctx));
        assert!(evaluate("-z \"$UNSET\"", &ctx));
        assert!(!evaluate("-z \"$SET\"", &ctx));
    }

    #[test]
    fn test_bare_variable_truthiness() {
        let ctx = ctx_with(&[("FLAG", "yes")]);
        assert!(evaluate("$FLAG", &ctx));
        assert!(evaluate("\"$FLAG\"", &ctx));
        assert!(!evaluate("$MISSING", &ctx));
    }

    #[test]
    fn test_exit_status_checks() {
        let ctx = ExecutionContext::new().with_exit_status(0);
        assert!(evaluate("$? -eq 0", &ctx));
        let ctx = ExecutionContext::new().with_exit_status(2);
        assert!(evaluate("$? -ne 0", &ctx));
    }

    #[test]
    fn test_true_false_literals() {
        let ctx = ExecutionContext::new();
        assert!(evaluate("true", &ctx));
        assert!(!evaluate("false", &ctx));
    }

    #[test]
    fn test_test_brackets_stripped() {
        let ctx = ctx_with(&[("X", "test")]);
        assert!(evaluate(r#"[ "$X" = "test" ]"#, &ctx));
        assert!(evaluate(r#"[[ "$X" = "test" ]]"#, &ctx));
    }
}
