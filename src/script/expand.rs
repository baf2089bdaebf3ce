//! Variable expansion.
//!
//! Supports `$NAME`, `${NAME}`, and the special parameters `$?`, `$#`, `$@`
//! and `$0`–`$9`. Unset variables expand to the empty string. Expansion is
//! applied to whole statement lines before they are re-parsed as pipelines,
//! so a variable holding spaces undergoes word splitting like a real shell.

use super::executor::ExecutionContext;

/// Expand all variable references in `text` against the context.
pub fn expand(text: &str, ctx: &ExecutionContext) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    result.push_str(&ctx.var(&name).unwrap_or_default());
                } else {
                    // Unterminated ${ — keep the literal text.
                    result.push_str("${");
                    result.push_str(&name);
                }
            }
            Some(&c) if c == '?' || c == '#' || c == '@' || c.is_ascii_digit() => {
                chars.next();
                result.push_str(&ctx.var(&c.to_string()).unwrap_or_default());
            }
            Some(&c) if c == '_' || c.is_ascii_alphabetic() => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '_' || c.is_ascii_alphanumeric() {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                result.push_str(&ctx.var(&name).unwrap_or_default());
            }
            _ => result.push('$'),
        }
    }

    result
}
