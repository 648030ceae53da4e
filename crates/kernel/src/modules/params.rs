//! Module parameter strings.
//!
//! `init_module` takes a single shell-like string: parameters split on
//! unquoted spaces, `'` and `"` quoting, and backslash escapes for
//! `n t r b \ e`. An unknown escape keeps the escaped character.

use alloc::{string::String, vec::Vec};

/// Splits a raw parameter string. Leading and repeated spaces produce no
/// empty parameters; quotes may close and reopen within one parameter.
pub fn parse_params(raw: &str) -> Vec<String> {
    let mut params: Vec<String> = Vec::new();

    let mut in_squote = false;
    let mut in_dquote = false;
    let mut in_escape = false;

    for ch in raw.chars() {
        let ch = if !in_escape {
            match ch {
                '\\' => {
                    in_escape = true;
                    continue;
                }
                '"' if !in_squote => {
                    in_dquote = !in_dquote;
                    continue;
                }
                '\'' if !in_dquote => {
                    in_squote = !in_squote;
                    continue;
                }
                ' ' if !in_squote && !in_dquote => {
                    // Ignore whitespace before the first parameter; a space
                    // after a non-empty parameter starts the next one.
                    if let Some(last) = params.last() {
                        if !last.is_empty() {
                            params.push(String::new());
                        }
                    }
                    continue;
                }
                other => other,
            }
        } else {
            in_escape = false;
            match ch {
                'e' => '\x1b',
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                'b' => '\x08',
                other => other,
            }
        };

        if params.is_empty() {
            params.push(String::new());
        }
        params.last_mut().expect("just pushed").push(ch);
    }

    // A trailing separator may have opened an empty slot.
    if params.last().is_some_and(|last| last.is_empty()) {
        params.pop();
    }

    params
}
