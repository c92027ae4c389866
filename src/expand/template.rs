// src/expand/template.rs

//! `{var}` placeholder substitution for output paths and action bodies.

use std::collections::BTreeMap;

use crate::errors::{Result, SigstepError};

/// Render a template by substituting `{var}` placeholders from `bindings`.
///
/// Rules:
/// - `{name}` where `name` is a known binding is replaced by its value.
/// - `{name}` where `name` is a *valid identifier* but unknown is an
///   `UndefinedVariable` error.
/// - `{{` renders a literal `{`.
/// - A `{...}` span that is not a plain identifier (e.g. shell `${FOO}`,
///   `{ x + 1 }`) is passed through untouched, so action bodies can contain
///   their own brace syntax.
pub fn render(template: &str, bindings: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < template.len() {
        let Some(c) = template[i..].chars().next() else {
            break;
        };
        if c != '{' {
            out.push(c);
            i += c.len_utf8();
            continue;
        }

        if template[i + 1..].starts_with('{') {
            out.push('{');
            i += 2;
            continue;
        }

        // Scan to the matching close brace.
        match template[i + 1..].find('}') {
            Some(end) => {
                let name = &template[i + 1..i + 1 + end];
                if is_identifier(name) {
                    match bindings.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            return Err(SigstepError::UndefinedVariable(name.to_string()))
                        }
                    }
                } else {
                    // Not a substitution; emit verbatim.
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
                i += 1 + end + 1;
            }
            None => {
                // Unterminated brace; emit verbatim.
                out.push('{');
                i += 1;
            }
        }
    }

    Ok(out)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_variables() {
        let b = bindings(&[("i", "2"), ("name", "a")]);
        assert_eq!(render("test_{i}.txt", &b).unwrap(), "test_2.txt");
        assert_eq!(render("{name}/{i}", &b).unwrap(), "a/2");
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let b = bindings(&[("i", "2")]);
        let err = render("test_{j}.txt", &b).unwrap_err();
        assert!(matches!(err, SigstepError::UndefinedVariable(name) if name == "j"));
    }

    #[test]
    fn shell_syntax_passes_through() {
        let b = bindings(&[("i", "0")]);
        assert_eq!(
            render("echo ${HOME} {i}", &b).unwrap(),
            "echo ${HOME} 0"
        );
        assert_eq!(render("awk '{ print }'", &b).unwrap(), "awk '{ print }'");
    }

    #[test]
    fn escaped_brace_renders_literally() {
        let b = bindings(&[("i", "0")]);
        assert_eq!(render("{{i}", &b).unwrap(), "{i}");
    }

    #[test]
    fn unterminated_brace_is_verbatim() {
        let b = bindings(&[]);
        assert_eq!(render("oops {", &b).unwrap(), "oops {");
    }
}
