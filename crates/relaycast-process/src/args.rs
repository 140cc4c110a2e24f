//! Splitting of the opaque encoder argument string.

use crate::error::ProcessError;
use crate::ProcessResult;

/// Split an argument string on whitespace, honouring single and double quotes.
///
/// Quotes group characters and are removed; a backslash escapes the next
/// character inside double quotes only, so Windows paths survive unquoted.
pub fn split_arguments(input: &str) -> ProcessResult<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('"') => match c {
                '"' => quote = None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => current.push('\\'),
                },
                _ => current.push(c),
            },
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        args.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if let Some(q) = quote {
        return Err(ProcessError::InvalidArguments(format!(
            "unterminated {q} quote"
        )));
    }

    if in_token {
        args.push(current);
    }

    Ok(args)
}
