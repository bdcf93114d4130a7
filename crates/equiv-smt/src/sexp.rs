//! Minimal s-expression reader for solver responses.

use std::fmt;

use num_bigint::BigInt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sexp {
    Atom(String),
    /// A `"..."` string literal, unescaped.
    Str(String),
    List(Vec<Sexp>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SexpError {
    #[error("unbalanced parentheses in `{0}`")]
    Unbalanced(String),
    #[error("unterminated {0} literal")]
    Unterminated(&'static str),
}

impl Sexp {
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Sexp::Atom(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Sexp]> {
        match self {
            Sexp::List(items) => Some(items),
            _ => None,
        }
    }

    /// Integer value, accepting the `(- n)` form for negatives.
    pub fn as_int(&self) -> Option<BigInt> {
        match self {
            Sexp::Atom(a) => a.parse().ok(),
            Sexp::List(items) => match items.as_slice() {
                [Sexp::Atom(minus), inner] if minus == "-" => inner.as_int().map(|n| -n),
                _ => None,
            },
            Sexp::Str(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.as_atom()? {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// Is this an `(error "...")` response? Returns the message.
    pub fn as_error(&self) -> Option<String> {
        let items = self.as_list()?;
        match items {
            [Sexp::Atom(head), rest @ ..] if head == "error" => Some(
                rest.iter()
                    .map(|s| match s {
                        Sexp::Str(m) => m.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            _ => None,
        }
    }
}

impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexp::Atom(a) => write!(f, "{a}"),
            Sexp::Str(s) => write!(f, "\"{s}\""),
            Sexp::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Net parenthesis depth of `text`, ignoring quoted symbols, strings and comments.
pub fn paren_depth(text: &str) -> i64 {
    let mut depth = 0i64;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            '|' => {
                for d in chars.by_ref() {
                    if d == '|' {
                        break;
                    }
                }
            }
            '"' => {
                while let Some(d) = chars.next() {
                    if d == '"' {
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            continue;
                        }
                        break;
                    }
                }
            }
            ';' => {
                for d in chars.by_ref() {
                    if d == '\n' {
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    depth
}

/// Parse every top-level s-expression in `input`.
pub fn parse_all(input: &str) -> Result<Vec<Sexp>, SexpError> {
    let mut stack: Vec<Vec<Sexp>> = vec![Vec::new()];
    let mut chars = input.chars().peekable();
    let mut atom = String::new();

    fn flush(atom: &mut String, stack: &mut [Vec<Sexp>]) {
        if !atom.is_empty() {
            if let Some(top) = stack.last_mut() {
                top.push(Sexp::Atom(std::mem::take(atom)));
            }
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '(' => {
                flush(&mut atom, &mut stack);
                stack.push(Vec::new());
            }
            ')' => {
                flush(&mut atom, &mut stack);
                let done = stack.pop().unwrap_or_default();
                match stack.last_mut() {
                    Some(top) => top.push(Sexp::List(done)),
                    None => return Err(SexpError::Unbalanced(input.to_string())),
                }
            }
            '|' => {
                let mut quoted = String::new();
                let mut closed = false;
                for d in chars.by_ref() {
                    if d == '|' {
                        closed = true;
                        break;
                    }
                    quoted.push(d);
                }
                if !closed {
                    return Err(SexpError::Unterminated("symbol"));
                }
                atom.push_str(&quoted);
            }
            '"' => {
                flush(&mut atom, &mut stack);
                let mut s = String::new();
                let mut closed = false;
                while let Some(d) = chars.next() {
                    if d == '"' {
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            s.push('"');
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    s.push(d);
                }
                if !closed {
                    return Err(SexpError::Unterminated("string"));
                }
                if let Some(top) = stack.last_mut() {
                    top.push(Sexp::Str(s));
                }
            }
            ';' => {
                flush(&mut atom, &mut stack);
                for d in chars.by_ref() {
                    if d == '\n' {
                        break;
                    }
                }
            }
            c if c.is_whitespace() => flush(&mut atom, &mut stack),
            other => atom.push(other),
        }
    }
    flush(&mut atom, &mut stack);
    if stack.len() != 1 {
        return Err(SexpError::Unbalanced(input.to_string()));
    }
    Ok(stack.pop().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_value_response() {
        let parsed = parse_all("((x 42) (|y z| (- 7)) (b true))").expect("parse");
        assert_eq!(parsed.len(), 1);
        let pairs = parsed[0].as_list().expect("list");
        assert_eq!(pairs[0].as_list().expect("pair")[1].as_int(), Some(BigInt::from(42)));
        let second = pairs[1].as_list().expect("pair");
        assert_eq!(second[0].as_atom(), Some("y z"));
        assert_eq!(second[1].as_int(), Some(BigInt::from(-7)));
        assert_eq!(pairs[2].as_list().expect("pair")[1].as_bool(), Some(true));
    }

    #[test]
    fn recognizes_error_responses() {
        let parsed = parse_all("(error \"line 3: unknown constant x\")").expect("parse");
        assert_eq!(
            parsed[0].as_error().as_deref(),
            Some("line 3: unknown constant x")
        );
    }

    #[test]
    fn depth_ignores_quoted_parens() {
        assert_eq!(paren_depth("((|a)b| 1)"), 1);
        assert_eq!(paren_depth("(x \")\")"), 0);
        assert!(parse_all("((x 1)").is_err());
    }

    #[test]
    fn large_integers_survive() {
        let big = "115792089237316195423570985008687907853269984665640564039457584007913129639935";
        let parsed = parse_all(big).expect("parse");
        assert_eq!(parsed[0].as_int().map(|n| n.to_string()).as_deref(), Some(big));
    }
}
