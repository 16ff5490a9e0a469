//! Lexer for the condition language.

use crate::{Error, Result};

/// Tok is a single lexeme.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Match,
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
    In,
}

impl Tok {
    /// Describe renders the token for error messages.
    pub(crate) fn describe(&self) -> String {
        match self {
            Tok::Ident(s) => format!("identifier {s:?}"),
            Tok::Str(s) => format!("string {s:?}"),
            Tok::Num(n) => format!("number {n}"),
            Tok::Eq => "`=`".into(),
            Tok::Ne => "`!=`".into(),
            Tok::Gt => "`>`".into(),
            Tok::Ge => "`>=`".into(),
            Tok::Lt => "`<`".into(),
            Tok::Le => "`<=`".into(),
            Tok::Match => "`=~`".into(),
            Tok::LParen => "`(`".into(),
            Tok::RParen => "`)`".into(),
            Tok::Comma => "`,`".into(),
            Tok::And => "`and`".into(),
            Tok::Or => "`or`".into(),
            Tok::Not => "`not`".into(),
            Tok::In => "`in`".into(),
        }
    }
}

/// Spanned is a token with its byte offset, for error reporting.
#[derive(Clone, Debug)]
pub(crate) struct Spanned {
    pub(crate) tok: Tok,
    pub(crate) pos: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/')
}

/// Lex turns `input` into a token stream.
pub(crate) fn lex(input: &str) -> Result<Vec<Spanned>> {
    let mut out = Vec::new();
    let mut it = input.char_indices().peekable();

    while let Some(&(pos, c)) = it.peek() {
        match c {
            c if c.is_whitespace() => {
                it.next();
            }
            '(' => {
                it.next();
                out.push(Spanned { tok: Tok::LParen, pos });
            }
            ')' => {
                it.next();
                out.push(Spanned { tok: Tok::RParen, pos });
            }
            ',' => {
                it.next();
                out.push(Spanned { tok: Tok::Comma, pos });
            }
            '>' => {
                it.next();
                let tok = if it.peek().is_some_and(|&(_, c)| c == '=') {
                    it.next();
                    Tok::Ge
                } else {
                    Tok::Gt
                };
                out.push(Spanned { tok, pos });
            }
            '<' => {
                it.next();
                let tok = if it.peek().is_some_and(|&(_, c)| c == '=') {
                    it.next();
                    Tok::Le
                } else {
                    Tok::Lt
                };
                out.push(Spanned { tok, pos });
            }
            '=' => {
                it.next();
                let tok = if it.peek().is_some_and(|&(_, c)| c == '~') {
                    it.next();
                    Tok::Match
                } else {
                    Tok::Eq
                };
                out.push(Spanned { tok, pos });
            }
            '!' => {
                it.next();
                match it.peek() {
                    Some(&(_, '=')) => {
                        it.next();
                        out.push(Spanned { tok: Tok::Ne, pos });
                    }
                    _ => return Err(Error::UnexpectedChar { pos, ch: '!' }),
                }
            }
            '"' => {
                it.next();
                let mut s = String::new();
                loop {
                    match it.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match it.next() {
                            Some((_, c)) => s.push(c),
                            None => return Err(Error::UnterminatedString { pos }),
                        },
                        Some((_, c)) => s.push(c),
                        None => return Err(Error::UnterminatedString { pos }),
                    }
                }
                out.push(Spanned {
                    tok: Tok::Str(s),
                    pos,
                });
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                text.push(c);
                it.next();
                while let Some(&(_, c)) = it.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        text.push(c);
                        it.next();
                    } else {
                        break;
                    }
                }
                let n: f64 = text
                    .parse()
                    .map_err(|_| Error::BadNumber {
                        pos,
                        text: text.clone(),
                    })?;
                out.push(Spanned {
                    tok: Tok::Num(n),
                    pos,
                });
            }
            c if is_ident_start(c) => {
                let mut text = String::new();
                while let Some(&(_, c)) = it.peek() {
                    if is_ident_continue(c) {
                        text.push(c);
                        it.next();
                    } else {
                        break;
                    }
                }
                let tok = match text.as_str() {
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    "in" => Tok::In,
                    _ => Tok::Ident(text),
                };
                out.push(Spanned { tok, pos });
            }
            ch => return Err(Error::UnexpectedChar { pos, ch }),
        }
    }

    Ok(out)
}
