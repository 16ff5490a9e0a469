//! Recursive-descent parser for the condition language.

use regex::Regex;

use crate::token::{Spanned, Tok, lex};
use crate::{Error, Result};

/// Literal is a string or numeric constant.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    /// A double-quoted string.
    Str(String),
    /// A decimal number.
    Num(f64),
}

/// CmpOp is a relational operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

/// Expr is a parsed condition.
#[derive(Clone, Debug)]
pub enum Expr {
    /// Either branch.
    Or(Box<Expr>, Box<Expr>),
    /// Both branches.
    And(Box<Expr>, Box<Expr>),
    /// Negation.
    Not(Box<Expr>),
    /// A relational comparison of a field against a literal.
    Cmp {
        /// Dotted field reference.
        field: String,
        /// The operator.
        op: CmpOp,
        /// The literal compared against.
        value: Literal,
    },
    /// A regular-expression match of a field.
    Match {
        /// Dotted field reference.
        field: String,
        /// The compiled pattern.
        pattern: Regex,
    },
    /// A membership test of a field against a literal list.
    In {
        /// Dotted field reference.
        field: String,
        /// The literal list.
        list: Vec<Literal>,
    },
}

/// Parse turns `input` into an [`Expr`], rejecting anything outside
/// the grammar.
pub fn parse(input: &str) -> Result<Expr> {
    let toks = lex(input)?;
    let mut p = Parser { toks, i: 0 };
    let expr = p.or()?;
    if let Some(s) = p.peek() {
        return Err(Error::UnexpectedToken {
            pos: s.pos,
            found: s.tok.describe(),
            expected: "end of expression",
        });
    }
    Ok(expr)
}

struct Parser {
    toks: Vec<Spanned>,
    i: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.toks.get(self.i)
    }

    fn next(&mut self, expected: &'static str) -> Result<Spanned> {
        let s = self
            .toks
            .get(self.i)
            .cloned()
            .ok_or(Error::UnexpectedEnd { expected })?;
        self.i += 1;
        Ok(s)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek().is_some_and(|s| &s.tok == tok) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, expected: &'static str) -> Result<()> {
        let s = self.next(expected)?;
        if s.tok == tok {
            Ok(())
        } else {
            Err(Error::UnexpectedToken {
                pos: s.pos,
                found: s.tok.describe(),
                expected,
            })
        }
    }

    fn or(&mut self) -> Result<Expr> {
        let mut lhs = self.and()?;
        while self.eat(&Tok::Or) {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut lhs = self.not()?;
        while self.eat(&Tok::And) {
            let rhs = self.not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr> {
        if self.eat(&Tok::Not) {
            Ok(Expr::Not(Box::new(self.cmp()?)))
        } else {
            self.cmp()
        }
    }

    fn cmp(&mut self) -> Result<Expr> {
        let s = self.next("a field reference or `(`")?;
        match s.tok {
            Tok::LParen => {
                let inner = self.or()?;
                self.expect(Tok::RParen, "`)`")?;
                Ok(inner)
            }
            Tok::Ident(field) => self.comparison(field),
            tok => Err(Error::UnexpectedToken {
                pos: s.pos,
                found: tok.describe(),
                expected: "a field reference or `(`",
            }),
        }
    }

    fn comparison(&mut self, field: String) -> Result<Expr> {
        let s = self.next("a comparison operator")?;
        let op = match s.tok {
            Tok::Eq => CmpOp::Eq,
            Tok::Ne => CmpOp::Ne,
            Tok::Gt => CmpOp::Gt,
            Tok::Ge => CmpOp::Ge,
            Tok::Lt => CmpOp::Lt,
            Tok::Le => CmpOp::Le,
            Tok::Match => {
                let pat = self.next("a pattern string")?;
                return match pat.tok {
                    Tok::Str(p) => {
                        let pattern = Regex::new(&p).map_err(|source| Error::BadPattern {
                            pattern: p,
                            source,
                        })?;
                        Ok(Expr::Match { field, pattern })
                    }
                    tok => Err(Error::UnexpectedToken {
                        pos: pat.pos,
                        found: tok.describe(),
                        expected: "a pattern string",
                    }),
                };
            }
            Tok::In => {
                self.expect(Tok::LParen, "`(`")?;
                let mut list = vec![self.literal()?];
                while self.eat(&Tok::Comma) {
                    list.push(self.literal()?);
                }
                self.expect(Tok::RParen, "`)`")?;
                return Ok(Expr::In { field, list });
            }
            tok => {
                return Err(Error::UnexpectedToken {
                    pos: s.pos,
                    found: tok.describe(),
                    expected: "a comparison operator",
                });
            }
        };
        let value = self.literal()?;
        Ok(Expr::Cmp { field, op, value })
    }

    fn literal(&mut self) -> Result<Literal> {
        let s = self.next("a string or number literal")?;
        match s.tok {
            Tok::Str(v) => Ok(Literal::Str(v)),
            Tok::Num(v) => Ok(Literal::Num(v)),
            tok => Err(Error::UnexpectedToken {
                pos: s.pos,
                found: tok.describe(),
                expected: "a string or number literal",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_of_membership() {
        match parse(r#"ObjectRef.Resource in ("pods","secrets")"#).expect("parses") {
            Expr::In { field, list } => {
                assert_eq!(field, "ObjectRef.Resource");
                assert_eq!(
                    list,
                    vec![Literal::Str("pods".into()), Literal::Str("secrets".into())]
                );
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn not_binds_to_a_single_comparison() {
        // `not a = "1" and b = "2"` is `(not a = "1") and (b = "2")`.
        match parse(r#"not a = "1" and b = "2""#).expect("parses") {
            Expr::And(lhs, _) => assert!(matches!(*lhs, Expr::Not(_))),
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn trailing_tokens_are_rejected() {
        assert!(parse(r#"a = "1" b"#).is_err());
        assert!(parse(r#"a = "1" )"#).is_err());
    }
}
