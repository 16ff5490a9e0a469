#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Rule_dsl implements the boolean condition language rules are
//! written in.
//!
//! A condition is evaluated against a flattened record: a map from
//! dotted-path keys (`ObjectRef.Namespace`) to JSON values. The
//! language is deliberately small:
//!
//! ```text
//! expr  := or
//! or    := and ("or" and)*
//! and   := not ("and" not)*
//! not   := "not"? cmp
//! cmp   := ref op value
//!        | ref "=~" STRING
//!        | ref "in" "(" value ("," value)* ")"
//!        | "(" expr ")"
//! ref   := IDENT ("." IDENT)*
//! value := STRING | NUMBER
//! op    := "=" | "!=" | ">" | "<" | ">=" | "<="
//! ```
//!
//! Parsing doubles as the syntax check rules are vetted with at load
//! time; pattern literals are compiled then, so a bad regex is a
//! load-time error. Evaluation of a parsed expression is total:
//! absent fields compare unequal to any literal, and absent fields
//! in membership tests or pattern matches yield false.

use serde_json::{Map, Value};

mod eval;
mod parser;
mod token;

pub use parser::{CmpOp, Expr, Literal, parse};

/// Error is the reason an expression was rejected.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A character outside the language.
    #[error("unexpected character {ch:?} at byte {pos}")]
    UnexpectedChar {
        /// Byte offset into the expression.
        pos: usize,
        /// The offending character.
        ch: char,
    },
    /// A string literal with no closing quote.
    #[error("unterminated string literal starting at byte {pos}")]
    UnterminatedString {
        /// Byte offset of the opening quote.
        pos: usize,
    },
    /// A numeric literal that does not parse.
    #[error("invalid number {text:?} at byte {pos}")]
    BadNumber {
        /// Byte offset of the literal.
        pos: usize,
        /// The literal text.
        text: String,
    },
    /// A token in a position the grammar does not allow.
    #[error("unexpected {found} at byte {pos}, expected {expected}")]
    UnexpectedToken {
        /// Byte offset of the token.
        pos: usize,
        /// Description of the token found.
        found: String,
        /// Description of what the parser wanted.
        expected: &'static str,
    },
    /// The expression ended mid-production.
    #[error("unexpected end of expression, expected {expected}")]
    UnexpectedEnd {
        /// Description of what the parser wanted.
        expected: &'static str,
    },
    /// A `=~` pattern that is not a valid regular expression.
    #[error("invalid pattern {pattern:?}: {source}")]
    BadPattern {
        /// The pattern text.
        pattern: String,
        /// The regex error.
        source: regex::Error,
    },
}

/// Result typedef for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Check reports whether `expr` is a well-formed condition.
pub fn check(expr: &str) -> Result<()> {
    parse(expr).map(|_| ())
}

/// Evaluate parses `expr` and evaluates it against the flattened
/// record `env`.
pub fn evaluate(env: &Map<String, Value>, expr: &str) -> Result<bool> {
    Ok(parse(expr)?.eval(env))
}
