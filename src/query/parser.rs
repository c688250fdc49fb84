//! Path expression parser
//!
//! Parses dotted-path expressions (`.users[0].name`, `.data.items[*]`) into
//! segment sequences. The grammar:
//!
//! ```text
//! path     := "." | "." segment ( segment )*
//! segment  := property | index | wildcard
//! property := "." identifier
//! index    := "[" digits "]"
//! wildcard := "[*]"
//! ```
//!
//! The empty string and `.` both denote the root. Every parse result begins
//! with an implicit [`Segment::Root`].

use crate::error::{GalenaError, Result};

/// One segment of a parsed path expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// The root of the document tree
    Root,
    /// A mapping key
    Property(String),
    /// A sequence index
    Index(usize),
    /// A single-level sequence wildcard (`[*]`)
    Wildcard,
}

/// Parse a path expression into segments.
///
/// Fails with [`GalenaError::InvalidPath`] on a missing leading dot,
/// unbalanced brackets, non-digit indices, or empty identifiers.
pub fn parse(path: &str) -> Result<Vec<Segment>> {
    if path.is_empty() || path == "." {
        return Ok(vec![Segment::Root]);
    }

    if !path.starts_with('.') {
        return Err(GalenaError::InvalidPath(format!(
            "path must start with a dot: {path}"
        )));
    }

    let mut segments = vec![Segment::Root];
    segments.extend(parse_segments(path)?);
    Ok(segments)
}

/// Parse a relative segment sequence, without the implicit root.
///
/// Unlike [`parse`], the input may begin with a bracket segment (`[0].name`),
/// which is the shape produced by stripping a parent path off a longer one.
pub(crate) fn parse_segments(input: &str) -> Result<Vec<Segment>> {
    let mut parser = Parser::new(input);
    let mut segments = Vec::new();

    while let Some(c) = parser.peek() {
        let segment = match c {
            '.' => parser.parse_property()?,
            '[' => parser.parse_bracket()?,
            other => {
                return Err(GalenaError::InvalidPath(format!(
                    "unexpected character '{other}' in path: {input}"
                )))
            }
        };
        segments.push(segment);
    }

    if segments.is_empty() {
        return Err(GalenaError::InvalidPath(format!("empty path: {input}")));
    }

    Ok(segments)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn parse_property(&mut self) -> Result<Segment> {
        // consume the '.'
        self.advance(1);

        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.advance(1);
        }

        if self.pos == start {
            return Err(GalenaError::InvalidPath(format!(
                "expected identifier after '.' at offset {} in: {}",
                start, self.input
            )));
        }

        Ok(Segment::Property(self.input[start..self.pos].to_string()))
    }

    fn parse_bracket(&mut self) -> Result<Segment> {
        // consume the '['
        self.advance(1);

        let inner_start = self.pos;
        while self.peek().is_some_and(|c| c != ']') {
            self.advance(1);
        }

        if self.peek() != Some(']') {
            return Err(GalenaError::InvalidPath(format!(
                "unbalanced bracket in path: {}",
                self.input
            )));
        }

        let inner = &self.input[inner_start..self.pos];
        // consume the ']'
        self.advance(1);

        if inner == "*" {
            return Ok(Segment::Wildcard);
        }

        if !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_digit()) {
            let index = inner.parse::<usize>().map_err(|_| {
                GalenaError::InvalidPath(format!("index out of range in path: {}", self.input))
            })?;
            return Ok(Segment::Index(index));
        }

        Err(GalenaError::InvalidPath(format!(
            "invalid bracket segment '[{inner}]' in path: {}",
            self.input
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_path() {
        assert_eq!(parse("").unwrap(), vec![Segment::Root]);
    }

    #[test]
    fn test_root_path() {
        assert_eq!(parse(".").unwrap(), vec![Segment::Root]);
    }

    #[test]
    fn test_property_path() {
        assert_eq!(
            parse(".users").unwrap(),
            vec![Segment::Root, Segment::Property("users".into())]
        );
    }

    #[test]
    fn test_index_path() {
        assert_eq!(
            parse(".users[0]").unwrap(),
            vec![
                Segment::Root,
                Segment::Property("users".into()),
                Segment::Index(0)
            ]
        );
    }

    #[test]
    fn test_wildcard_path() {
        assert_eq!(
            parse(".users[*]").unwrap(),
            vec![
                Segment::Root,
                Segment::Property("users".into()),
                Segment::Wildcard
            ]
        );
    }

    #[test]
    fn test_complex_path() {
        assert_eq!(
            parse(".users[0].name").unwrap(),
            vec![
                Segment::Root,
                Segment::Property("users".into()),
                Segment::Index(0),
                Segment::Property("name".into())
            ]
        );
    }

    #[test]
    fn test_nested_wildcards() {
        assert_eq!(
            parse(".a[*].b[*]").unwrap(),
            vec![
                Segment::Root,
                Segment::Property("a".into()),
                Segment::Wildcard,
                Segment::Property("b".into()),
                Segment::Wildcard
            ]
        );
    }

    #[test]
    fn test_missing_leading_dot() {
        assert!(parse("users[0].name").is_err());
    }

    #[test]
    fn test_unbalanced_bracket() {
        assert!(parse(".users[0").is_err());
    }

    #[test]
    fn test_non_digit_index() {
        assert!(parse(".users[abc]").is_err());
        assert!(parse(".users[-1]").is_err());
        assert!(parse(".users[]").is_err());
    }

    #[test]
    fn test_trailing_dot() {
        assert!(parse(".users.").is_err());
    }

    #[test]
    fn test_double_dot() {
        assert!(parse(".users..name").is_err());
    }

    #[test]
    fn test_relative_segments_with_leading_bracket() {
        assert_eq!(
            parse_segments("[1].status").unwrap(),
            vec![Segment::Index(1), Segment::Property("status".into())]
        );
    }
}
