//! Route parse errors.

use std::fmt;

use thiserror::Error;

/// One rejected line of a route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadLine {
    /// 1-based.
    pub line: usize,
    pub text: String,
    pub reason: String,
}

impl fmt::Display for BadLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {} ({:?})", self.line, self.reason, self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteParseError {
    /// Every bad line of the table, in order.
    #[error("{} bad route line(s): {}", .0.len(), join(.0))]
    BadLines(Vec<BadLine>),

    #[error("route table is not utf-8")]
    Encoding,
}

impl RouteParseError {
    pub fn bad_lines(&self) -> &[BadLine] {
        match self {
            RouteParseError::BadLines(lines) => lines,
            RouteParseError::Encoding => &[],
        }
    }
}

fn join(lines: &[BadLine]) -> String {
    lines
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
