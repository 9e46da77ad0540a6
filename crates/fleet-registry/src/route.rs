//! Route tables in their two text dialects.
//!
//! v2, one mapping per line:
//!
//! ```text
//! # comment
//! region = sh;bj
//! ```
//!
//! v4, one rule per line, the source match optional:
//!
//! ```text
//! user != test,dev => cluster = blue
//! => cluster = green
//! ```
//!
//! Parsing is strict and reports every bad line at once.

use std::fmt;

use crate::error::{BadLine, RouteParseError};

/// Preamble written at the top of emitted v2 tables.
pub const V2_PREAMBLE: &str = "# auto generated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteVersion {
    V2,
    V4,
}

impl RouteVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteVersion::V2 => "2",
            RouteVersion::V4 => "4",
        }
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && !s
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '=' | ';' | ',' | '!' | '#'))
}

/// Non-comment lines with their 1-based numbers.
fn content_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn bad(line: usize, text: &str, reason: impl Into<String>) -> BadLine {
    BadLine {
        line,
        text: text.to_string(),
        reason: reason.into(),
    }
}

fn split_values(raw: &str, sep: char) -> Result<Vec<String>, String> {
    let mut values = Vec::new();
    for value in raw.split(sep).map(str::trim) {
        if value.is_empty() {
            continue;
        }
        if !is_token(value) {
            return Err(format!("invalid value {value:?}"));
        }
        values.push(value.to_string());
    }
    if values.is_empty() {
        return Err("no values".into());
    }
    Ok(values)
}

// ── v2 ────────────────────────────────────────────────────────────

/// `key = v1;v2;…` mappings, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteV2 {
    pub entries: Vec<(String, Vec<String>)>,
}

impl RouteV2 {
    pub fn parse(text: &str) -> Result<Self, RouteParseError> {
        let mut entries = Vec::new();
        let mut errors = Vec::new();
        for (n, line) in content_lines(text) {
            let Some((key, values)) = line.split_once('=') else {
                errors.push(bad(n, line, "missing '='"));
                continue;
            };
            let key = key.trim();
            if !is_token(key) {
                errors.push(bad(n, line, format!("invalid key {key:?}")));
                continue;
            }
            match split_values(values, ';') {
                Ok(values) => entries.push((key.to_string(), values)),
                Err(reason) => errors.push(bad(n, line, reason)),
            }
        }
        if errors.is_empty() {
            Ok(Self { entries })
        } else {
            Err(RouteParseError::BadLines(errors))
        }
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }
}

impl fmt::Display for RouteV2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{V2_PREAMBLE}")?;
        for (key, values) in &self.entries {
            writeln!(f, "{key} = {}", values.join(";"))?;
        }
        Ok(())
    }
}

// ── v4 ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Eq,
    NotEq,
}

impl MatchOp {
    fn as_str(&self) -> &'static str {
        match self {
            MatchOp::Eq => "=",
            MatchOp::NotEq => "!=",
        }
    }
}

/// `key (=|!=) v1,v2,…`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub key: String,
    pub op: MatchOp,
    pub values: Vec<String>,
}

impl Match {
    fn parse(raw: &str) -> Result<Self, String> {
        let (key, op, values) = if let Some((k, v)) = raw.split_once("!=") {
            (k, MatchOp::NotEq, v)
        } else if let Some((k, v)) = raw.split_once('=') {
            (k, MatchOp::Eq, v)
        } else {
            return Err(format!("missing operator in {:?}", raw.trim()));
        };
        let key = key.trim();
        if !is_token(key) {
            return Err(format!("invalid key {key:?}"));
        }
        Ok(Self {
            key: key.to_string(),
            op,
            values: split_values(values, ',')?,
        })
    }

    /// Whether `value` satisfies this match.
    pub fn accepts(&self, value: &str) -> bool {
        let listed = self.values.iter().any(|v| v == value);
        match self.op {
            MatchOp::Eq => listed,
            MatchOp::NotEq => !listed,
        }
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.key, self.op.as_str(), self.values.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleV4 {
    /// `None` applies the rule unconditionally.
    pub source: Option<Match>,
    pub dest: Match,
}

impl fmt::Display for RuleV4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{src} => {}", self.dest),
            None => write!(f, "=> {}", self.dest),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteV4 {
    pub rules: Vec<RuleV4>,
}

impl RouteV4 {
    pub fn parse(text: &str) -> Result<Self, RouteParseError> {
        let mut rules = Vec::new();
        let mut errors = Vec::new();
        for (n, line) in content_lines(text) {
            let Some((src, dst)) = line.split_once("=>") else {
                errors.push(bad(n, line, "missing '=>'"));
                continue;
            };
            let source = if src.trim().is_empty() {
                Ok(None)
            } else {
                Match::parse(src).map(Some)
            };
            match (source, Match::parse(dst)) {
                (Ok(source), Ok(dest)) => rules.push(RuleV4 { source, dest }),
                (Err(reason), _) | (_, Err(reason)) => errors.push(bad(n, line, reason)),
            }
        }
        if errors.is_empty() {
            Ok(Self { rules })
        } else {
            Err(RouteParseError::BadLines(errors))
        }
    }
}

impl fmt::Display for RouteV4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.rules {
            writeln!(f, "{rule}")?;
        }
        Ok(())
    }
}

/// A parsed table of either dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteConfig {
    V2(RouteV2),
    V4(RouteV4),
}

impl RouteConfig {
    pub fn parse(version: RouteVersion, raw: &[u8]) -> Result<Self, RouteParseError> {
        let text = std::str::from_utf8(raw).map_err(|_| RouteParseError::Encoding)?;
        match version {
            RouteVersion::V2 => RouteV2::parse(text).map(RouteConfig::V2),
            RouteVersion::V4 => RouteV4::parse(text).map(RouteConfig::V4),
        }
    }

    pub fn version(&self) -> RouteVersion {
        match self {
            RouteConfig::V2(_) => RouteVersion::V2,
            RouteConfig::V4(_) => RouteVersion::V4,
        }
    }
}

impl fmt::Display for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteConfig::V2(r) => r.fmt(f),
            RouteConfig::V4(r) => r.fmt(f),
        }
    }
}
