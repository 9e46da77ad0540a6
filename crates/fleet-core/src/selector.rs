//! Structured label selectors.
//!
//! Text form, comma separated:
//!
//! ```text
//! zone=east, tier!=batch, rack in (a,b), arch notin (arm), ssd, !draining
//! ```
//!
//! Parsed once into [`Requirement`]s; matching never re-parses.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// One clause of a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, set) => labels.get(k).is_some_and(|v| set.contains(v)),
            Requirement::NotIn(k, set) => !labels.get(k).is_some_and(|v| set.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Requirement::Equals(k, v) => write!(f, "{k}={v}"),
            Requirement::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Requirement::In(k, set) => write!(f, "{k} in ({})", join(set)),
            Requirement::NotIn(k, set) => write!(f, "{k} notin ({})", join(set)),
            Requirement::Exists(k) => f.write_str(k),
            Requirement::DoesNotExist(k) => write!(f, "!{k}"),
        }
    }
}

/// Conjunction of requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn new(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    /// Selector requiring every `key=value` pair of the map.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self::new(
            labels
                .iter()
                .map(|(k, v)| Requirement::Equals(k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, req) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{req}")?;
        }
        Ok(())
    }
}

/// Split on commas that are not inside a parenthesised value list.
fn split_clauses(s: &str) -> Result<Vec<&str>, CoreError> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(CoreError::Parse(format!("unbalanced ')' in selector {s:?}")));
                }
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(CoreError::Parse(format!("unbalanced '(' in selector {s:?}")));
    }
    out.push(&s[start..]);
    Ok(out)
}

fn valid_token(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn parse_set(raw: &str, clause: &str) -> Result<BTreeSet<String>, CoreError> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| CoreError::Parse(format!("expected (v1,v2,..) in {clause:?}")))?;
    let set: BTreeSet<String> = inner
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if set.is_empty() || !set.iter().all(|v| valid_token(v)) {
        return Err(CoreError::Parse(format!("bad value set in {clause:?}")));
    }
    Ok(set)
}

fn parse_clause(clause: &str) -> Result<Requirement, CoreError> {
    let bad = || CoreError::Parse(format!("bad selector clause {clause:?}"));
    let check = |k: &str, v: &str| -> Result<(String, String), CoreError> {
        let (k, v) = (k.trim(), v.trim());
        if valid_token(k) && valid_token(v) {
            Ok((k.to_string(), v.to_string()))
        } else {
            Err(bad())
        }
    };

    if let Some(key) = clause.strip_prefix('!') {
        let key = key.trim();
        return if valid_token(key) {
            Ok(Requirement::DoesNotExist(key.to_string()))
        } else {
            Err(bad())
        };
    }
    if let Some((k, v)) = clause.split_once("!=") {
        let (k, v) = check(k, v)?;
        return Ok(Requirement::NotEquals(k, v));
    }
    if let Some((k, v)) = clause.split_once("==").or_else(|| clause.split_once('=')) {
        let (k, v) = check(k, v)?;
        return Ok(Requirement::Equals(k, v));
    }
    if let Some((k, rest)) = clause.split_once(" notin ") {
        let k = k.trim();
        if !valid_token(k) {
            return Err(bad());
        }
        return Ok(Requirement::NotIn(k.to_string(), parse_set(rest, clause)?));
    }
    if let Some((k, rest)) = clause.split_once(" in ") {
        let k = k.trim();
        if !valid_token(k) {
            return Err(bad());
        }
        return Ok(Requirement::In(k.to_string(), parse_set(rest, clause)?));
    }
    if valid_token(clause) {
        return Ok(Requirement::Exists(clause.to_string()));
    }
    Err(bad())
}

impl FromStr for Selector {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Selector::everything());
        }
        let requirements = split_clauses(s)?
            .into_iter()
            .map(|c| parse_clause(c.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Selector { requirements })
    }
}

impl TryFrom<String> for Selector {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Selector> for String {
    fn from(sel: Selector) -> Self {
        sel.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_every_clause_kind() {
        let sel: Selector = "zone=east, tier!=batch, rack in (a,b), arch notin (arm), ssd, !draining"
            .parse()
            .unwrap();
        assert_eq!(sel.requirements().len(), 6);
        assert_eq!(
            sel.requirements()[2],
            Requirement::In("rack".into(), ["a", "b"].iter().map(|s| s.to_string()).collect())
        );
        assert_eq!(sel.requirements()[5], Requirement::DoesNotExist("draining".into()));
    }

    #[test]
    fn matching() {
        let sel: Selector = "zone=east,rack in (a,b),!draining".parse().unwrap();
        assert!(sel.matches(&labels(&[("zone", "east"), ("rack", "a")])));
        assert!(!sel.matches(&labels(&[("zone", "east"), ("rack", "c")])));
        assert!(!sel.matches(&labels(&[("zone", "east"), ("rack", "a"), ("draining", "1")])));
        assert!(!sel.matches(&labels(&[("rack", "a")])));
    }

    #[test]
    fn not_in_matches_missing_key() {
        let sel: Selector = "arch notin (arm)".parse().unwrap();
        assert!(sel.matches(&labels(&[])));
        assert!(!sel.matches(&labels(&[("arch", "arm")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel: Selector = "".parse().unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&labels(&[("any", "thing")])));
    }

    #[test]
    fn display_is_reparseable() {
        let sel: Selector = "a=1, b in (y,x), !c".parse().unwrap();
        let text = sel.to_string();
        assert_eq!(text, "a=1,b in (x,y),!c");
        assert_eq!(text.parse::<Selector>().unwrap(), sel);
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["a=", "=b", "a in x", "a in ()", "a in (b", "a b"] {
            assert!(raw.parse::<Selector>().is_err(), "{raw} should fail");
        }
    }
}
