//! Metric points emitted by the scanner, rendered as Influx line protocol.

use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Str(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Unix nanoseconds.
    pub timestamp: i64,
}

fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

impl MetricPoint {
    pub fn new(measurement: &str, timestamp: i64) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// `measurement,tag=v field=1i,other=0.5 ts`. Empty tag values are dropped.
    pub fn to_line_protocol(&self) -> String {
        let mut out = escape_measurement(&self.measurement);
        for (k, v) in self.tags.iter().filter(|(_, v)| !v.is_empty()) {
            let _ = write!(out, ",{}={}", escape_key(k), escape_key(v));
        }
        let mut sep = ' ';
        for (k, v) in &self.fields {
            out.push(sep);
            sep = ',';
            out.push_str(&escape_key(k));
            out.push('=');
            match v {
                FieldValue::Float(f) => {
                    let _ = write!(out, "{f}");
                }
                FieldValue::Int(i) => {
                    let _ = write!(out, "{i}i");
                }
                FieldValue::Str(s) => {
                    let _ = write!(out, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""));
                }
            }
        }
        let _ = write!(out, " {}", self.timestamp);
        out
    }
}
