//! Warning and critical threshold ranges.
//!
//! Plugins write thresholds as `10`, `10:`, `~:10`, `10:20` or `@10:20`.
//! Only the numbers are extracted: one number is a simple threshold, two
//! numbers a range whose fill tells whether the alert fires inside (`@`)
//! or outside of it.

use std::sync::LazyLock;

use regex::Regex;

use perfflux_types::{FieldMap, TagMap};

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[+-]?\d+(?:\.\d+)?").expect("valid number pattern"));

/// Which side of a range raises the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Single threshold, no range.
    None,
    /// `@` ranges alert inside the range.
    Inner,
    /// Plain ranges alert outside the range.
    Outer,
}

impl Fill {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fill::None => "none",
            Fill::Inner => "inner",
            Fill::Outer => "outer",
        }
    }
}

/// A resolved threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Threshold {
    Simple(String),
    Range { min: String, max: String, fill: Fill },
}

impl Threshold {
    /// Resolve a raw threshold string. On failure the extracted numbers are
    /// returned so the caller can report them.
    pub fn resolve(raw: &str) -> Result<Threshold, Vec<String>> {
        let normalized = raw.replace(',', ".");
        let hits: Vec<String> = NUMBER
            .find_iter(&normalized)
            .map(|m| m.as_str().to_string())
            .collect();

        match hits.as_slice() {
            [value] => Ok(Threshold::Simple(normalize_number(value))),
            [min, max] => Ok(Threshold::Range {
                min: normalize_number(min),
                max: normalize_number(max),
                fill: if raw.contains('@') {
                    Fill::Inner
                } else {
                    Fill::Outer
                },
            }),
            _ => Err(hits),
        }
    }

    pub fn fill(&self) -> Fill {
        match self {
            Threshold::Simple(_) => Fill::None,
            Threshold::Range { fill, .. } => *fill,
        }
    }

    /// Write the fields and fill tag for threshold `kind` (`warn`/`crit`).
    pub fn apply(&self, kind: &str, fields: &mut FieldMap, tags: &mut TagMap) {
        match self {
            Threshold::Simple(value) => {
                fields.insert(kind.to_string(), value.clone());
            }
            Threshold::Range { min, max, .. } => {
                fields.insert(format!("{}-min", kind), min.clone());
                fields.insert(format!("{}-max", kind), max.clone());
            }
        }
        tags.insert(format!("{}-fill", kind), self.fill().as_str().to_string());
    }
}

/// Make sure a number carries a decimal point (`4` becomes `4.0`).
///
/// A decimal comma is turned into a point first.
pub fn normalize_number(raw: &str) -> String {
    let value = raw.trim().replace(',', ".");
    if value.contains('.') {
        value
    } else {
        format!("{}.0", value)
    }
}
