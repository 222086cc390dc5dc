//! Perfdata parsing: tokenizer, sanitizer, threshold ranges and the
//! record-to-point parser.

mod perfdata;
mod range;
mod sanitize;
mod tokenizer;

pub use perfdata::{CheckKind, PerfdataParser, CUSTOM_FIELD_KEY, CUSTOM_TAG_KEY};
pub use range::{normalize_number, Fill, Threshold};
pub use sanitize::sanitize;
pub use tokenizer::{tokenize, RawRecord};

use thiserror::Error;

/// A record that cannot be turned into points at all.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("TIMET is not a unix timestamp: '{0}'")]
    InvalidTime(String),
}
