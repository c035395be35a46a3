//! Line-record parsing for command-driven capture.
//!
//! The tracing command prints one operation per line:
//! `<pool_guid> <dataset_guid> <r|w> <bytes> <start_ns> <end_ns>`.
//! GUIDs may be decimal or `0x`-prefixed hex.

use thiserror::Error;

use super::event::{OpKind, OperationEvent};

/// Errors that can occur while parsing a capture record.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected 6 fields, got {got}")]
    FieldCount { got: usize },

    #[error("invalid {field}: {raw:?}")]
    InvalidNumber { field: &'static str, raw: String },

    #[error("unknown operation kind: {raw:?}")]
    UnknownOpKind { raw: String },
}

/// Parses one capture line.
///
/// Returns `Ok(None)` for blank lines and `#` comments.
pub fn parse_line(line: &str) -> Result<Option<OperationEvent>, ParseError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    let [pool, dataset, kind, bytes, start, end] = fields.as_slice() else {
        return Err(ParseError::FieldCount { got: fields.len() });
    };

    let kind = OpKind::from_name(kind).ok_or_else(|| ParseError::UnknownOpKind {
        raw: (*kind).to_string(),
    })?;

    Ok(Some(OperationEvent {
        pool_guid: parse_guid("pool_guid", pool)?,
        dataset_guid: parse_guid("dataset_guid", dataset)?,
        kind,
        bytes: parse_u64("bytes", bytes)?,
        start_ns: parse_u64("start_ns", start)?,
        end_ns: parse_u64("end_ns", end)?,
    }))
}

fn parse_guid(field: &'static str, raw: &str) -> Result<u64, ParseError> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    };
    parsed.map_err(|_| ParseError::InvalidNumber {
        field,
        raw: raw.to_string(),
    })
}

fn parse_u64(field: &'static str, raw: &str) -> Result<u64, ParseError> {
    raw.parse::<u64>().map_err(|_| ParseError::InvalidNumber {
        field,
        raw: raw.to_string(),
    })
}
