//! Source readers: CSV and the three JSON layouts.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kgraph_core::{KgError, Result};

use crate::transform::Row;

/// Input layout. `Auto` picks by extension, then by content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    #[default]
    Auto,
    Csv,
    /// A top-level array, or an object holding the rows under one key.
    Json,
    JsonLines,
}

/// One source record. `line` is 1-based and counts data rows only.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub line: usize,
    pub row: std::result::Result<Row, String>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceData {
    /// Columns in first-seen order.
    pub headers: Vec<String>,
    pub records: Vec<SourceRecord>,
}

impl SourceData {
    /// Wrap rows that are already parsed.
    #[must_use]
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut data = Self::default();
        for (i, row) in rows.into_iter().enumerate() {
            data.note_headers(&row);
            data.records.push(SourceRecord { line: i + 1, row: Ok(row) });
        }
        data
    }

    fn note_headers(&mut self, row: &Row) {
        for key in row.keys() {
            if !self.headers.contains(key) {
                self.headers.push(key.clone());
            }
        }
    }
}

/// Read a file.
///
/// # Errors
///
/// I/O errors, or a document that cannot be parsed at all. Bad individual
/// rows become failed records instead.
pub async fn read_path(path: &Path, format: InputFormat, array_key: Option<&str>) -> Result<SourceData> {
    let text = tokio::fs::read_to_string(path).await?;
    let format = match format {
        InputFormat::Auto => match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => InputFormat::Csv,
            Some("jsonl" | "ndjson") => InputFormat::JsonLines,
            _ => InputFormat::Auto,
        },
        other => other,
    };
    read_str(&text, format, array_key)
}

/// Parse in-memory text.
///
/// # Errors
///
/// See [`read_path`].
pub fn read_str(text: &str, format: InputFormat, array_key: Option<&str>) -> Result<SourceData> {
    match format {
        InputFormat::Csv => read_csv(text),
        InputFormat::Json => read_json(text, array_key),
        InputFormat::JsonLines => Ok(read_json_lines(text)),
        InputFormat::Auto => match text.trim_start().chars().next() {
            Some('[') => read_json(text, array_key),
            Some('{') => match serde_json::from_str::<Value>(text) {
                Ok(value) if value.as_object().is_some_and(|m| m.values().any(Value::is_array)) => {
                    rows_from_document(value, array_key)
                }
                _ => Ok(read_json_lines(text)),
            },
            _ => read_csv(text),
        },
    }
}

fn read_csv(text: &str) -> Result<SourceData> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| KgError::validation("source", format!("unreadable csv header: {e}")))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.iter().all(String::is_empty) {
        return Err(KgError::validation("source", "csv header row is required"));
    }

    let mut data = SourceData {
        headers: headers.clone(),
        records: Vec::new(),
    };
    for (i, record) in reader.records().enumerate() {
        let row = record.map_err(|e| e.to_string()).map(|record| {
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.clone(), Value::String(v.to_string())))
                .collect::<Row>()
        });
        data.records.push(SourceRecord { line: i + 1, row });
    }
    Ok(data)
}

fn read_json(text: &str, array_key: Option<&str>) -> Result<SourceData> {
    let value: Value = serde_json::from_str(text)?;
    rows_from_document(value, array_key)
}

/// Rows from an array, or from the array under `array_key` (or the only
/// array-valued key when none is given).
fn rows_from_document(value: Value, array_key: Option<&str>) -> Result<SourceData> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let key = match array_key {
                Some(k) => k.to_string(),
                None => {
                    let mut arrays = map.iter().filter(|(_, v)| v.is_array()).map(|(k, _)| k.clone());
                    match (arrays.next(), arrays.next()) {
                        (Some(k), None) => k,
                        (None, _) => return Err(KgError::validation("source", "json object holds no array of rows")),
                        (Some(_), Some(_)) => {
                            return Err(KgError::validation("array_key", "several arrays found; name one with array_key"))
                        }
                    }
                }
            };
            match map.remove(&key) {
                Some(Value::Array(items)) => items,
                _ => return Err(KgError::validation("array_key", format!("'{key}' is not an array"))),
            }
        }
        _ => return Err(KgError::validation("source", "json rows must be an array or an object")),
    };

    let mut data = SourceData::default();
    for (i, item) in items.into_iter().enumerate() {
        let row = match item {
            Value::Object(row) => {
                data.note_headers(&row);
                Ok(row)
            }
            other => Err(format!("expected an object, found {other}")),
        };
        data.records.push(SourceRecord { line: i + 1, row });
    }
    Ok(data)
}

fn read_json_lines(text: &str) -> SourceData {
    let mut data = SourceData::default();
    for (i, line) in text.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        let row = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(row)) => {
                data.note_headers(&row);
                Ok(row)
            }
            Ok(other) => Err(format!("expected an object, found {other}")),
            Err(e) => Err(e.to_string()),
        };
        data.records.push(SourceRecord { line: i + 1, row });
    }
    data
}
