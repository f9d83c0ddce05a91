//! Per-row column transformations applied before entity construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kgraph_core::{KgError, Result};

/// One source row: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// Target type of a [`Transformation::Cast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastType {
    Integer,
    Float,
    Boolean,
    String,
}

/// A column transformation. Applied in the order listed in the mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transformation {
    Cast { column: String, to: CastType },
    Rename { from: String, to: String },
    /// Build `column` from a template such as `"{first} {last}"`.
    Derive { column: String, template: String },
    Trim { column: String },
    Lowercase { column: String },
    /// Fill `column` when it is missing, null or empty.
    Default { column: String, value: Value },
}

impl Transformation {
    /// Column this transformation writes.
    #[must_use]
    pub fn output_column(&self) -> &str {
        match self {
            Self::Rename { to, .. } => to,
            Self::Cast { column, .. }
            | Self::Derive { column, .. }
            | Self::Trim { column }
            | Self::Lowercase { column }
            | Self::Default { column, .. } => column,
        }
    }

    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for empty column names or templates
    /// with unbalanced braces.
    pub fn validate(&self) -> Result<()> {
        if self.output_column().is_empty() {
            return Err(KgError::validation("transformations", "column name must not be empty"));
        }
        if let Self::Rename { from, .. } = self {
            if from.is_empty() {
                return Err(KgError::validation("transformations", "rename source must not be empty"));
            }
        }
        if let Self::Derive { template, .. } = self {
            template_columns(template)?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`KgError::Validation`] naming the column when a value cannot
    /// be cast or a template references a missing column.
    pub fn apply(&self, row: &mut Row) -> Result<()> {
        match self {
            Self::Cast { column, to } => {
                if let Some(value) = row.get(column) {
                    let cast = cast(value, *to).map_err(|message| KgError::validation(column.as_str(), message))?;
                    row.insert(column.clone(), cast);
                }
            }
            Self::Rename { from, to } => {
                if let Some(value) = row.remove(from) {
                    row.insert(to.clone(), value);
                }
            }
            Self::Derive { column, template } => {
                let value = render(template, row).map_err(|message| KgError::validation(column.as_str(), message))?;
                row.insert(column.clone(), Value::String(value));
            }
            Self::Trim { column } => {
                if let Some(Value::String(s)) = row.get_mut(column) {
                    *s = s.trim().to_string();
                }
            }
            Self::Lowercase { column } => {
                if let Some(Value::String(s)) = row.get_mut(column) {
                    *s = s.to_lowercase();
                }
            }
            Self::Default { column, value } => {
                if row.get(column).is_none_or(is_blank) {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
        Ok(())
    }
}

/// Apply every transformation in order.
///
/// # Errors
///
/// Stops at the first failing transformation.
pub fn apply_all(transformations: &[Transformation], row: &mut Row) -> Result<()> {
    for t in transformations {
        t.apply(row)?;
    }
    Ok(())
}

/// Null or an empty string.
#[must_use]
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Render a scalar for ids and templates. Objects and arrays are JSON.
#[must_use]
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn cast(value: &Value, to: CastType) -> std::result::Result<Value, String> {
    if is_blank(value) {
        return Ok(Value::Null);
    }
    let text = display(value);
    let trimmed = text.trim();
    match to {
        CastType::String => Ok(Value::String(text)),
        CastType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            _ => trimmed
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("cannot cast '{text}' to integer")),
        },
        CastType::Float => trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("cannot cast '{text}' to float")),
        CastType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "n" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("cannot cast '{text}' to boolean")),
        },
    }
}

/// Columns referenced by `{name}` placeholders.
fn template_columns(template: &str) -> Result<Vec<&str>> {
    let mut columns = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| KgError::validation("template", format!("unclosed '{{' in '{template}'")))?;
        let name = &after[..close];
        if name.is_empty() || name.contains('{') {
            return Err(KgError::validation("template", format!("bad placeholder in '{template}'")));
        }
        columns.push(name);
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return Err(KgError::validation("template", format!("unmatched '}}' in '{template}'")));
    }
    Ok(columns)
}

fn render(template: &str, row: &Row) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            return Err(format!("unclosed '{{' in '{template}'"));
        };
        let name = &after[..close];
        let value = row.get(name).ok_or_else(|| format!("template column '{name}' is missing"))?;
        out.push_str(&display(value));
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    #[test]
    fn cast_variants() {
        let mut r = row(json!({"age": " 42 ", "score": "3.5", "active": "Yes", "zip": 1234, "blank": ""}));
        for t in [
            Transformation::Cast { column: "age".into(), to: CastType::Integer },
            Transformation::Cast { column: "score".into(), to: CastType::Float },
            Transformation::Cast { column: "active".into(), to: CastType::Boolean },
            Transformation::Cast { column: "zip".into(), to: CastType::String },
            Transformation::Cast { column: "blank".into(), to: CastType::Integer },
        ] {
            t.apply(&mut r).unwrap();
        }
        assert_eq!(r["age"], json!(42));
        assert_eq!(r["score"], json!(3.5));
        assert_eq!(r["active"], json!(true));
        assert_eq!(r["zip"], json!("1234"));
        assert_eq!(r["blank"], Value::Null);
    }

    #[test]
    fn failed_cast_names_the_column() {
        let mut r = row(json!({"age": "forty"}));
        let err = Transformation::Cast { column: "age".into(), to: CastType::Integer }
            .apply(&mut r)
            .unwrap_err();
        assert!(err.to_string().contains("age"));
        assert!(err.to_string().contains("forty"));
    }

    #[test]
    fn rename_derive_and_text_ops_in_order() {
        let mut r = row(json!({"first": "  Ada ", "last": "Lovelace", "mail": "ADA@EXAMPLE.ORG"}));
        apply_all(
            &[
                Transformation::Trim { column: "first".into() },
                Transformation::Derive {
                    column: "name".into(),
                    template: "{first} {last}".into(),
                },
                Transformation::Rename {
                    from: "mail".into(),
                    to: "email".into(),
                },
                Transformation::Lowercase { column: "email".into() },
                Transformation::Default {
                    column: "country".into(),
                    value: json!("UK"),
                },
            ],
            &mut r,
        )
        .unwrap();
        assert_eq!(r["name"], json!("Ada Lovelace"));
        assert_eq!(r["email"], json!("ada@example.org"));
        assert!(!r.contains_key("mail"));
        assert_eq!(r["country"], json!("UK"));
    }

    #[test]
    fn derive_with_missing_column_fails() {
        let mut r = row(json!({"first": "Ada"}));
        let err = Transformation::Derive {
            column: "name".into(),
            template: "{first} {middle}".into(),
        }
        .apply(&mut r)
        .unwrap_err();
        assert!(err.to_string().contains("middle"));
    }

    #[test]
    fn default_keeps_present_values() {
        let mut r = row(json!({"country": "FR"}));
        Transformation::Default {
            column: "country".into(),
            value: json!("UK"),
        }
        .apply(&mut r)
        .unwrap();
        assert_eq!(r["country"], json!("FR"));
    }

    #[test]
    fn template_validation() {
        let ok = Transformation::Derive {
            column: "x".into(),
            template: "{a}-{b}".into(),
        };
        assert!(ok.validate().is_ok());
        for bad in ["{a", "a}", "{}", "{a{b}}"] {
            let t = Transformation::Derive {
                column: "x".into(),
                template: bad.into(),
            };
            assert!(t.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn deserializes_from_tagged_json() {
        let t: Transformation = serde_json::from_value(json!({"op": "cast", "column": "age", "to": "integer"})).unwrap();
        assert_eq!(
            t,
            Transformation::Cast {
                column: "age".into(),
                to: CastType::Integer
            }
        );
    }
}
