//! Result formatting: JSON, Table, and Markdown output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use kgraph_core::Entity;

use crate::request::SearchResponse;

/// Output format for query results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Table,
    Markdown,
}

/// A single row in a query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// A complete result set with a fixed column order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
    pub total: usize,
}

impl QueryResult {
    /// One row per entity: id, type and properties as compact JSON.
    #[must_use]
    pub fn from_entities(entities: &[Entity]) -> Self {
        let rows = entities.iter().map(|e| ResultRow { fields: entity_fields(e) }).collect();
        Self {
            columns: columns(&["id", "type", "properties"]),
            rows,
            total: entities.len(),
        }
    }
}

impl From<&SearchResponse> for QueryResult {
    fn from(response: &SearchResponse) -> Self {
        let rows = response
            .hits
            .iter()
            .enumerate()
            .map(|(rank, hit)| {
                let mut fields = entity_fields(&hit.entity);
                fields.insert("rank".into(), serde_json::json!(rank + 1));
                fields.insert("score".into(), serde_json::json!(format!("{:.4}", hit.score)));
                fields.insert(
                    "depth".into(),
                    hit.depth.map_or(serde_json::Value::Null, |d| serde_json::json!(d)),
                );
                ResultRow { fields }
            })
            .collect();
        Self {
            columns: columns(&["rank", "id", "type", "score", "depth", "properties"]),
            rows,
            total: response.hits.len(),
        }
    }
}

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|c| (*c).to_string()).collect()
}

fn entity_fields(entity: &Entity) -> BTreeMap<String, serde_json::Value> {
    let mut fields = BTreeMap::new();
    fields.insert("id".to_string(), serde_json::json!(entity.id));
    fields.insert("type".to_string(), serde_json::json!(entity.entity_type));
    fields.insert(
        "properties".to_string(),
        serde_json::Value::String(serde_json::to_string(&entity.properties).unwrap_or_default()),
    );
    fields
}

/// Format a search response. JSON keeps the full response, the tabular
/// formats flatten the hits.
#[must_use]
pub fn format_search(response: &SearchResponse, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(response).unwrap_or_else(|_| "{}".to_string()),
        other => format_results(&QueryResult::from(response), other),
    }
}

/// Format query results in the specified output format.
#[must_use]
pub fn format_results(result: &QueryResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => format_json(result),
        OutputFormat::Table => format_table(result),
        OutputFormat::Markdown => format_markdown(result),
    }
}

fn format_json(result: &QueryResult) -> String {
    serde_json::to_string_pretty(result).unwrap_or_else(|_| "[]".to_string())
}

/// Rendered cells, row-major, in column order.
fn grid(result: &QueryResult) -> Vec<Vec<String>> {
    result
        .rows
        .iter()
        .map(|row| {
            result
                .columns
                .iter()
                .map(|col| row.fields.get(col).map_or_else(|| "null".to_string(), value_to_display))
                .collect()
        })
        .collect()
}

fn format_table(result: &QueryResult) -> String {
    if result.rows.is_empty() {
        return "(no results)".to_string();
    }
    let cells = grid(result);
    let widths: Vec<usize> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| cells.iter().map(|r| r[i].chars().count()).fold(c.chars().count(), usize::max))
        .collect();
    let line = |values: &[String]| -> String {
        let padded: Vec<String> = values.iter().zip(&widths).map(|(v, w)| format!("{v:w$}")).collect();
        format!("{}\n", padded.join(" | ").trim_end())
    };

    let mut output = line(result.columns.as_slice());
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    output.push_str(&rule.join("-+-"));
    output.push('\n');
    for row in &cells {
        output.push_str(&line(row.as_slice()));
    }
    output
}

fn format_markdown(result: &QueryResult) -> String {
    if result.rows.is_empty() {
        return "*No results*\n".to_string();
    }
    let line = |values: &[String]| format!("| {} |\n", values.join(" | "));

    let mut output = line(result.columns.as_slice());
    output.push_str(&line(vec!["---".to_string(); result.columns.len()].as_slice()));
    for row in grid(result) {
        let escaped: Vec<String> = row.iter().map(|c| c.replace('|', "\\|")).collect();
        output.push_str(&line(escaped.as_slice()));
    }
    output
}

fn value_to_display(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SearchHit;

    fn sample_response() -> SearchResponse {
        SearchResponse {
            strategy: "graph".into(),
            hits: vec![
                SearchHit::new(Entity::new("alice", "Person").with_property("name", "Alice"), 1.0, Some(1)),
                SearchHit::new(Entity::new("acme", "Company"), 0.5, Some(2)),
            ],
            candidates: 2,
            reranked_by: None,
        }
    }

    #[test]
    fn format_as_json() {
        let output = format_search(&sample_response(), OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["strategy"], "graph");
        assert_eq!(parsed["hits"][0]["entity"]["id"], "alice");
    }

    #[test]
    fn format_as_table_keeps_column_order() {
        let output = format_search(&sample_response(), OutputFormat::Table);
        let header = output.lines().next().unwrap();
        assert!(header.starts_with("rank | id"));
        assert!(output.contains("1.0000"));
        assert!(output.contains("-+-"));
        assert!(output.contains("\"name\":\"Alice\""));
    }

    #[test]
    fn format_as_markdown() {
        let output = format_search(&sample_response(), OutputFormat::Markdown);
        assert!(output.starts_with("| rank | id | type | score | depth | properties |\n"));
        assert!(output.contains("| --- "));
        assert!(output.contains("| 2 | acme | Company | 0.5000 | 2 | {} |"));
    }

    #[test]
    fn entities_render_without_scores() {
        let result = QueryResult::from_entities(&[Entity::new("e1", "Node")]);
        let output = format_results(&result, OutputFormat::Markdown);
        assert!(output.contains("| e1 | Node | {} |"));
        assert!(!output.contains("score"));
    }

    #[test]
    fn format_empty_result() {
        let result = QueryResult::from_entities(&[]);
        assert_eq!(format_results(&result, OutputFormat::Table), "(no results)");
        assert_eq!(format_results(&result, OutputFormat::Markdown), "*No results*\n");
    }
}
