//! Schema mappings: how source columns become entities and relations.
//!
//! A mapping file is JSON or TOML:
//!
//! ```toml
//! [[entities]]
//! entity_type = "Person"
//! id_column = "id"
//! source_columns = ["id", "name", "age"]
//! transformations = [{ op = "cast", column = "age", to = "integer" }]
//!
//! [[relations]]
//! relation_type = "WORKS_FOR"
//! source_entity_column = "id"
//! target_entity_column = "company"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kgraph_core::{Entity, KgError, Relation, Result};

use crate::transform::{apply_all, display, is_blank, Row, Transformation};

/// Builds one entity per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMapping {
    pub entity_type: String,
    pub id_column: String,
    /// Columns copied into properties when `property_mapping` is empty.
    #[serde(default)]
    pub source_columns: Vec<String>,
    /// Column -> property name.
    #[serde(default)]
    pub property_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
    /// Column holding a JSON array of floats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_column: Option<String>,
}

/// Builds one relation per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationMapping {
    pub relation_type: String,
    pub source_entity_column: String,
    pub target_entity_column: String,
    /// Ids default to `source:relation_type:target`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_column: Option<String>,
    #[serde(default)]
    pub source_columns: Vec<String>,
    #[serde(default)]
    pub property_mapping: BTreeMap<String, String>,
}

/// Ordered entity and relation mappings for one import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaMapping {
    #[serde(default)]
    pub entities: Vec<EntityMapping>,
    #[serde(default)]
    pub relations: Vec<RelationMapping>,
}

/// Entities and relations built from one row.
#[derive(Debug, Clone, Default)]
pub struct RowOutput {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

impl SchemaMapping {
    /// # Errors
    ///
    /// Returns [`KgError::Serialization`] for malformed JSON.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// # Errors
    ///
    /// Returns [`KgError::Serialization`] for malformed TOML.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| KgError::Serialization(e.to_string()))
    }

    /// Load and validate a mapping file, choosing the parser by extension.
    ///
    /// # Errors
    ///
    /// I/O, parse or validation errors.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mapping = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text)?,
            _ => Self::from_json_str(&text)?,
        };
        mapping.validate()?;
        Ok(mapping)
    }

    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for empty mappings or blank names.
    pub fn validate(&self) -> Result<()> {
        if self.entities.is_empty() && self.relations.is_empty() {
            return Err(KgError::validation("mapping", "at least one entity or relation mapping is required"));
        }
        for m in &self.entities {
            if m.entity_type.trim().is_empty() {
                return Err(KgError::validation("entity_type", "must not be empty"));
            }
            if m.id_column.trim().is_empty() {
                return Err(KgError::validation("id_column", "must not be empty"));
            }
            for t in &m.transformations {
                t.validate()?;
            }
        }
        for m in &self.relations {
            if m.relation_type.trim().is_empty() {
                return Err(KgError::validation("relation_type", "must not be empty"));
            }
            if m.source_entity_column.trim().is_empty() || m.target_entity_column.trim().is_empty() {
                return Err(KgError::validation("relations", "endpoint columns must not be empty"));
            }
        }
        Ok(())
    }

    /// Columns the mapping reads from the source, minus those produced by
    /// transformations.
    #[must_use]
    pub fn required_columns(&self) -> BTreeSet<String> {
        let mut produced = BTreeSet::new();
        let mut read = BTreeSet::new();
        for m in &self.entities {
            for t in &m.transformations {
                match t {
                    Transformation::Rename { from, to } => {
                        read.insert(from.clone());
                        produced.insert(to.clone());
                    }
                    Transformation::Derive { column, .. } | Transformation::Default { column, .. } => {
                        produced.insert(column.clone());
                    }
                    _ => {}
                }
            }
            read.insert(m.id_column.clone());
            read.extend(m.source_columns.iter().cloned());
            read.extend(m.property_mapping.keys().cloned());
            read.extend(m.embedding_column.iter().cloned());
        }
        for m in &self.relations {
            read.insert(m.source_entity_column.clone());
            read.insert(m.target_entity_column.clone());
            read.extend(m.id_column.iter().cloned());
            read.extend(m.weight_column.iter().cloned());
            read.extend(m.source_columns.iter().cloned());
            read.extend(m.property_mapping.keys().cloned());
        }
        read.difference(&produced).cloned().collect()
    }

    /// Build everything one row maps to. Fails as a unit.
    ///
    /// # Errors
    ///
    /// Transformation failures, missing ids or endpoints, bad weights or
    /// embeddings.
    pub fn build_row(&self, row: &Row) -> Result<RowOutput> {
        let mut out = RowOutput::default();
        for m in &self.entities {
            out.entities.push(m.build(row)?);
        }
        for m in &self.relations {
            out.relations.push(m.build(row)?);
        }
        Ok(out)
    }
}

fn required(row: &Row, column: &str) -> Result<String> {
    match row.get(column) {
        Some(v) if !is_blank(v) => Ok(display(v).trim().to_string()),
        _ => Err(KgError::validation(column, "value is missing")),
    }
}

fn copy_properties(row: &Row, columns: &[String], mapping: &BTreeMap<String, String>, skip: &[&str]) -> BTreeMap<String, Value> {
    let mut properties = BTreeMap::new();
    if mapping.is_empty() {
        for column in columns.iter().filter(|c| !skip.contains(&c.as_str())) {
            if let Some(v) = row.get(column).filter(|v| !v.is_null()) {
                properties.insert(column.clone(), v.clone());
            }
        }
    } else {
        for (column, property) in mapping {
            if let Some(v) = row.get(column).filter(|v| !v.is_null()) {
                properties.insert(property.clone(), v.clone());
            }
        }
    }
    properties
}

impl EntityMapping {
    fn build(&self, source: &Row) -> Result<Entity> {
        let mut row = source.clone();
        apply_all(&self.transformations, &mut row)?;
        let id = required(&row, &self.id_column)?;
        let mut entity = Entity::new(id, self.entity_type.clone());
        entity.properties = copy_properties(&row, &self.source_columns, &self.property_mapping, &[self.id_column.as_str()]);
        if let Some(column) = &self.embedding_column {
            if let Some(value) = row.get(column).filter(|v| !is_blank(v)) {
                entity.embedding = Some(parse_embedding(column, value)?);
            }
        }
        Ok(entity)
    }
}

fn parse_embedding(column: &str, value: &Value) -> Result<Vec<f32>> {
    let parsed: Value = match value {
        Value::String(s) => serde_json::from_str(s).map_err(|e| KgError::validation(column, e.to_string()))?,
        other => other.clone(),
    };
    let items = parsed
        .as_array()
        .ok_or_else(|| KgError::validation(column, "embedding must be an array of numbers"))?;
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| KgError::validation(column, "embedding must be an array of numbers"))
        })
        .collect()
}

impl RelationMapping {
    fn build(&self, row: &Row) -> Result<Relation> {
        let source = required(row, &self.source_entity_column)?;
        let target = required(row, &self.target_entity_column)?;
        let id = match &self.id_column {
            Some(column) => required(row, column)?,
            None => Relation::derive_id(&source, &self.relation_type, &target),
        };
        let mut relation = Relation::new(id, self.relation_type.clone(), source, target);
        if let Some(column) = &self.weight_column {
            if let Some(value) = row.get(column).filter(|v| !is_blank(v)) {
                let weight = display(value)
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| KgError::validation(column.as_str(), format!("weight '{}' is not a number", display(value))))?;
                relation = relation.with_weight(weight);
            }
        }
        let skip = [self.source_entity_column.as_str(), self.target_entity_column.as_str()];
        relation.properties = copy_properties(row, &self.source_columns, &self.property_mapping, &skip);
        Ok(relation)
    }
}
