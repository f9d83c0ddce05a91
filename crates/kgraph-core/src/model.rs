//! Entity and relation types for the property-graph data model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KgError, Result};

/// Key-ordered property map attached to entities and relations.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// A typed node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    // === Identity ===
    /// Caller-chosen identifier, unique within a tenant.
    pub id: String,
    pub entity_type: String,

    // === Payload ===
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    // === System temporal ===
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create an entity with no properties, stamped with the current time.
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            properties: Properties::new(),
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Check structural invariants. `dimension` is the expected embedding length.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] naming the offending field.
    pub fn validate(&self, dimension: usize) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(KgError::validation("id", "entity id must not be empty"));
        }
        if self.entity_type.trim().is_empty() {
            return Err(KgError::validation(
                "entity_type",
                format!("entity '{}' has an empty entity_type", self.id),
            ));
        }
        if let Some(ref embedding) = self.embedding {
            if embedding.len() != dimension {
                return Err(KgError::validation(
                    "embedding",
                    format!(
                        "entity '{}' has a {}-dimensional embedding, expected {dimension}",
                        self.id,
                        embedding.len()
                    ),
                ));
            }
            if embedding.iter().any(|v| !v.is_finite()) {
                return Err(KgError::validation(
                    "embedding",
                    format!("entity '{}' has a non-finite embedding component", self.id),
                ));
            }
        }
        Ok(())
    }

    /// Text used for lexical matching: type plus every scalar property value.
    #[must_use]
    pub fn searchable_text(&self) -> String {
        let mut text = self.entity_type.clone();
        for value in self.properties.values() {
            match value {
                serde_json::Value::String(s) => {
                    text.push(' ');
                    text.push_str(s);
                }
                serde_json::Value::Number(n) => {
                    text.push(' ');
                    text.push_str(&n.to_string());
                }
                serde_json::Value::Array(items) => {
                    for item in items.iter().filter_map(|i| i.as_str()) {
                        text.push(' ');
                        text.push_str(item);
                    }
                }
                _ => {}
            }
        }
        text
    }
}

fn default_weight() -> f64 {
    1.0
}

/// A typed, directed, weighted edge between two entities of the same tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub relation_type: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Relation {
    /// Create a relation with default weight 1.0.
    pub fn new(
        id: impl Into<String>,
        relation_type: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            relation_type: relation_type.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            properties: Properties::new(),
            weight: default_weight(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Deterministic id for an edge: `source:relation_type:target`.
    #[must_use]
    pub fn derive_id(source_id: &str, relation_type: &str, target_id: &str) -> String {
        format!("{source_id}:{relation_type}:{target_id}")
    }

    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Check structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("id", &self.id),
            ("relation_type", &self.relation_type),
            ("source_id", &self.source_id),
            ("target_id", &self.target_id),
        ] {
            if value.trim().is_empty() {
                return Err(KgError::validation(
                    field,
                    format!("relation '{}' has an empty {field}", self.id),
                ));
            }
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(KgError::validation(
                "weight",
                format!("relation '{}' has invalid weight {}", self.id, self.weight),
            ));
        }
        Ok(())
    }

    /// The endpoint on the other side of `id`, if this relation touches it.
    #[must_use]
    pub fn other_end(&self, id: &str) -> Option<&str> {
        if self.source_id == id {
            Some(&self.target_id)
        } else if self.target_id == id {
            Some(&self.source_id)
        } else {
            None
        }
    }
}

/// Whether an existing id is rejected or replaced on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Duplicate ids are a conflict.
    #[default]
    Insert,
    /// Replace the stored item, keeping its `created_at`.
    Upsert,
}

/// Edge direction used by traversals and adjacency lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

impl Direction {
    /// Neighbours of `id` reachable through `relation` in this direction.
    #[must_use]
    pub fn step<'a>(&self, relation: &'a Relation, id: &str) -> Option<&'a str> {
        match self {
            Self::Outgoing if relation.source_id == id => Some(&relation.target_id),
            Self::Incoming if relation.target_id == id => Some(&relation.source_id),
            Self::Both => relation.other_end(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_serialization_roundtrip() {
        let entity = Entity::new("alice", "Person")
            .with_property("name", "Alice")
            .with_property("age", 34)
            .with_embedding(vec![0.1, 0.2]);

        let json = serde_json::to_string(&entity).expect("serialize");
        let back: Entity = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(entity, back);
    }

    #[test]
    fn entity_rejects_wrong_embedding_dimension() {
        let entity = Entity::new("alice", "Person").with_embedding(vec![0.0; 3]);
        assert!(entity.validate(3).is_ok());
        let err = entity.validate(4).unwrap_err();
        assert!(err.to_string().contains("embedding"));
    }

    #[test]
    fn entity_rejects_empty_id() {
        assert!(Entity::new("  ", "Person").validate(8).is_err());
        assert!(Entity::new("x", "").validate(8).is_err());
    }

    #[test]
    fn relation_defaults_weight_when_missing() {
        let rel: Relation = serde_json::from_str(
            r#"{"id":"r1","relation_type":"KNOWS","source_id":"a","target_id":"b"}"#,
        )
        .unwrap();
        assert!((rel.weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn relation_rejects_negative_weight() {
        let rel = Relation::new("r1", "KNOWS", "a", "b").with_weight(-1.0);
        assert!(rel.validate().is_err());
    }

    #[test]
    fn self_loop_is_valid() {
        let rel = Relation::new("r1", "KNOWS", "a", "a");
        assert!(rel.validate().is_ok());
        assert_eq!(Direction::Both.step(&rel, "a"), Some("a"));
    }

    #[test]
    fn direction_step_follows_edge_orientation() {
        let rel = Relation::new("r1", "WORKS_FOR", "alice", "acme");
        assert_eq!(Direction::Outgoing.step(&rel, "alice"), Some("acme"));
        assert_eq!(Direction::Outgoing.step(&rel, "acme"), None);
        assert_eq!(Direction::Incoming.step(&rel, "acme"), Some("alice"));
        assert_eq!(Direction::Both.step(&rel, "acme"), Some("alice"));
    }

    #[test]
    fn searchable_text_includes_scalar_properties() {
        let entity = Entity::new("alice", "Person")
            .with_property("name", "Alice Smith")
            .with_property("skills", serde_json::json!(["rust", "sql"]));
        let text = entity.searchable_text();
        assert!(text.contains("Person"));
        assert!(text.contains("Alice Smith"));
        assert!(text.contains("rust"));
    }
}
