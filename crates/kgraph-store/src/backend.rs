//! The storage backend contract shared by every persistence variant.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use kgraph_core::{BackendKind, Direction, Entity, KgError, Relation, Result, WriteMode};

static SAFE_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").expect("static regex is valid"));

/// Where a backend call is routed. Built by the tenant isolation layer.
///
/// Shared-schema scopes carry a tenant filter that backends must inject into
/// every predicate and insert. Namespaced scopes route to the tenant's own
/// tables and carry no filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    tenant_id: String,
    namespace: Option<String>,
}

impl Scope {
    pub fn shared(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            namespace: None,
        }
    }

    pub fn namespaced(tenant_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            namespace: Some(namespace.into()),
        }
    }

    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The `tenant_id` value to inject, if this scope uses shared tables.
    #[must_use]
    pub fn tenant_filter(&self) -> Option<&str> {
        match self.namespace {
            None => Some(&self.tenant_id),
            Some(_) => None,
        }
    }

    /// Key identifying the physical partition this scope reads and writes.
    #[must_use]
    pub fn partition_key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("ns/{ns}"),
            None => format!("shared/{}", self.tenant_id),
        }
    }
}

/// Exact-match entity lookup. Results are ordered by ascending id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl GraphQuery {
    #[must_use]
    pub fn by_type(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `entity` satisfies the type, id and property predicates.
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        if let Some(ref t) = self.entity_type {
            if &entity.entity_type != t {
                return false;
            }
        }
        if let Some(ref ids) = self.ids {
            if !ids.iter().any(|id| id == &entity.id) {
                return false;
            }
        }
        self.properties
            .iter()
            .all(|(k, v)| entity.properties.get(k) == Some(v))
    }

    /// Reject property keys that cannot be expressed as a JSON path.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for keys containing quotes or control characters.
    pub fn validate(&self) -> Result<()> {
        for key in self.properties.keys() {
            if key.is_empty() || key.contains('"') || key.chars().any(char::is_control) {
                return Err(KgError::validation(
                    "properties",
                    format!("unsupported property key {key:?}"),
                ));
            }
        }
        Ok(())
    }
}

/// An entity reached from a start node, with its hop distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub entity: Entity,
    pub depth: u32,
    /// Relation through which the entity was first reached.
    pub via: String,
}

/// Cardinality statistics feeding the optimizer and the index advisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relation_count: usize,
    pub entities_by_type: BTreeMap<String, usize>,
    pub relations_by_type: BTreeMap<String, usize>,
}

impl GraphStats {
    #[must_use]
    pub fn avg_out_degree(&self) -> f64 {
        if self.entity_count == 0 {
            0.0
        } else {
            self.relation_count as f64 / self.entity_count as f64
        }
    }

    /// Fraction of entities having `entity_type`.
    #[must_use]
    pub fn type_selectivity(&self, entity_type: &str) -> f64 {
        if self.entity_count == 0 {
            return 1.0;
        }
        let n = self.entities_by_type.get(entity_type).copied().unwrap_or(0);
        n as f64 / self.entity_count as f64
    }

    /// Fraction of relations having `relation_type`.
    #[must_use]
    pub fn relation_selectivity(&self, relation_type: &str) -> f64 {
        if self.relation_count == 0 {
            return 1.0;
        }
        let n = self.relations_by_type.get(relation_type).copied().unwrap_or(0);
        n as f64 / self.relation_count as f64
    }
}

/// Table an index lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexTable {
    Entities,
    Relations,
}

/// One indexed key: a plain column or a JSON property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum IndexColumn {
    Column(String),
    Property(String),
}

/// A logical index. The tenant column is implied for shared-schema tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub table: IndexTable,
    pub columns: Vec<IndexColumn>,
}

impl IndexDefinition {
    /// Check that names and keys are safe to splice into DDL.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for unsafe identifiers or unknown columns.
    pub fn validate(&self) -> Result<()> {
        if !SAFE_IDENT.is_match(&self.name) {
            return Err(KgError::validation("index.name", format!("unsafe index name {:?}", self.name)));
        }
        if self.columns.is_empty() {
            return Err(KgError::validation("index.columns", "an index needs at least one column"));
        }
        let allowed: &[&str] = match self.table {
            IndexTable::Entities => &["id", "entity_type", "created_at", "updated_at"],
            IndexTable::Relations => &[
                "id",
                "relation_type",
                "source_id",
                "target_id",
                "weight",
                "created_at",
                "updated_at",
            ],
        };
        for column in &self.columns {
            match column {
                IndexColumn::Column(c) if !allowed.contains(&c.as_str()) => {
                    return Err(KgError::validation("index.columns", format!("unknown column {c:?}")));
                }
                IndexColumn::Property(p) if !SAFE_IDENT.is_match(p) => {
                    return Err(KgError::validation(
                        "index.columns",
                        format!("unsafe property key {p:?}"),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Render `CREATE INDEX` DDL against a physical table.
    #[must_use]
    pub fn to_sql(&self, physical_name: &str, table: &str, with_tenant: bool) -> String {
        let mut cols: Vec<String> = Vec::with_capacity(self.columns.len() + 1);
        if with_tenant {
            cols.push("tenant_id".to_string());
        }
        for column in &self.columns {
            cols.push(match column {
                IndexColumn::Column(c) => c.clone(),
                IndexColumn::Property(p) => format!("json_extract(properties, '$.\"{p}\"')"),
            });
        }
        format!(
            "CREATE INDEX IF NOT EXISTS {physical_name} ON {table}({})",
            cols.join(", ")
        )
    }
}

/// An index that exists in a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub definition: IndexDefinition,
    /// Created with the tables rather than through `create_index`.
    pub builtin: bool,
    pub primary: bool,
}

/// Indexes every backend provides without being asked.
///
/// The tenant-only index of shared tables has no columns of its own.
#[must_use]
pub fn builtin_indexes() -> Vec<IndexInfo> {
    fn def(name: &str, table: IndexTable, columns: &[&str], primary: bool) -> IndexInfo {
        IndexInfo {
            definition: IndexDefinition {
                name: name.to_string(),
                table,
                columns: columns.iter().map(|c| IndexColumn::Column((*c).to_string())).collect(),
            },
            builtin: true,
            primary,
        }
    }
    vec![
        def("graph_entities_pkey", IndexTable::Entities, &["id"], true),
        def("graph_relations_pkey", IndexTable::Relations, &["id"], true),
        def("idx_graph_entities_tenant", IndexTable::Entities, &[], false),
        def("idx_graph_entities_tenant_type", IndexTable::Entities, &["entity_type"], false),
        def("idx_graph_relations_tenant_source", IndexTable::Relations, &["source_id"], false),
        def("idx_graph_relations_tenant_target", IndexTable::Relations, &["target_id"], false),
    ]
}

/// The pluggable persistence contract.
///
/// Single-item operations are atomic. Batch operations are atomic per call;
/// callers chunk large batches, so atomicity is per chunk, not global.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create the tables of a separate-schema namespace. Idempotent.
    async fn provision_namespace(&self, namespace: &str) -> Result<()>;

    async fn namespace_exists(&self, namespace: &str) -> Result<bool>;

    async fn add_entity(&self, scope: &Scope, entity: Entity, mode: WriteMode) -> Result<Entity>;

    async fn get_entity(&self, scope: &Scope, id: &str) -> Result<Entity>;

    /// Fetch the entities that exist among `ids`, ordered by id.
    async fn get_entities(&self, scope: &Scope, ids: &[String]) -> Result<Vec<Entity>>;

    /// Delete an entity and every relation touching it.
    async fn delete_entity(&self, scope: &Scope, id: &str) -> Result<()>;

    async fn add_relation(&self, scope: &Scope, relation: Relation, mode: WriteMode) -> Result<Relation>;

    async fn get_relation(&self, scope: &Scope, id: &str) -> Result<Relation>;

    async fn delete_relation(&self, scope: &Scope, id: &str) -> Result<()>;

    /// Write all entities or none.
    async fn batch_add_entities(&self, scope: &Scope, entities: Vec<Entity>, mode: WriteMode) -> Result<usize>;

    /// Write all relations or none.
    async fn batch_add_relations(&self, scope: &Scope, relations: Vec<Relation>, mode: WriteMode)
        -> Result<usize>;

    /// Delete the existing entities among `ids`; returns how many were removed.
    async fn batch_delete_entities(&self, scope: &Scope, ids: &[String]) -> Result<usize>;

    async fn query(&self, scope: &Scope, query: &GraphQuery) -> Result<Vec<Entity>>;

    /// Relations touching any of `ids` in `direction`, deduplicated, ordered by id.
    async fn relations_for(&self, scope: &Scope, ids: &[String], direction: Direction) -> Result<Vec<Relation>>;

    /// Top-`k` entities by cosine similarity, best first, ties by id.
    async fn vector_search(
        &self,
        scope: &Scope,
        embedding: &[f32],
        k: usize,
        entity_type: Option<&str>,
    ) -> Result<Vec<(Entity, f32)>>;

    async fn stats(&self, scope: &Scope) -> Result<GraphStats>;

    async fn list_indexes(&self, scope: &Scope) -> Result<Vec<IndexInfo>>;

    async fn create_index(&self, scope: &Scope, definition: &IndexDefinition) -> Result<()>;

    /// Entities within `max_depth` hops of `id`, excluding `id` itself,
    /// ordered by depth then id. Relations to missing entities are skipped.
    async fn get_neighbors(
        &self,
        scope: &Scope,
        id: &str,
        max_depth: u32,
        direction: Direction,
    ) -> Result<Vec<Neighbor>> {
        self.get_entity(scope, id).await?;

        let mut reached: HashMap<String, (u32, String)> = HashMap::new();
        let mut frontier: Vec<String> = vec![id.to_string()];

        for depth in 1..=max_depth {
            if frontier.is_empty() {
                break;
            }
            let relations = self.relations_for(scope, &frontier, direction).await?;
            let frontier_set: HashSet<&str> = frontier.iter().map(String::as_str).collect();
            let mut next: BTreeSet<String> = BTreeSet::new();
            for rel in &relations {
                for from in [rel.source_id.as_str(), rel.target_id.as_str()] {
                    if !frontier_set.contains(from) {
                        continue;
                    }
                    if let Some(to) = direction.step(rel, from) {
                        if to != id && !reached.contains_key(to) {
                            reached.insert(to.to_string(), (depth, rel.id.clone()));
                            next.insert(to.to_string());
                        }
                    }
                }
            }
            frontier = next.into_iter().collect();
        }

        let ids: Vec<String> = reached.keys().cloned().collect();
        let mut neighbors: Vec<Neighbor> = self
            .get_entities(scope, &ids)
            .await?
            .into_iter()
            .filter_map(|entity| {
                let (depth, via) = reached.remove(&entity.id)?;
                Some(Neighbor { entity, depth, via })
            })
            .collect();
        neighbors.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.entity.id.cmp(&b.entity.id)));
        Ok(neighbors)
    }
}

/// Sort `(entity, score)` pairs best first with ascending-id tie breaks and keep `k`.
pub(crate) fn rank_top_k(mut scored: Vec<(Entity, f32)>, k: usize) -> Vec<(Entity, f32)> {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_filter_only_for_shared_tables() {
        assert_eq!(Scope::shared("acme").tenant_filter(), Some("acme"));
        assert_eq!(Scope::namespaced("acme", "tenant_acme").tenant_filter(), None);
        assert_ne!(
            Scope::shared("acme").partition_key(),
            Scope::namespaced("acme", "tenant_acme").partition_key()
        );
    }

    #[test]
    fn graph_query_matches_type_and_properties() {
        let alice = Entity::new("alice", "Person").with_property("city", "Oslo");
        assert!(GraphQuery::by_type("Person").matches(&alice));
        assert!(!GraphQuery::by_type("Company").matches(&alice));
        assert!(GraphQuery::by_type("Person")
            .with_property("city", "Oslo")
            .matches(&alice));
        assert!(!GraphQuery::default().with_property("city", "Bergen").matches(&alice));
    }

    #[test]
    fn graph_query_rejects_quoted_keys() {
        let q = GraphQuery::default().with_property("a\"b", 1);
        assert!(q.validate().is_err());
    }

    #[test]
    fn index_definition_renders_tenant_prefixed_sql() {
        let def = IndexDefinition {
            name: "idx_graph_entities_prop_email".into(),
            table: IndexTable::Entities,
            columns: vec![IndexColumn::Property("email".into())],
        };
        def.validate().unwrap();
        let sql = def.to_sql("idx_graph_entities_prop_email", "graph_entities", true);
        assert_eq!(
            sql,
            "CREATE INDEX IF NOT EXISTS idx_graph_entities_prop_email ON graph_entities(tenant_id, json_extract(properties, '$.\"email\"'))"
        );
    }

    #[test]
    fn index_definition_rejects_injection() {
        let def = IndexDefinition {
            name: "x; DROP TABLE graph_entities".into(),
            table: IndexTable::Entities,
            columns: vec![IndexColumn::Column("entity_type".into())],
        };
        assert!(def.validate().is_err());

        let def = IndexDefinition {
            name: "ok".into(),
            table: IndexTable::Relations,
            columns: vec![IndexColumn::Column("properties') --".into())],
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn stats_selectivity() {
        let mut stats = GraphStats {
            entity_count: 10,
            relation_count: 20,
            ..GraphStats::default()
        };
        stats.entities_by_type.insert("Person".into(), 2);
        assert!((stats.type_selectivity("Person") - 0.2).abs() < 1e-9);
        assert_eq!(stats.type_selectivity("Robot"), 0.0);
        assert!((stats.avg_out_degree() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn rank_top_k_breaks_ties_by_id() {
        let scored = vec![
            (Entity::new("b", "T"), 0.5),
            (Entity::new("a", "T"), 0.5),
            (Entity::new("c", "T"), 0.9),
        ];
        let ranked = rank_top_k(scored, 2);
        let ids: Vec<&str> = ranked.iter().map(|(e, _)| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }
}
