//! Non-durable in-process backend.
//!
//! Rows are partitioned by [`Scope::partition_key`], so shared-schema tenants
//! and separate-schema namespaces never see each other's maps. Relation
//! endpoints are checked lazily: a relation may name an entity that does not
//! exist (yet), and traversals simply skip it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use kgraph_core::{
    cosine_similarity, BackendKind, Direction, Entity, ItemKind, KgError, Relation, Result, WriteMode,
};

use crate::backend::{
    builtin_indexes, rank_top_k, GraphQuery, GraphStats, IndexDefinition, IndexInfo, Scope,
    StorageBackend,
};

#[derive(Default)]
struct RelationPartition {
    relations: BTreeMap<String, Relation>,
    /// entity id -> ids of relations leaving it
    outgoing: HashMap<String, BTreeSet<String>>,
    /// entity id -> ids of relations entering it
    incoming: HashMap<String, BTreeSet<String>>,
}

impl RelationPartition {
    fn insert(&mut self, relation: Relation) {
        if let Some(old) = self.relations.remove(&relation.id) {
            self.unlink(&old);
        }
        self.outgoing
            .entry(relation.source_id.clone())
            .or_default()
            .insert(relation.id.clone());
        self.incoming
            .entry(relation.target_id.clone())
            .or_default()
            .insert(relation.id.clone());
        self.relations.insert(relation.id.clone(), relation);
    }

    fn remove(&mut self, id: &str) -> Option<Relation> {
        let relation = self.relations.remove(id)?;
        self.unlink(&relation);
        Some(relation)
    }

    fn unlink(&mut self, relation: &Relation) {
        if let Some(ids) = self.outgoing.get_mut(&relation.source_id) {
            ids.remove(&relation.id);
            if ids.is_empty() {
                self.outgoing.remove(&relation.source_id);
            }
        }
        if let Some(ids) = self.incoming.get_mut(&relation.target_id) {
            ids.remove(&relation.id);
            if ids.is_empty() {
                self.incoming.remove(&relation.target_id);
            }
        }
    }

    /// Ids of relations touching `entity_id` in `direction`.
    fn adjacent(&self, entity_id: &str, direction: Direction) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            if let Some(out) = self.outgoing.get(entity_id) {
                ids.extend(out.iter().cloned());
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            if let Some(inc) = self.incoming.get(entity_id) {
                ids.extend(inc.iter().cloned());
            }
        }
        ids
    }

    /// Drop every relation touching `entity_id`.
    fn cascade(&mut self, entity_id: &str) {
        for id in self.adjacent(entity_id, Direction::Both) {
            self.remove(&id);
        }
    }
}

/// In-memory [`StorageBackend`] with a node cap.
///
/// Lock order is always entities before relations.
pub struct MemoryBackend {
    max_nodes: usize,
    entities: RwLock<HashMap<String, BTreeMap<String, Entity>>>,
    relations: RwLock<HashMap<String, RelationPartition>>,
    namespaces: RwLock<HashSet<String>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(max_nodes: usize) -> Self {
        Self {
            max_nodes,
            entities: RwLock::new(HashMap::new()),
            relations: RwLock::new(HashMap::new()),
            namespaces: RwLock::new(HashSet::new()),
        }
    }

    fn exhausted(&self) -> KgError {
        KgError::ResourceExhausted {
            resource: "in-memory node store".to_string(),
            capacity: Some(self.max_nodes),
        }
    }

    fn node_count(entities: &HashMap<String, BTreeMap<String, Entity>>) -> usize {
        entities.values().map(BTreeMap::len).sum()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

/// Apply `mode` to an incoming row against the stored one.
fn merge_entity(existing: Option<&Entity>, mut entity: Entity, mode: WriteMode) -> Result<Entity> {
    match (existing, mode) {
        (Some(_), WriteMode::Insert) => Err(KgError::conflict(ItemKind::Entity, entity.id)),
        (Some(old), WriteMode::Upsert) => {
            entity.created_at = old.created_at;
            Ok(entity)
        }
        (None, _) => Ok(entity),
    }
}

fn merge_relation(existing: Option<&Relation>, mut relation: Relation, mode: WriteMode) -> Result<Relation> {
    match (existing, mode) {
        (Some(_), WriteMode::Insert) => Err(KgError::conflict(ItemKind::Relation, relation.id)),
        (Some(old), WriteMode::Upsert) => {
            relation.created_at = old.created_at;
            Ok(relation)
        }
        (None, _) => Ok(relation),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn provision_namespace(&self, namespace: &str) -> Result<()> {
        self.namespaces.write().insert(namespace.to_string());
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        Ok(self.namespaces.read().contains(namespace))
    }

    async fn add_entity(&self, scope: &Scope, entity: Entity, mode: WriteMode) -> Result<Entity> {
        let key = scope.partition_key();
        let mut entities = self.entities.write();
        let is_new = !entities.get(&key).is_some_and(|p| p.contains_key(&entity.id));
        if is_new && Self::node_count(&entities) >= self.max_nodes {
            return Err(self.exhausted());
        }
        let partition = entities.entry(key).or_default();
        let entity = merge_entity(partition.get(&entity.id), entity, mode)?;
        partition.insert(entity.id.clone(), entity.clone());
        debug!(id = %entity.id, "memory: stored entity");
        Ok(entity)
    }

    async fn get_entity(&self, scope: &Scope, id: &str) -> Result<Entity> {
        self.entities
            .read()
            .get(&scope.partition_key())
            .and_then(|p| p.get(id))
            .cloned()
            .ok_or_else(|| KgError::entity_not_found(id))
    }

    async fn get_entities(&self, scope: &Scope, ids: &[String]) -> Result<Vec<Entity>> {
        let entities = self.entities.read();
        let Some(partition) = entities.get(&scope.partition_key()) else {
            return Ok(Vec::new());
        };
        let wanted: BTreeSet<&String> = ids.iter().collect();
        Ok(wanted
            .into_iter()
            .filter_map(|id| partition.get(id).cloned())
            .collect())
    }

    async fn delete_entity(&self, scope: &Scope, id: &str) -> Result<()> {
        let key = scope.partition_key();
        let mut entities = self.entities.write();
        let removed = entities.get_mut(&key).and_then(|p| p.remove(id));
        if removed.is_none() {
            return Err(KgError::entity_not_found(id));
        }
        if let Some(partition) = self.relations.write().get_mut(&key) {
            partition.cascade(id);
        }
        Ok(())
    }

    async fn add_relation(&self, scope: &Scope, relation: Relation, mode: WriteMode) -> Result<Relation> {
        let mut relations = self.relations.write();
        let partition = relations.entry(scope.partition_key()).or_default();
        let relation = merge_relation(partition.relations.get(&relation.id), relation, mode)?;
        partition.insert(relation.clone());
        Ok(relation)
    }

    async fn get_relation(&self, scope: &Scope, id: &str) -> Result<Relation> {
        self.relations
            .read()
            .get(&scope.partition_key())
            .and_then(|p| p.relations.get(id))
            .cloned()
            .ok_or_else(|| KgError::relation_not_found(id))
    }

    async fn delete_relation(&self, scope: &Scope, id: &str) -> Result<()> {
        self.relations
            .write()
            .get_mut(&scope.partition_key())
            .and_then(|p| p.remove(id))
            .map(|_| ())
            .ok_or_else(|| KgError::relation_not_found(id))
    }

    async fn batch_add_entities(&self, scope: &Scope, batch: Vec<Entity>, mode: WriteMode) -> Result<usize> {
        let key = scope.partition_key();
        let mut entities = self.entities.write();
        let total = Self::node_count(&entities);
        let partition = entities.entry(key).or_default();

        // Validate the whole batch before touching the partition.
        let mut staged: BTreeMap<String, Entity> = BTreeMap::new();
        for entity in batch {
            let existing = staged.get(&entity.id).or_else(|| partition.get(&entity.id));
            let merged = merge_entity(existing, entity, mode)?;
            staged.insert(merged.id.clone(), merged);
        }
        let new_nodes = staged.keys().filter(|id| !partition.contains_key(*id)).count();
        if total + new_nodes > self.max_nodes {
            return Err(self.exhausted());
        }
        let count = staged.len();
        partition.extend(staged);
        Ok(count)
    }

    async fn batch_add_relations(&self, scope: &Scope, batch: Vec<Relation>, mode: WriteMode) -> Result<usize> {
        let mut relations = self.relations.write();
        let partition = relations.entry(scope.partition_key()).or_default();

        let mut staged: BTreeMap<String, Relation> = BTreeMap::new();
        for relation in batch {
            let existing = staged
                .get(&relation.id)
                .or_else(|| partition.relations.get(&relation.id));
            let merged = merge_relation(existing, relation, mode)?;
            staged.insert(merged.id.clone(), merged);
        }
        let count = staged.len();
        for relation in staged.into_values() {
            partition.insert(relation);
        }
        Ok(count)
    }

    async fn batch_delete_entities(&self, scope: &Scope, ids: &[String]) -> Result<usize> {
        let key = scope.partition_key();
        let mut entities = self.entities.write();
        let Some(partition) = entities.get_mut(&key) else {
            return Ok(0);
        };
        let removed: Vec<String> = ids
            .iter()
            .filter(|id| partition.remove(id.as_str()).is_some())
            .cloned()
            .collect();
        if let Some(rels) = self.relations.write().get_mut(&key) {
            for id in &removed {
                rels.cascade(id);
            }
        }
        Ok(removed.len())
    }

    async fn query(&self, scope: &Scope, query: &GraphQuery) -> Result<Vec<Entity>> {
        query.validate()?;
        let entities = self.entities.read();
        let Some(partition) = entities.get(&scope.partition_key()) else {
            return Ok(Vec::new());
        };
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(partition
            .values()
            .filter(|e| query.matches(e))
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn relations_for(&self, scope: &Scope, ids: &[String], direction: Direction) -> Result<Vec<Relation>> {
        let relations = self.relations.read();
        let Some(partition) = relations.get(&scope.partition_key()) else {
            return Ok(Vec::new());
        };
        let mut relation_ids = BTreeSet::new();
        for id in ids {
            relation_ids.extend(partition.adjacent(id, direction));
        }
        Ok(relation_ids
            .iter()
            .filter_map(|id| partition.relations.get(id).cloned())
            .collect())
    }

    async fn vector_search(
        &self,
        scope: &Scope,
        embedding: &[f32],
        k: usize,
        entity_type: Option<&str>,
    ) -> Result<Vec<(Entity, f32)>> {
        let entities = self.entities.read();
        let Some(partition) = entities.get(&scope.partition_key()) else {
            return Ok(Vec::new());
        };
        let scored: Vec<(Entity, f32)> = partition
            .values()
            .filter(|e| entity_type.is_none_or(|t| e.entity_type == t))
            .filter_map(|e| {
                let sim = cosine_similarity(embedding, e.embedding.as_deref()?);
                Some((e.clone(), sim))
            })
            .collect();
        Ok(rank_top_k(scored, k))
    }

    async fn stats(&self, scope: &Scope) -> Result<GraphStats> {
        let key = scope.partition_key();
        let mut stats = GraphStats::default();
        if let Some(partition) = self.entities.read().get(&key) {
            stats.entity_count = partition.len();
            for entity in partition.values() {
                *stats.entities_by_type.entry(entity.entity_type.clone()).or_default() += 1;
            }
        }
        if let Some(partition) = self.relations.read().get(&key) {
            stats.relation_count = partition.relations.len();
            for relation in partition.relations.values() {
                *stats.relations_by_type.entry(relation.relation_type.clone()).or_default() += 1;
            }
        }
        Ok(stats)
    }

    async fn list_indexes(&self, _scope: &Scope) -> Result<Vec<IndexInfo>> {
        Ok(builtin_indexes())
    }

    async fn create_index(&self, _scope: &Scope, definition: &IndexDefinition) -> Result<()> {
        definition.validate()?;
        Err(KgError::validation(
            "index",
            format!("'{}': custom indexes are unsupported by the in-memory backend", definition.name),
        ))
    }
}
