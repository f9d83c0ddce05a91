//! The engine facade: tenant-scoped CRUD, batches, lookups and indexes.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use kgraph_core::{
    BackendKind, Direction, EngineConfig, Entity, KgError, PerformanceMonitor, Relation, Result, TenantContext,
    WriteMode,
};

use crate::backend::{builtin_indexes, GraphQuery, GraphStats, IndexDefinition, IndexInfo, Neighbor, StorageBackend};
use crate::cache::{entity_tag, queries_tag, relation_tag, QueryCache};
use crate::file::FileBackend;
use crate::isolation::TenantIsolation;
use crate::memory::MemoryBackend;
use crate::relational::RelationalBackend;

/// Tenant-scoped knowledge graph over one storage backend.
///
/// Every method takes the caller's [`TenantContext`]; there is no ambient
/// tenant. Errors leaving this type are wrapped with the operation name and
/// tenant id.
pub struct KnowledgeGraph {
    config: EngineConfig,
    isolation: TenantIsolation,
    cache: Option<QueryCache>,
    monitor: Arc<PerformanceMonitor>,
}

impl KnowledgeGraph {
    pub fn new(backend: Arc<dyn StorageBackend>, config: EngineConfig) -> Self {
        let cache = config.cache.enabled.then(|| QueryCache::with_max_entries(config.cache.ttl(), config.cache.max_entries));
        let monitor = Arc::new(PerformanceMonitor::with_tracing(config.monitor.slow_query_threshold()));
        Self {
            isolation: TenantIsolation::new(backend, config.storage.call_timeout()),
            cache,
            monitor,
            config,
        }
    }

    /// Validate `config` and open the backend it names.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for a bad configuration, or whatever the
    /// backend returns while opening its database.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let storage = &config.storage;
        let backend: Arc<dyn StorageBackend> = match storage.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new(storage.max_nodes)),
            BackendKind::File => Arc::new(FileBackend::open(&storage.path)?),
            BackendKind::Relational => Arc::new(RelationalBackend::open(
                &storage.path,
                storage,
                config.query.vector_dimension,
            )?),
        };
        info!(backend = ?storage.backend, cache = config.cache.enabled, "knowledge graph opened");
        Ok(Self::new(backend, config))
    }

    /// Replace the performance monitor (e.g. to install a custom telemetry sink).
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.isolation.backend().kind()
    }

    #[must_use]
    pub fn cache(&self) -> Option<&QueryCache> {
        self.cache.as_ref()
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn isolation(&self) -> &TenantIsolation {
        &self.isolation
    }

    // === Caching helpers ===

    async fn cached<T, F, Fut>(
        &self,
        operation: &str,
        ctx: &TenantContext,
        args: &impl Serialize,
        tags: impl FnOnce(&T) -> Vec<String>,
        load: F,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match self.cache {
            Some(ref cache) => {
                let key = QueryCache::key(operation, &ctx.scope_label(), args)
                    .map_err(|e| e.with_context(operation, &ctx.tenant_id))?;
                cache.get_or_load(key, tags, load).await
            }
            None => load().await,
        }
    }

    /// Drop cached results touching `entity_ids` / `relation_ids` plus all of
    /// the tenant's query results.
    fn invalidate(&self, ctx: &TenantContext, entity_ids: &[&str], relation_ids: &[&str]) {
        let Some(ref cache) = self.cache else {
            return;
        };
        let scope = ctx.scope_label();
        let mut tags = Vec::with_capacity(entity_ids.len() + relation_ids.len() + 1);
        tags.extend(entity_ids.iter().map(|id| entity_tag(&scope, id)));
        tags.extend(relation_ids.iter().map(|id| relation_tag(&scope, id)));
        tags.push(queries_tag(&scope));
        cache.invalidate(&tags);
    }

    fn tenant_queries(ctx: &TenantContext) -> Vec<String> {
        vec![queries_tag(&ctx.scope_label())]
    }

    fn check_entity(&self, entity: &Entity) -> Result<()> {
        entity.validate(self.config.query.vector_dimension)
    }

    fn check_depth(&self, depth: u32) -> Result<()> {
        let max = self.config.query.max_depth;
        if depth == 0 || depth > max {
            return Err(KgError::validation(
                "max_depth",
                format!("depth {depth} is outside 1..={max}"),
            ));
        }
        Ok(())
    }

    fn check_embedding(&self, embedding: &[f32]) -> Result<()> {
        let dim = self.config.query.vector_dimension;
        if embedding.len() != dim {
            return Err(KgError::validation(
                "embedding",
                format!("query vector has {} dimensions, expected {dim}", embedding.len()),
            ));
        }
        Ok(())
    }

    // === Entities ===

    /// Insert a new entity. Duplicate ids are a conflict.
    ///
    /// # Errors
    ///
    /// Validation, Conflict, ResourceExhausted or backend errors.
    pub async fn add_entity(&self, ctx: &TenantContext, entity: Entity) -> Result<Entity> {
        self.write_entity("add_entity", ctx, entity, WriteMode::Insert).await
    }

    /// Insert or replace an entity, keeping the stored `created_at`.
    ///
    /// # Errors
    ///
    /// Validation, ResourceExhausted or backend errors.
    pub async fn upsert_entity(&self, ctx: &TenantContext, mut entity: Entity) -> Result<Entity> {
        entity.updated_at = Utc::now();
        self.write_entity("upsert_entity", ctx, entity, WriteMode::Upsert).await
    }

    async fn write_entity(&self, op: &str, ctx: &TenantContext, entity: Entity, mode: WriteMode) -> Result<Entity> {
        let fut = async {
            self.check_entity(&entity)
                .map_err(|e| e.with_context(op, &ctx.tenant_id))?;
            let id = entity.id.clone();
            let stored = self
                .isolation
                .write(op, ctx, |b, s| async move { b.add_entity(&s, entity, mode).await })
                .await?;
            self.invalidate(ctx, &[id.as_str()], &[]);
            Ok(stored)
        };
        self.monitor.track(op, Some(ctx.tenant_id.as_str()), fut, |_| 1).await
    }

    /// # Errors
    ///
    /// NotFound if the tenant has no entity `id`.
    pub async fn get_entity(&self, ctx: &TenantContext, id: &str) -> Result<Entity> {
        let args = json!({ "id": id });
        let fut = self.cached(
            "get_entity",
            ctx,
            &args,
            |e: &Entity| vec![entity_tag(&ctx.scope_label(), &e.id)],
            || {
                self.isolation.read(
                    "get_entity",
                    ctx,
                    || Err(KgError::entity_not_found(id)),
                    |b, s| {
                        let id = id.to_string();
                        async move { b.get_entity(&s, &id).await }
                    },
                )
            },
        );
        self.monitor.track("get_entity", Some(ctx.tenant_id.as_str()), fut, |_| 1).await
    }

    /// Existing entities among `ids`, ordered by id.
    ///
    /// # Errors
    ///
    /// Backend errors only; unknown ids are skipped.
    pub async fn get_entities(&self, ctx: &TenantContext, ids: &[String]) -> Result<Vec<Entity>> {
        let fut = self.isolation.read(
            "get_entities",
            ctx,
            || Ok(Vec::new()),
            |b, s| {
                let ids = ids.to_vec();
                async move { b.get_entities(&s, &ids).await }
            },
        );
        self.monitor.track("get_entities", Some(ctx.tenant_id.as_str()), fut, Vec::len).await
    }

    /// Delete an entity and every relation touching it.
    ///
    /// # Errors
    ///
    /// NotFound if the tenant has no entity `id`.
    pub async fn delete_entity(&self, ctx: &TenantContext, id: &str) -> Result<()> {
        let fut = async {
            let cascaded = self.relations_for(ctx, &[id.to_string()], Direction::Both).await?;
            self.isolation
                .existing(
                    "delete_entity",
                    ctx,
                    || Err(KgError::entity_not_found(id)),
                    |b, s| {
                        let id = id.to_string();
                        async move { b.delete_entity(&s, &id).await }
                    },
                )
                .await?;
            let relation_ids: Vec<&str> = cascaded.iter().map(|r| r.id.as_str()).collect();
            self.invalidate(ctx, &[id], &relation_ids);
            Ok(())
        };
        self.monitor.track("delete_entity", Some(ctx.tenant_id.as_str()), fut, |_| 1).await
    }

    // === Relations ===

    /// Insert a new relation. Duplicate ids are a conflict.
    ///
    /// # Errors
    ///
    /// Validation, Conflict, NotFound (missing endpoint on SQL backends) or backend errors.
    pub async fn add_relation(&self, ctx: &TenantContext, relation: Relation) -> Result<Relation> {
        self.write_relation("add_relation", ctx, relation, WriteMode::Insert).await
    }

    /// Insert or replace a relation, keeping the stored `created_at`.
    ///
    /// # Errors
    ///
    /// As [`KnowledgeGraph::add_relation`] minus Conflict.
    pub async fn upsert_relation(&self, ctx: &TenantContext, mut relation: Relation) -> Result<Relation> {
        relation.updated_at = Utc::now();
        self.write_relation("upsert_relation", ctx, relation, WriteMode::Upsert).await
    }

    async fn write_relation(&self, op: &str, ctx: &TenantContext, relation: Relation, mode: WriteMode) -> Result<Relation> {
        let fut = async {
            relation.validate().map_err(|e| e.with_context(op, &ctx.tenant_id))?;
            let ids = [relation.id.clone(), relation.source_id.clone(), relation.target_id.clone()];
            let stored = self
                .isolation
                .write(op, ctx, |b, s| async move { b.add_relation(&s, relation, mode).await })
                .await?;
            self.invalidate(ctx, &[ids[1].as_str(), ids[2].as_str()], &[ids[0].as_str()]);
            Ok(stored)
        };
        self.monitor.track(op, Some(ctx.tenant_id.as_str()), fut, |_| 1).await
    }

    /// # Errors
    ///
    /// NotFound if the tenant has no relation `id`.
    pub async fn get_relation(&self, ctx: &TenantContext, id: &str) -> Result<Relation> {
        let args = json!({ "id": id });
        let fut = self.cached(
            "get_relation",
            ctx,
            &args,
            |r: &Relation| vec![relation_tag(&ctx.scope_label(), &r.id)],
            || {
                self.isolation.read(
                    "get_relation",
                    ctx,
                    || Err(KgError::relation_not_found(id)),
                    |b, s| {
                        let id = id.to_string();
                        async move { b.get_relation(&s, &id).await }
                    },
                )
            },
        );
        self.monitor.track("get_relation", Some(ctx.tenant_id.as_str()), fut, |_| 1).await
    }

    /// # Errors
    ///
    /// NotFound if the tenant has no relation `id`.
    pub async fn delete_relation(&self, ctx: &TenantContext, id: &str) -> Result<()> {
        let fut = async {
            self.isolation
                .existing(
                    "delete_relation",
                    ctx,
                    || Err(KgError::relation_not_found(id)),
                    |b, s| {
                        let id = id.to_string();
                        async move { b.delete_relation(&s, &id).await }
                    },
                )
                .await?;
            self.invalidate(ctx, &[], &[id]);
            Ok(())
        };
        self.monitor.track("delete_relation", Some(ctx.tenant_id.as_str()), fut, |_| 1).await
    }

    // === Batches ===

    /// Write entities in chunks of `import.batch_size`, each chunk atomic.
    ///
    /// A failing chunk stops the batch; earlier chunks stay committed.
    ///
    /// # Errors
    ///
    /// The first validation or backend error.
    pub async fn batch_add_entities(&self, ctx: &TenantContext, entities: Vec<Entity>, mode: WriteMode) -> Result<usize> {
        let fut = async {
            for entity in &entities {
                self.check_entity(entity)
                    .map_err(|e| e.with_context("batch_add_entities", &ctx.tenant_id))?;
            }
            let mut written = 0;
            let batch_size = self.config.import.batch_size;
            let mut remaining = entities;
            while !remaining.is_empty() {
                let rest = remaining.split_off(batch_size.min(remaining.len()));
                let chunk = std::mem::replace(&mut remaining, rest);
                let ids: Vec<String> = chunk.iter().map(|e| e.id.clone()).collect();
                written += self
                    .isolation
                    .write("batch_add_entities", ctx, |b, s| async move {
                        b.batch_add_entities(&s, chunk, mode).await
                    })
                    .await?;
                let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                self.invalidate(ctx, &refs, &[]);
                debug!(written, "entity chunk committed");
            }
            Ok(written)
        };
        self.monitor
            .track("batch_add_entities", Some(ctx.tenant_id.as_str()), fut, |n| *n)
            .await
    }

    /// Write relations in chunks of `import.batch_size`, each chunk atomic.
    ///
    /// # Errors
    ///
    /// The first validation or backend error.
    pub async fn batch_add_relations(&self, ctx: &TenantContext, relations: Vec<Relation>, mode: WriteMode) -> Result<usize> {
        let fut = async {
            for relation in &relations {
                relation
                    .validate()
                    .map_err(|e| e.with_context("batch_add_relations", &ctx.tenant_id))?;
            }
            let mut written = 0;
            let batch_size = self.config.import.batch_size;
            let mut remaining = relations;
            while !remaining.is_empty() {
                let rest = remaining.split_off(batch_size.min(remaining.len()));
                let chunk = std::mem::replace(&mut remaining, rest);
                let mut entity_ids: Vec<String> = Vec::with_capacity(chunk.len() * 2);
                let mut relation_ids: Vec<String> = Vec::with_capacity(chunk.len());
                for r in &chunk {
                    relation_ids.push(r.id.clone());
                    entity_ids.push(r.source_id.clone());
                    entity_ids.push(r.target_id.clone());
                }
                written += self
                    .isolation
                    .write("batch_add_relations", ctx, |b, s| async move {
                        b.batch_add_relations(&s, chunk, mode).await
                    })
                    .await?;
                let e: Vec<&str> = entity_ids.iter().map(String::as_str).collect();
                let r: Vec<&str> = relation_ids.iter().map(String::as_str).collect();
                self.invalidate(ctx, &e, &r);
            }
            Ok(written)
        };
        self.monitor
            .track("batch_add_relations", Some(ctx.tenant_id.as_str()), fut, |n| *n)
            .await
    }

    /// Delete the existing entities among `ids` (and their relations).
    /// Returns how many entities were removed.
    ///
    /// # Errors
    ///
    /// Backend errors; missing ids are not an error.
    pub async fn batch_delete_entities(&self, ctx: &TenantContext, ids: &[String]) -> Result<usize> {
        let fut = async {
            let mut removed = 0;
            for chunk in ids.chunks(self.config.import.batch_size) {
                let cascaded = self.relations_for(ctx, chunk, Direction::Both).await?;
                removed += self
                    .isolation
                    .existing(
                        "batch_delete_entities",
                        ctx,
                        || Ok(0),
                        |b, s| {
                            let chunk = chunk.to_vec();
                            async move { b.batch_delete_entities(&s, &chunk).await }
                        },
                    )
                    .await?;
                let e: Vec<&str> = chunk.iter().map(String::as_str).collect();
                let r: Vec<&str> = cascaded.iter().map(|r| r.id.as_str()).collect();
                self.invalidate(ctx, &e, &r);
            }
            Ok(removed)
        };
        self.monitor
            .track("batch_delete_entities", Some(ctx.tenant_id.as_str()), fut, |n| *n)
            .await
    }

    // === Reads ===

    /// Exact-match lookup, ordered by id.
    ///
    /// # Errors
    ///
    /// Validation for unusable property keys, or backend errors.
    pub async fn query(&self, ctx: &TenantContext, query: &GraphQuery) -> Result<Vec<Entity>> {
        let fut = self.cached(
            "query",
            ctx,
            query,
            |_: &Vec<Entity>| Self::tenant_queries(ctx),
            || {
                self.isolation.read("query", ctx, || Ok(Vec::new()), |b, s| {
                    let query = query.clone();
                    async move { b.query(&s, &query).await }
                })
            },
        );
        self.monitor.track("query", Some(ctx.tenant_id.as_str()), fut, Vec::len).await
    }

    /// Relations touching any of `ids` in `direction`, ordered by id.
    ///
    /// # Errors
    ///
    /// Backend errors only.
    pub async fn relations_for(&self, ctx: &TenantContext, ids: &[String], direction: Direction) -> Result<Vec<Relation>> {
        let args = json!({ "ids": ids, "direction": direction });
        let fut = self.cached(
            "relations_for",
            ctx,
            &args,
            |_: &Vec<Relation>| Self::tenant_queries(ctx),
            || {
                self.isolation.read("relations_for", ctx, || Ok(Vec::new()), |b, s| {
                    let ids = ids.to_vec();
                    async move { b.relations_for(&s, &ids, direction).await }
                })
            },
        );
        self.monitor.track("relations_for", Some(ctx.tenant_id.as_str()), fut, Vec::len).await
    }

    /// Entities within `max_depth` hops of `id`.
    ///
    /// # Errors
    ///
    /// Validation for a depth outside `1..=query.max_depth`, NotFound for an
    /// unknown start entity.
    pub async fn get_neighbors(
        &self,
        ctx: &TenantContext,
        id: &str,
        max_depth: u32,
        direction: Direction,
    ) -> Result<Vec<Neighbor>> {
        let fut = async {
            self.check_depth(max_depth)
                .map_err(|e| e.with_context("get_neighbors", &ctx.tenant_id))?;
            self.cached(
                "get_neighbors",
                ctx,
                &json!({ "id": id, "max_depth": max_depth, "direction": direction }),
                |_: &Vec<Neighbor>| Self::tenant_queries(ctx),
                || {
                    self.isolation.read(
                        "get_neighbors",
                        ctx,
                        || Err(KgError::entity_not_found(id)),
                        |b, s| {
                            let id = id.to_string();
                            async move { b.get_neighbors(&s, &id, max_depth, direction).await }
                        },
                    )
                },
            )
            .await
        };
        self.monitor.track("get_neighbors", Some(ctx.tenant_id.as_str()), fut, Vec::len).await
    }

    /// Top-`k` entities by cosine similarity to `embedding`.
    ///
    /// # Errors
    ///
    /// Validation when `embedding` has the wrong dimension.
    pub async fn vector_search(
        &self,
        ctx: &TenantContext,
        embedding: &[f32],
        k: usize,
        entity_type: Option<&str>,
    ) -> Result<Vec<(Entity, f32)>> {
        let fut = async {
            self.check_embedding(embedding)
                .map_err(|e| e.with_context("vector_search", &ctx.tenant_id))?;
            self.cached(
                "vector_search",
                ctx,
                &json!({ "embedding": embedding, "k": k, "entity_type": entity_type }),
                |_: &Vec<(Entity, f32)>| Self::tenant_queries(ctx),
                || {
                    self.isolation.read("vector_search", ctx, || Ok(Vec::new()), |b, s| {
                        let embedding = embedding.to_vec();
                        let entity_type = entity_type.map(str::to_string);
                        async move { b.vector_search(&s, &embedding, k, entity_type.as_deref()).await }
                    })
                },
            )
            .await
        };
        self.monitor.track("vector_search", Some(ctx.tenant_id.as_str()), fut, Vec::len).await
    }

    /// # Errors
    ///
    /// Backend errors only.
    pub async fn stats(&self, ctx: &TenantContext) -> Result<GraphStats> {
        let args = json!({});
        let fut = self.cached(
            "stats",
            ctx,
            &args,
            |_: &GraphStats| Self::tenant_queries(ctx),
            || {
                self.isolation.read("stats", ctx, || Ok(GraphStats::default()), |b, s| async move {
                    b.stats(&s).await
                })
            },
        );
        self.monitor.track("stats", Some(ctx.tenant_id.as_str()), fut, |_| 1).await
    }

    // === Indexes ===

    /// # Errors
    ///
    /// Backend errors only.
    pub async fn list_indexes(&self, ctx: &TenantContext) -> Result<Vec<IndexInfo>> {
        self.isolation
            .read("list_indexes", ctx, || Ok(builtin_indexes()), |b, s| async move {
                b.list_indexes(&s).await
            })
            .await
    }

    /// Create an index in the tenant's scope. Never called implicitly.
    ///
    /// # Errors
    ///
    /// Validation for unsafe names or backends without custom indexes.
    pub async fn create_index(&self, ctx: &TenantContext, definition: &IndexDefinition) -> Result<()> {
        self.isolation
            .write("create_index", ctx, |b, s| {
                let definition = definition.clone();
                async move { b.create_index(&s, &definition).await }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgraph_core::ErrorKind;

    fn graph() -> KnowledgeGraph {
        let mut config = EngineConfig::default();
        config.query.vector_dimension = 3;
        KnowledgeGraph::new(Arc::new(MemoryBackend::default()), config)
    }

    #[tokio::test]
    async fn get_entity_hits_cache_and_sees_updates() {
        let g = graph();
        let ctx = TenantContext::shared("acme");
        let stored = g.add_entity(&ctx, Entity::new("a", "T").with_property("v", 1)).await.unwrap();

        assert_eq!(g.get_entity(&ctx, "a").await.unwrap(), stored);
        assert_eq!(g.get_entity(&ctx, "a").await.unwrap(), stored);
        let stats = g.cache().unwrap().stats();
        assert_eq!(stats.hits, 1);

        g.upsert_entity(&ctx, Entity::new("a", "T").with_property("v", 2)).await.unwrap();
        let fresh = g.get_entity(&ctx, "a").await.unwrap();
        assert_eq!(fresh.properties["v"], 2);
        assert_eq!(fresh.created_at, stored.created_at);
    }

    #[tokio::test]
    async fn wrong_embedding_dimension_is_rejected() {
        let g = graph();
        let ctx = TenantContext::shared("acme");
        let err = g
            .add_entity(&ctx, Entity::new("a", "T").with_embedding(vec![1.0; 4]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(g.vector_search(&ctx, &[1.0], 3, None).await.is_err());
    }

    #[tokio::test]
    async fn depth_outside_range_is_rejected() {
        let g = graph();
        let ctx = TenantContext::shared("acme");
        g.add_entity(&ctx, Entity::new("a", "T")).await.unwrap();
        assert!(g.get_neighbors(&ctx, "a", 0, Direction::Both).await.is_err());
        assert!(g.get_neighbors(&ctx, "a", 6, Direction::Both).await.is_err());
        assert!(g.get_neighbors(&ctx, "a", 5, Direction::Both).await.is_ok());
    }

    #[tokio::test]
    async fn deleting_entity_invalidates_cascaded_relations() {
        let g = graph();
        let ctx = TenantContext::shared("acme");
        g.add_entity(&ctx, Entity::new("a", "T")).await.unwrap();
        g.add_entity(&ctx, Entity::new("b", "T")).await.unwrap();
        g.add_relation(&ctx, Relation::new("r", "L", "a", "b")).await.unwrap();
        g.get_relation(&ctx, "r").await.unwrap();

        g.delete_entity(&ctx, "a").await.unwrap();
        let err = g.get_relation(&ctx, "r").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn operations_are_recorded_in_monitor() {
        let g = graph();
        let ctx = TenantContext::shared("acme");
        g.add_entity(&ctx, Entity::new("a", "T")).await.unwrap();
        let _ = g.get_entity(&ctx, "missing").await;
        let summary = g.monitor().summary();
        let get = summary.iter().find(|s| s.operation == "get_entity").unwrap();
        assert_eq!(get.errors, 1);
    }
}
