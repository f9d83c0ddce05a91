//! The query engine: one handler per retrieval strategy.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use kgraph_core::{cosine_similarity, EmbeddingProvider, Entity, KgError, Result, TenantContext};
use kgraph_store::cache::queries_tag;
use kgraph_store::{GraphQuery, KnowledgeGraph, QueryCache};

use crate::advisor::{patterns_for_plan, patterns_for_request, IndexAdvisor, IndexReport, QueryPatternLog};
use crate::hybrid::{graph_score, HybridWeights};
use crate::optimizer::{OptimizedPlan, Optimizer, PlanStep, QueryPlan};
use crate::pagerank::{personalized_pagerank, PageRankParams};
use crate::request::{
    sort_hits, FilteredQuery, GraphQuerySpec, HybridQuery, MultiHopQuery, PageRankQuery, QueryRequest, SearchHit,
    SearchRequest, SearchResponse, TraversalOrder, TraverseQuery, VectorQuery,
};
use crate::rerank::{rerank, RerankInput, RerankOptions, RerankStrategy};
use crate::traversal::{breadth_first, depth_first, Expansion};

/// Depth used when a graph request names none.
const DEFAULT_DEPTH: u32 = 2;
/// Depth of the hybrid expansion when the request names none.
const DEFAULT_HYBRID_DEPTH: u32 = 1;

/// Cardinality after one plan step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanExecution {
    pub entities: Vec<Entity>,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimization: Option<OptimizedPlan>,
}

/// Runs search requests and plans against a [`KnowledgeGraph`].
pub struct QueryEngine {
    graph: Arc<KnowledgeGraph>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    patterns: QueryPatternLog,
}

impl QueryEngine {
    #[must_use]
    pub fn new(graph: Arc<KnowledgeGraph>) -> Self {
        Self {
            graph,
            embedder: None,
            patterns: QueryPatternLog::new(),
        }
    }

    /// Install the provider used to embed query text.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<KnowledgeGraph> {
        &self.graph
    }

    #[must_use]
    pub fn patterns(&self) -> &QueryPatternLog {
        &self.patterns
    }

    // === Search ===

    /// Run one search.
    ///
    /// # Errors
    ///
    /// Validation errors for malformed requests, otherwise whatever the
    /// underlying graph calls return.
    pub async fn search(&self, ctx: &TenantContext, request: &SearchRequest) -> Result<SearchResponse> {
        let inner = async {
            request.query.validate()?;
            if let Some(ref options) = request.rerank {
                options.validate()?;
            }
            let limit = request.limit.unwrap_or(self.graph.config().query.default_limit);
            if limit == 0 {
                return Err(KgError::validation("limit", "limit must be at least 1"));
            }
            self.patterns.record_all(patterns_for_request(&request.query));

            match self.graph.cache() {
                Some(cache) => {
                    let scope = ctx.scope_label();
                    let key = QueryCache::key("search", &scope, request)?;
                    cache
                        .get_or_load(key, |_: &SearchResponse| vec![queries_tag(&scope)], || self.run(ctx, request, limit))
                        .await
                }
                None => self.run(ctx, request, limit).await,
            }
        };
        let fut = async { inner.await.map_err(|e| e.with_context("search", &ctx.tenant_id)) };
        self.graph
            .monitor()
            .track("search", Some(ctx.tenant_id.as_str()), fut, |r: &SearchResponse| r.hits.len())
            .await
    }

    async fn run(&self, ctx: &TenantContext, request: &SearchRequest, limit: usize) -> Result<SearchResponse> {
        let fetch = request.rerank.as_ref().map_or(limit, |r| r.candidates_for(limit));
        let (mut hits, query_vector) = match request.query {
            QueryRequest::Vector(ref q) => {
                let (hits, v) = self.vector(ctx, q, fetch).await?;
                (hits, Some(v))
            }
            QueryRequest::Graph(ref q) => (self.graph_walk(ctx, q).await?, None),
            QueryRequest::Hybrid(ref q) => {
                let (hits, v) = self.hybrid(ctx, q, fetch).await?;
                (hits, Some(v))
            }
            QueryRequest::Pagerank(ref q) => (self.pagerank(ctx, q).await?, None),
            QueryRequest::Multihop(ref q) => (self.multihop(ctx, q).await?, None),
            QueryRequest::Filtered(ref q) => (self.filtered(ctx, q, fetch).await?, None),
            QueryRequest::Traverse(ref q) => (self.traverse(ctx, q).await?, None),
        };
        let candidates = hits.len();
        hits.truncate(fetch);

        let mut reranked_by = None;
        if let Some(ref options) = request.rerank {
            hits = self
                .apply_rerank(ctx, hits, options, request.query.text(), query_vector)
                .await?;
            reranked_by = Some(options.strategy.as_str().to_string());
        }
        hits.truncate(limit);
        debug!(
            strategy = request.query.strategy(),
            candidates,
            returned = hits.len(),
            "search finished"
        );
        Ok(SearchResponse {
            strategy: request.query.strategy().to_string(),
            hits,
            candidates,
            reranked_by,
        })
    }

    // === Inputs ===

    fn depth(&self, requested: Option<u32>, default: u32) -> Result<u32> {
        let max = self.graph.config().query.max_depth;
        let depth = requested.unwrap_or_else(|| default.min(max));
        if depth == 0 || depth > max {
            return Err(KgError::validation("max_depth", format!("depth {depth} is outside 1..={max}")));
        }
        Ok(depth)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| KgError::validation("text", "text queries need an embedding provider"))?;
        let vector = embedder.embed(text).await?;
        self.check_dimension(&vector)?;
        Ok(vector)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        let dim = self.graph.config().query.vector_dimension;
        if vector.len() != dim {
            return Err(KgError::validation(
                "embedding",
                format!("query vector has {} dimensions, expected {dim}", vector.len()),
            ));
        }
        Ok(())
    }

    async fn query_vector(&self, embedding: Option<&Vec<f32>>, text: Option<&str>) -> Result<Vec<f32>> {
        match (embedding, text) {
            (Some(v), _) => {
                self.check_dimension(v)?;
                Ok(v.clone())
            }
            (None, Some(t)) => self.embed(t).await,
            (None, None) => Err(KgError::validation("embedding", "either an embedding or text is required")),
        }
    }

    /// Load the reached entities and score them; missing ids are skipped.
    async fn materialize(
        &self,
        ctx: &TenantContext,
        reached: Vec<(String, u32)>,
        score: impl Fn(&str, u32) -> f32,
    ) -> Result<Vec<SearchHit>> {
        let depths: HashMap<String, u32> = reached.into_iter().collect();
        let ids: Vec<String> = depths.keys().cloned().collect();
        let entities = self.graph.get_entities(ctx, &ids).await?;
        let mut hits: Vec<SearchHit> = entities
            .into_iter()
            .map(|e| {
                let d = depths.get(&e.id).copied().unwrap_or(0);
                let s = score(&e.id, d);
                SearchHit::new(e, s, Some(d))
            })
            .collect();
        sort_hits(&mut hits);
        Ok(hits)
    }

    // === Strategies ===

    async fn vector(&self, ctx: &TenantContext, q: &VectorQuery, fetch: usize) -> Result<(Vec<SearchHit>, Vec<f32>)> {
        let v = self.query_vector(q.embedding.as_ref(), q.text.as_deref()).await?;
        let results = self
            .graph
            .vector_search(ctx, &v, fetch, q.entity_type.as_deref())
            .await?;
        let hits = results
            .into_iter()
            .filter(|(_, score)| *score >= q.threshold)
            .map(|(e, score)| SearchHit::new(e, score, None))
            .collect();
        Ok((hits, v))
    }

    async fn graph_walk(&self, ctx: &TenantContext, q: &GraphQuerySpec) -> Result<Vec<SearchHit>> {
        let depth = self.depth(q.max_depth, DEFAULT_DEPTH)?;
        let expansion = match q.order {
            TraversalOrder::Bfs => breadth_first(&self.graph, ctx, &q.seeds, depth, q.direction, None).await?,
            TraversalOrder::Dfs => depth_first(&self.graph, ctx, &q.seeds, depth, q.direction, None).await?,
        };
        self.materialize(ctx, expansion.reached(q.include_seeds), |_, d| inverse_depth(d))
            .await
    }

    async fn hybrid(&self, ctx: &TenantContext, q: &HybridQuery, fetch: usize) -> Result<(Vec<SearchHit>, Vec<f32>)> {
        let weights = HybridWeights::normalized(q.vector_weight, q.graph_weight)?;
        let v = self.query_vector(q.embedding.as_ref(), q.text.as_deref()).await?;
        let depth = self.depth(q.max_depth, DEFAULT_HYBRID_DEPTH)? + u32::from(q.expand_extra_hop);

        let vector_hits: Vec<(Entity, f32)> = self
            .graph
            .vector_search(ctx, &v, fetch, q.entity_type.as_deref())
            .await?
            .into_iter()
            .filter(|(_, s)| *s >= q.threshold)
            .collect();
        let seeds: Vec<String> = if q.seeds.is_empty() {
            vector_hits.iter().map(|(e, _)| e.id.clone()).collect()
        } else {
            q.seeds.clone()
        };
        let expansion = if seeds.is_empty() {
            Expansion::default()
        } else {
            breadth_first(&self.graph, ctx, &seeds, depth, q.direction, None).await?
        };

        let mut vector_scores: HashMap<String, f32> = HashMap::new();
        let mut entities: HashMap<String, Entity> = HashMap::new();
        for (e, s) in vector_hits {
            vector_scores.insert(e.id.clone(), s);
            entities.insert(e.id.clone(), e);
        }
        let missing: Vec<String> = expansion
            .depths
            .keys()
            .filter(|id| !entities.contains_key(*id))
            .cloned()
            .collect();
        for e in self.graph.get_entities(ctx, &missing).await? {
            entities.insert(e.id.clone(), e);
        }

        let mut hits: Vec<SearchHit> = entities
            .into_values()
            .filter(|e| q.entity_type.as_ref().is_none_or(|t| &e.entity_type == t))
            .map(|e| {
                let vs = vector_scores.get(&e.id).copied().unwrap_or_else(|| {
                    e.embedding.as_deref().map_or(0.0, |emb| cosine_similarity(&v, emb))
                });
                let hops = expansion.depths.get(&e.id).copied();
                let gs = hops.map_or(0.0, graph_score);
                SearchHit::new(e, weights.fuse(vs.max(0.0), gs), hops)
            })
            .collect();
        sort_hits(&mut hits);
        Ok((hits, v))
    }

    async fn pagerank(&self, ctx: &TenantContext, q: &PageRankQuery) -> Result<Vec<SearchHit>> {
        let depth = self.depth(q.max_depth, DEFAULT_DEPTH)?;
        let expansion = breadth_first(&self.graph, ctx, &q.seeds, depth, q.direction, None).await?;
        let nodes: Vec<String> = expansion.depths.keys().cloned().collect();
        let result = personalized_pagerank(
            &nodes,
            expansion.internal_relations(),
            &q.seeds,
            q.direction,
            PageRankParams {
                damping: q.damping,
                tolerance: q.tolerance,
                max_iterations: q.max_iterations,
            },
        );
        debug!(
            nodes = nodes.len(),
            iterations = result.iterations,
            converged = result.converged,
            "pagerank finished"
        );
        let ranks = result.ranks;
        self.materialize(ctx, expansion.reached(q.include_seeds), |id, _| {
            ranks.get(id).copied().unwrap_or(0.0) as f32
        })
        .await
    }

    async fn multihop(&self, ctx: &TenantContext, q: &MultiHopQuery) -> Result<Vec<SearchHit>> {
        let hops = self.depth(Some(q.hops), DEFAULT_DEPTH)?;
        let expansion = breadth_first(&self.graph, ctx, &q.seeds, hops, q.direction, None).await?;
        let mut hits = self
            .materialize(ctx, expansion.reached(q.include_seeds), |_, _| 1.0)
            .await?;
        hits.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.entity.id.cmp(&b.entity.id)));
        Ok(hits)
    }

    async fn filtered(&self, ctx: &TenantContext, q: &FilteredQuery, fetch: usize) -> Result<Vec<SearchHit>> {
        let query = GraphQuery {
            entity_type: q.entity_type.clone(),
            properties: q.properties.clone(),
            limit: Some(fetch),
            ..GraphQuery::default()
        };
        let entities = self.graph.query(ctx, &query).await?;
        Ok(entities.into_iter().map(|e| SearchHit::new(e, 1.0, None)).collect())
    }

    async fn traverse(&self, ctx: &TenantContext, q: &TraverseQuery) -> Result<Vec<SearchHit>> {
        let depth = self.depth(q.max_depth, DEFAULT_DEPTH)?;
        let allowed: HashSet<String> = q.relation_types.iter().cloned().collect();
        let expansion = breadth_first(&self.graph, ctx, &q.seeds, depth, q.direction, Some(&allowed)).await?;
        self.materialize(ctx, expansion.reached(q.include_seeds), |_, d| inverse_depth(d))
            .await
    }

    // === Reranking ===

    async fn apply_rerank(
        &self,
        ctx: &TenantContext,
        hits: Vec<SearchHit>,
        options: &RerankOptions,
        request_text: Option<&str>,
        query_vector: Option<Vec<f32>>,
    ) -> Result<Vec<SearchHit>> {
        let text = options.text.as_deref().or(request_text);
        let wants_vector = matches!(options.strategy, RerankStrategy::Semantic | RerankStrategy::Hybrid);
        let embedding = match (query_vector, text) {
            (Some(v), _) => Some(v),
            (None, Some(t)) if wants_vector && self.embedder.is_some() => Some(self.embed(t).await?),
            _ => None,
        };
        let degrees = if options.needs_degrees() {
            Some(self.degrees(ctx, &hits).await?)
        } else {
            None
        };
        rerank(
            hits,
            options,
            &RerankInput {
                text,
                embedding: embedding.as_deref(),
                degrees: degrees.as_ref(),
            },
        )
    }

    async fn degrees(&self, ctx: &TenantContext, hits: &[SearchHit]) -> Result<HashMap<String, usize>> {
        let ids: Vec<String> = hits.iter().map(|h| h.entity.id.clone()).collect();
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut degrees: HashMap<String, usize> = HashMap::new();
        for relation in self.graph.relations_for(ctx, &ids, kgraph_core::Direction::Both).await? {
            for end in [&relation.source_id, &relation.target_id] {
                if wanted.contains(end.as_str()) {
                    *degrees.entry(end.clone()).or_default() += 1;
                }
            }
        }
        Ok(degrees)
    }

    // === Plans ===

    /// Run a multi-step plan, optionally rewriting it first.
    ///
    /// # Errors
    ///
    /// Validation for malformed plans, otherwise graph errors.
    pub async fn execute_plan(&self, ctx: &TenantContext, plan: &QueryPlan, optimize: bool) -> Result<PlanExecution> {
        let inner = async {
            plan.validate()?;
            let optimization = if optimize {
                let stats = self.graph.stats(ctx).await?;
                Some(Optimizer::new(&stats).optimize(plan)?)
            } else {
                None
            };
            let to_run = optimization.as_ref().map_or(plan, |o| &o.plan);
            self.patterns.record_all(patterns_for_plan(to_run));

            let mut current: Vec<Entity> = Vec::new();
            let mut steps = Vec::with_capacity(to_run.steps.len());
            for step in &to_run.steps {
                current = self.run_step(ctx, step, current).await?;
                steps.push(StepReport {
                    step: step.label(),
                    rows: current.len(),
                });
            }
            Ok::<_, KgError>(PlanExecution {
                entities: current,
                steps,
                optimization,
            })
        };
        let fut = async { inner.await.map_err(|e| e.with_context("execute_plan", &ctx.tenant_id)) };
        self.graph
            .monitor()
            .track("execute_plan", Some(ctx.tenant_id.as_str()), fut, |r: &PlanExecution| r.entities.len())
            .await
    }

    async fn run_step(&self, ctx: &TenantContext, step: &PlanStep, mut current: Vec<Entity>) -> Result<Vec<Entity>> {
        match step {
            PlanStep::Seed { ids } => self.graph.get_entities(ctx, ids).await,
            PlanStep::TypeScan { entity_type } => self.graph.query(ctx, &GraphQuery::by_type(entity_type.as_str())).await,
            PlanStep::Expand {
                direction,
                relation_types,
                filters,
            } => {
                if current.is_empty() {
                    return Ok(current);
                }
                let ids: Vec<String> = current.iter().map(|e| e.id.clone()).collect();
                let frontier: HashSet<&str> = ids.iter().map(String::as_str).collect();
                let mut next = BTreeSet::new();
                for relation in self.graph.relations_for(ctx, &ids, *direction).await? {
                    if !relation_types.is_empty() && !relation_types.contains(&relation.relation_type) {
                        continue;
                    }
                    for node in [&relation.source_id, &relation.target_id] {
                        if !frontier.contains(node.as_str()) {
                            continue;
                        }
                        if let Some(other) = direction.step(&relation, node) {
                            next.insert(other.to_string());
                        }
                    }
                }
                let next: Vec<String> = next.into_iter().collect();
                let reached = self.graph.get_entities(ctx, &next).await?;
                Ok(reached
                    .into_iter()
                    .filter(|e| filters.iter().all(|f| f.matches(e)))
                    .collect())
            }
            PlanStep::Filter { filter } => {
                current.retain(|e| filter.matches(e));
                Ok(current)
            }
            PlanStep::Limit { count } => {
                current.truncate(*count);
                Ok(current)
            }
        }
    }

    // === Diagnostics ===

    /// Index advice for the tenant from the patterns recorded so far.
    ///
    /// # Errors
    ///
    /// Graph errors while reading indexes or statistics.
    pub async fn index_advice(&self, ctx: &TenantContext, advisor: &IndexAdvisor) -> Result<IndexReport> {
        let indexes = self.graph.list_indexes(ctx).await?;
        let stats = self.graph.stats(ctx).await?;
        Ok(advisor.analyze(&self.patterns.snapshot(), &indexes, &stats))
    }
}

fn inverse_depth(depth: u32) -> f32 {
    if depth == 0 {
        1.0
    } else {
        1.0 / depth as f32
    }
}
