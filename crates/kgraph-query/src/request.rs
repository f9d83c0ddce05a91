//! Search requests and responses.
//!
//! A [`SearchRequest`] is a closed, internally tagged [`QueryRequest`] (the
//! `"strategy"` field picks the variant) plus an optional result limit and
//! reranking options. Unknown strategies fail at deserialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kgraph_core::{Direction, Entity, KgError, Result};

use crate::rerank::RerankOptions;

/// Order in which graph strategies visit nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraversalOrder {
    #[default]
    Bfs,
    Dfs,
}

fn default_vector_weight() -> f32 {
    0.6
}

fn default_graph_weight() -> f32 {
    0.4
}

fn default_damping() -> f64 {
    0.85
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_max_iterations() -> usize {
    100
}

fn default_hops() -> u32 {
    2
}

/// Rank by cosine similarity to a query vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Embedded through the configured provider when no `embedding` is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Minimum cosine similarity for a hit.
    #[serde(default)]
    pub threshold: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

/// Bounded expansion from seed entities, scored `1 / depth`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQuerySpec {
    pub seeds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub order: TraversalOrder,
    #[serde(default)]
    pub include_seeds: bool,
}

/// Weighted fusion of vector similarity and graph proximity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Expansion roots. Defaults to the vector hits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seeds: Vec<String>,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_graph_weight")]
    pub graph_weight: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub direction: Direction,
    /// Expand one hop further than `max_depth` before truncating.
    #[serde(default)]
    pub expand_extra_hop: bool,
    #[serde(default)]
    pub threshold: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl Default for HybridQuery {
    fn default() -> Self {
        Self {
            embedding: None,
            text: None,
            seeds: Vec::new(),
            vector_weight: default_vector_weight(),
            graph_weight: default_graph_weight(),
            max_depth: None,
            direction: Direction::Both,
            expand_extra_hop: false,
            threshold: 0.0,
            entity_type: None,
        }
    }
}

/// Personalized PageRank over the neighbourhood of the seeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRankQuery {
    pub seeds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default = "default_damping")]
    pub damping: f64,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub include_seeds: bool,
}

impl Default for PageRankQuery {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            max_depth: None,
            direction: Direction::Both,
            damping: default_damping(),
            tolerance: default_tolerance(),
            max_iterations: default_max_iterations(),
            include_seeds: false,
        }
    }
}

/// Everything within `hops`, unscored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiHopQuery {
    pub seeds: Vec<String>,
    #[serde(default = "default_hops")]
    pub hops: u32,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub include_seeds: bool,
}

/// Exact type/property match without traversal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilteredQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// Walk following only the listed relation types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraverseQuery {
    pub seeds: Vec<String>,
    pub relation_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub include_seeds: bool,
}

/// The seven retrieval strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum QueryRequest {
    Vector(VectorQuery),
    Graph(GraphQuerySpec),
    Hybrid(HybridQuery),
    Pagerank(PageRankQuery),
    Multihop(MultiHopQuery),
    Filtered(FilteredQuery),
    Traverse(TraverseQuery),
}

impl QueryRequest {
    #[must_use]
    pub fn strategy(&self) -> &'static str {
        match self {
            Self::Vector(_) => "vector",
            Self::Graph(_) => "graph",
            Self::Hybrid(_) => "hybrid",
            Self::Pagerank(_) => "pagerank",
            Self::Multihop(_) => "multihop",
            Self::Filtered(_) => "filtered",
            Self::Traverse(_) => "traverse",
        }
    }

    /// Free text the request carries, used by text reranking.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Vector(q) => q.text.as_deref(),
            Self::Hybrid(q) => q.text.as_deref(),
            _ => None,
        }
    }

    /// Input checks that need no configuration.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for missing seeds, a missing query
    /// vector/text, an empty filter or out-of-range weights.
    pub fn validate(&self) -> Result<()> {
        fn require_seeds(seeds: &[String]) -> Result<()> {
            if seeds.is_empty() || seeds.iter().any(|s| s.trim().is_empty()) {
                return Err(KgError::validation("seeds", "at least one non-empty seed id is required"));
            }
            Ok(())
        }
        fn require_query(embedding: Option<&Vec<f32>>, text: Option<&String>) -> Result<()> {
            let has_text = text.is_some_and(|t| !t.trim().is_empty());
            if embedding.is_none() && !has_text {
                return Err(KgError::validation("embedding", "either an embedding or text is required"));
            }
            Ok(())
        }

        match self {
            Self::Vector(q) => require_query(q.embedding.as_ref(), q.text.as_ref()),
            Self::Graph(q) => require_seeds(&q.seeds),
            Self::Hybrid(q) => {
                require_query(q.embedding.as_ref(), q.text.as_ref())?;
                if !(q.vector_weight >= 0.0 && q.graph_weight >= 0.0) || q.vector_weight + q.graph_weight <= 0.0 {
                    return Err(KgError::validation(
                        "vector_weight",
                        "weights must be non-negative and not both zero",
                    ));
                }
                Ok(())
            }
            Self::Pagerank(q) => {
                require_seeds(&q.seeds)?;
                if !(q.damping > 0.0 && q.damping < 1.0) {
                    return Err(KgError::validation("damping", "damping must be in (0, 1)"));
                }
                if q.max_iterations == 0 || !(q.tolerance > 0.0) {
                    return Err(KgError::validation(
                        "max_iterations",
                        "need a positive iteration cap and tolerance",
                    ));
                }
                Ok(())
            }
            Self::Multihop(q) => require_seeds(&q.seeds),
            Self::Filtered(q) => {
                if q.entity_type.is_none() && q.properties.is_empty() {
                    return Err(KgError::validation(
                        "entity_type",
                        "filtered search needs an entity_type or at least one property",
                    ));
                }
                Ok(())
            }
            Self::Traverse(q) => {
                require_seeds(&q.seeds)?;
                if q.relation_types.is_empty() {
                    return Err(KgError::validation(
                        "relation_types",
                        "traverse needs at least one allowed relation type",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// A strategy plus result shaping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(flatten)]
    pub query: QueryRequest,
    /// Defaults to `query.default_limit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank: Option<RerankOptions>,
}

impl SearchRequest {
    #[must_use]
    pub fn new(query: QueryRequest) -> Self {
        Self {
            query,
            limit: None,
            rerank: None,
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_rerank(mut self, rerank: RerankOptions) -> Self {
        self.rerank = Some(rerank);
        self
    }

    /// Parse a request from tool or CLI JSON.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for unknown strategies and malformed fields.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| KgError::validation("strategy", e.to_string()))
    }
}

/// One scored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub entity: Entity,
    pub score: f32,
    /// Hop distance from the nearest seed, for graph strategies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

impl SearchHit {
    #[must_use]
    pub fn new(entity: Entity, score: f32, depth: Option<u32>) -> Self {
        Self { entity, score, depth }
    }
}

/// Results of one search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub strategy: String,
    pub hits: Vec<SearchHit>,
    /// Candidates considered before truncation.
    pub candidates: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reranked_by: Option<String>,
}

/// Order by score descending, ties by ascending id.
pub fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity.id.cmp(&b.entity.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgraph_core::ErrorKind;
    use serde_json::json;

    #[test]
    fn strategy_tag_selects_variant() {
        let req = SearchRequest::from_json(json!({
            "strategy": "graph",
            "seeds": ["e1"],
            "max_depth": 2,
            "direction": "outgoing",
            "limit": 5
        }))
        .unwrap();
        assert_eq!(req.limit, Some(5));
        match req.query {
            QueryRequest::Graph(ref q) => {
                assert_eq!(q.seeds, vec!["e1"]);
                assert_eq!(q.max_depth, Some(2));
                assert_eq!(q.direction, Direction::Outgoing);
                assert_eq!(q.order, TraversalOrder::Bfs);
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_strategy_is_validation_error() {
        let err = SearchRequest::from_json(json!({"strategy": "telepathy"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn hybrid_defaults_weights() {
        let req = SearchRequest::from_json(json!({"strategy": "hybrid", "text": "rust"})).unwrap();
        let QueryRequest::Hybrid(q) = req.query else {
            panic!("expected hybrid");
        };
        assert!((q.vector_weight - 0.6).abs() < f32::EPSILON);
        assert!((q.graph_weight - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn missing_inputs_are_rejected() {
        let cases = [
            QueryRequest::Vector(VectorQuery::default()),
            QueryRequest::Graph(GraphQuerySpec::default()),
            QueryRequest::Hybrid(HybridQuery::default()),
            QueryRequest::Pagerank(PageRankQuery::default()),
            QueryRequest::Filtered(FilteredQuery::default()),
            QueryRequest::Traverse(TraverseQuery {
                seeds: vec!["a".into()],
                ..TraverseQuery::default()
            }),
        ];
        for case in cases {
            let err = case.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{case:?}");
        }
    }

    #[test]
    fn serialization_keeps_the_tag() {
        let req = SearchRequest::new(QueryRequest::Filtered(FilteredQuery {
            entity_type: Some("Person".into()),
            ..FilteredQuery::default()
        }));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["strategy"], "filtered");
        assert_eq!(SearchRequest::from_json(value).unwrap(), req);
    }

    #[test]
    fn hits_sort_by_score_then_id() {
        let mut hits = vec![
            SearchHit::new(Entity::new("b", "T"), 0.5, None),
            SearchHit::new(Entity::new("a", "T"), 0.5, None),
            SearchHit::new(Entity::new("c", "T"), 0.9, None),
        ];
        sort_hits(&mut hits);
        let ids: Vec<&str> = hits.iter().map(|h| h.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
