//! # kgraph-query
//!
//! Retrieval over a tenant's knowledge graph.
//!
//! Includes:
//! - [`QueryEngine`] with seven strategies: vector, graph, hybrid,
//!   personalized PageRank, multi-hop, filtered and typed traversal
//! - Second-stage reranking (BM25 text, semantic, structural, blended)
//! - A cost-based plan optimizer with filter pushdown
//! - An index advisor fed by recorded access patterns
//! - Result formatter (JSON, Table, Markdown)

pub mod advisor;
pub mod engine;
pub mod formatter;
pub mod hybrid;
pub mod optimizer;
pub mod pagerank;
pub mod request;
pub mod rerank;
pub mod traversal;

pub use advisor::{AccessPattern, IndexAdvisor, IndexRecommendation, IndexReport, QueryPatternLog};
pub use engine::{PlanExecution, QueryEngine, StepReport};
pub use formatter::{format_results, format_search, OutputFormat, QueryResult};
pub use optimizer::{OptimizedPlan, Optimizer, PlanFilter, PlanStep, QueryPlan};
pub use request::{QueryRequest, SearchHit, SearchRequest, SearchResponse, TraversalOrder};
pub use rerank::{RerankOptions, RerankStrategy};
