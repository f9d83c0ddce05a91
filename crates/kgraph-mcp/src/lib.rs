//! # kgraph-mcp
//!
//! Tool invocation for kgraph.
//!
//! [`ToolDispatcher`] maps a closed set of operation names to the graph,
//! query engine and importer. [`KgraphMcpService`] exposes the same
//! operations as MCP tools:
//! - `add_entity`, `get_entity`, `delete_entity`
//! - `add_relation`, `get_relation`, `delete_relation`
//! - `batch_delete_entities`
//! - `search`: any retrieval strategy, optionally reranked
//! - `import`: CSV/JSON through a schema mapping
//! - `stats`, `index_advice`

pub mod dispatch;
pub mod tools;

pub use dispatch::{ToolDispatcher, ToolOperation};
pub use tools::KgraphMcpService;
