//! # kgraph-store
//!
//! Storage backends, tenant isolation and the query cache for kgraph.
//!
//! - [`StorageBackend`]: the persistence contract, with in-memory
//!   ([`MemoryBackend`]), single-file SQLite ([`FileBackend`]) and pooled
//!   SQLite with sqlite-vec ([`RelationalBackend`]) implementations
//! - [`TenantIsolation`]: tenant validation, scoping and namespace provisioning
//! - [`QueryCache`]: read-through cache with reverse-index invalidation
//! - [`KnowledgeGraph`]: the tenant-scoped facade the rest of the workspace uses

pub mod backend;
pub mod cache;
pub mod file;
pub mod graph;
pub mod isolation;
pub mod memory;
pub mod relational;
pub mod sql;
mod vec_extension;

pub use backend::{
    builtin_indexes, GraphQuery, GraphStats, IndexColumn, IndexDefinition, IndexInfo, IndexTable, Neighbor, Scope,
    StorageBackend,
};
pub use cache::{CacheStats, QueryCache};
pub use file::FileBackend;
pub use graph::KnowledgeGraph;
pub use isolation::TenantIsolation;
pub use memory::MemoryBackend;
pub use relational::RelationalBackend;
