//! # kgraph-core
//!
//! Core types, tenant model, configuration and telemetry for the kgraph
//! knowledge-graph engine.
//!
//! This crate defines the foundational types used across all other kgraph crates:
//! - [`Entity`] and [`Relation`]: the property-graph data model
//! - [`TenantContext`]: explicit, caller-owned tenant scoping
//! - Error hierarchy ([`KgError`], [`ErrorKind`])
//! - [`EngineConfig`]: TOML configuration with defaults
//! - [`EmbeddingProvider`]: the text-to-vector seam
//! - [`PerformanceMonitor`]: timings, slow-query log, telemetry sink

pub mod config;
pub mod embedding;
pub mod error;
pub mod model;
pub mod monitor;
pub mod tenant;

pub use config::{BackendKind, EngineConfig};
pub use embedding::{cosine_similarity, EmbeddingProvider, HashEmbedder};
pub use error::{ErrorKind, ItemKind, KgError, Result};
pub use model::{Direction, Entity, Properties, Relation, WriteMode};
pub use monitor::{PerformanceMonitor, TelemetryEvent, TelemetrySink, TracingSink};
pub use tenant::{IsolationMode, TenantContext};
