//! # kgraph-import
//!
//! Structured import into a tenant's knowledge graph.
//!
//! Sources are CSV (header row required) or JSON: a top-level array,
//! JSON-lines, or an object holding the rows under one key. A
//! [`SchemaMapping`] turns each row into entities and relations after its
//! column [`Transformation`]s run, and the [`BatchLoader`] commits them in
//! batches, collecting row-level errors unless told to abort.

pub mod loader;
pub mod mapping;
pub mod reader;
pub mod transform;

pub use loader::{BatchLoader, CommitMode, ImportOptions, ImportProgress, ImportResult, RowError};
pub use mapping::{EntityMapping, RelationMapping, SchemaMapping};
pub use reader::InputFormat;
pub use transform::{CastType, Row, Transformation};
