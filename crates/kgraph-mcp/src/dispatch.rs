//! Name-based tool dispatch over the graph, query engine and importer.
//!
//! Every call takes a JSON object with a `tenant` id (and optional
//! `separate_schema` flag) plus operation-specific fields, and returns JSON.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use kgraph_core::{Entity, KgError, Properties, Relation, Result, TenantContext, WriteMode};
use kgraph_import::{BatchLoader, CommitMode, ImportOptions, InputFormat, SchemaMapping};
use kgraph_query::{IndexAdvisor, QueryEngine, SearchRequest};
use kgraph_store::KnowledgeGraph;

/// The closed set of tool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOperation {
    AddEntity,
    GetEntity,
    DeleteEntity,
    AddRelation,
    GetRelation,
    DeleteRelation,
    BatchDeleteEntities,
    Search,
    Import,
    Stats,
    IndexAdvice,
}

impl ToolOperation {
    pub const ALL: [Self; 11] = [
        Self::AddEntity,
        Self::GetEntity,
        Self::DeleteEntity,
        Self::AddRelation,
        Self::GetRelation,
        Self::DeleteRelation,
        Self::BatchDeleteEntities,
        Self::Search,
        Self::Import,
        Self::Stats,
        Self::IndexAdvice,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddEntity => "add_entity",
            Self::GetEntity => "get_entity",
            Self::DeleteEntity => "delete_entity",
            Self::AddRelation => "add_relation",
            Self::GetRelation => "get_relation",
            Self::DeleteRelation => "delete_relation",
            Self::BatchDeleteEntities => "batch_delete_entities",
            Self::Search => "search",
            Self::Import => "import",
            Self::Stats => "stats",
            Self::IndexAdvice => "index_advice",
        }
    }
}

impl fmt::Display for ToolOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolOperation {
    type Err = KgError;

    fn from_str(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == name)
            .ok_or_else(|| KgError::validation("tool", format!("unknown tool '{name}'")))
    }
}

// === Arguments ===

#[derive(Debug, Deserialize)]
struct TenantArgs {
    tenant: String,
    #[serde(default)]
    separate_schema: bool,
}

impl TenantArgs {
    fn context(&self) -> TenantContext {
        if self.separate_schema {
            TenantContext::separate(self.tenant.clone())
        } else {
            TenantContext::shared(self.tenant.clone())
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdArgs {
    id: String,
}

#[derive(Debug, Deserialize)]
struct IdsArgs {
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EntityArgs {
    entity: Entity,
    #[serde(default)]
    upsert: bool,
}

#[derive(Debug, Deserialize)]
struct RelationArgs {
    #[serde(default)]
    id: Option<String>,
    relation_type: String,
    source_id: String,
    target_id: String,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    upsert: bool,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    request: Value,
}

#[derive(Debug, Deserialize)]
struct ImportArgs {
    path: PathBuf,
    #[serde(default)]
    mapping: Option<SchemaMapping>,
    #[serde(default)]
    mapping_path: Option<PathBuf>,
    #[serde(default)]
    format: InputFormat,
    #[serde(default)]
    array_key: Option<String>,
    #[serde(default)]
    mode: CommitMode,
    #[serde(default)]
    skip_errors: Option<bool>,
    #[serde(default)]
    batch_size: Option<usize>,
}

fn parse<T: DeserializeOwned>(op: ToolOperation, args: &Value) -> Result<T> {
    T::deserialize(args).map_err(|e| KgError::validation(op.as_str(), e.to_string()))
}

/// Routes tool calls to the engine.
pub struct ToolDispatcher {
    engine: Arc<QueryEngine>,
    advisor: IndexAdvisor,
}

impl ToolDispatcher {
    #[must_use]
    pub fn new(engine: Arc<QueryEngine>) -> Self {
        Self {
            engine,
            advisor: IndexAdvisor::default(),
        }
    }

    #[must_use]
    pub fn with_advisor(mut self, advisor: IndexAdvisor) -> Self {
        self.advisor = advisor;
        self
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<KnowledgeGraph> {
        self.engine.graph()
    }

    /// Invoke a tool by name.
    ///
    /// # Errors
    ///
    /// [`KgError::Validation`] for unknown names or malformed arguments,
    /// otherwise whatever the operation returns.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value> {
        let op: ToolOperation = name.parse()?;
        self.dispatch(op, &args).await
    }

    /// # Errors
    ///
    /// See [`ToolDispatcher::invoke`].
    pub async fn dispatch(&self, op: ToolOperation, args: &Value) -> Result<Value> {
        let ctx = parse::<TenantArgs>(op, args)?.context();
        debug!(tool = %op, tenant = %ctx.tenant_id, "tool invoked");
        let graph = self.graph();
        match op {
            ToolOperation::AddEntity => {
                let a: EntityArgs = parse(op, args)?;
                let stored = if a.upsert {
                    graph.upsert_entity(&ctx, a.entity).await?
                } else {
                    graph.add_entity(&ctx, a.entity).await?
                };
                Ok(serde_json::to_value(stored)?)
            }
            ToolOperation::GetEntity => {
                let a: IdArgs = parse(op, args)?;
                Ok(serde_json::to_value(graph.get_entity(&ctx, &a.id).await?)?)
            }
            ToolOperation::DeleteEntity => {
                let a: IdArgs = parse(op, args)?;
                graph.delete_entity(&ctx, &a.id).await?;
                Ok(json!({ "deleted": a.id }))
            }
            ToolOperation::AddRelation => {
                let a: RelationArgs = parse(op, args)?;
                let id = a
                    .id
                    .unwrap_or_else(|| Relation::derive_id(&a.source_id, &a.relation_type, &a.target_id));
                let mut relation = Relation::new(id, a.relation_type, a.source_id, a.target_id);
                relation.properties = a.properties;
                if let Some(w) = a.weight {
                    relation = relation.with_weight(w);
                }
                let stored = if a.upsert {
                    graph.upsert_relation(&ctx, relation).await?
                } else {
                    graph.add_relation(&ctx, relation).await?
                };
                Ok(serde_json::to_value(stored)?)
            }
            ToolOperation::GetRelation => {
                let a: IdArgs = parse(op, args)?;
                Ok(serde_json::to_value(graph.get_relation(&ctx, &a.id).await?)?)
            }
            ToolOperation::DeleteRelation => {
                let a: IdArgs = parse(op, args)?;
                graph.delete_relation(&ctx, &a.id).await?;
                Ok(json!({ "deleted": a.id }))
            }
            ToolOperation::BatchDeleteEntities => {
                let a: IdsArgs = parse(op, args)?;
                let removed = graph.batch_delete_entities(&ctx, &a.ids).await?;
                Ok(json!({ "requested": a.ids.len(), "deleted": removed }))
            }
            ToolOperation::Search => {
                let a: SearchArgs = parse(op, args)?;
                let request = SearchRequest::from_json(a.request)?;
                Ok(serde_json::to_value(self.engine.search(&ctx, &request).await?)?)
            }
            ToolOperation::Import => {
                let a: ImportArgs = parse(op, args)?;
                let mapping = match (a.mapping, a.mapping_path) {
                    (Some(m), _) => {
                        m.validate()?;
                        m
                    }
                    (None, Some(path)) => SchemaMapping::load(&path)?,
                    (None, None) => return Err(KgError::validation("mapping", "mapping or mapping_path is required")),
                };
                let defaults = ImportOptions::from_config(graph.config());
                let options = ImportOptions {
                    batch_size: a.batch_size.unwrap_or(defaults.batch_size),
                    mode: a.mode,
                    skip_errors: a.skip_errors.unwrap_or(defaults.skip_errors),
                    format: a.format,
                    array_key: a.array_key,
                };
                let result = BatchLoader::new(Arc::clone(graph), mapping)
                    .with_options(options)
                    .import_path(&ctx, &a.path)
                    .await?;
                Ok(serde_json::to_value(result)?)
            }
            ToolOperation::Stats => {
                let stats = graph.stats(&ctx).await?;
                let mut value = serde_json::to_value(&stats)?;
                if let Value::Object(ref mut map) = value {
                    map.insert("avg_out_degree".into(), json!(stats.avg_out_degree()));
                }
                Ok(value)
            }
            ToolOperation::IndexAdvice => {
                let report = self.engine.index_advice(&ctx, &self.advisor).await?;
                Ok(serde_json::to_value(report)?)
            }
        }
    }
}
