//! MCP tool definitions over the [`ToolDispatcher`].

use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData, ServerHandler,
};
use serde::{Deserialize, Serialize};

use kgraph_core::{ErrorKind, KgError};

use crate::dispatch::{ToolDispatcher, ToolOperation};

/// MCP server exposing graph, search and import operations.
#[derive(Clone)]
pub struct KgraphMcpService {
    dispatcher: Arc<ToolDispatcher>,
    tool_router: ToolRouter<Self>,
}

impl KgraphMcpService {
    pub fn new(dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            dispatcher,
            tool_router: Self::tool_router(),
        }
    }

    async fn call(&self, op: ToolOperation, params: &impl Serialize) -> Result<CallToolResult, ErrorData> {
        let args = serde_json::to_value(params).map_err(|e| ErrorData::invalid_params(e.to_string(), None))?;
        let value = self.dispatcher.dispatch(op, &args).await.map_err(to_error_data)?;
        Ok(CallToolResult::success(vec![Content::json(value)?]))
    }
}

fn to_error_data(err: KgError) -> ErrorData {
    let message = err.to_string();
    match err.kind() {
        ErrorKind::Validation => ErrorData::invalid_params(message, None),
        ErrorKind::NotFound => ErrorData::resource_not_found(message, None),
        _ => ErrorData::internal_error(message, None),
    }
}

// === Tool request types ===

/// Identifies a tenant and an item id.
#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ItemParams {
    /// Tenant id (letters, digits, '_' or '-')
    pub tenant: String,
    /// Store the tenant in its own schema instead of the shared tables
    #[serde(default)]
    pub separate_schema: bool,
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TenantParams {
    pub tenant: String,
    #[serde(default)]
    pub separate_schema: bool,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AddEntityParams {
    pub tenant: String,
    #[serde(default)]
    pub separate_schema: bool,
    /// Entity object: id, entity_type, properties, optional embedding
    pub entity: serde_json::Value,
    /// Overwrite an existing entity instead of failing
    #[serde(default)]
    pub upsert: bool,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AddRelationParams {
    pub tenant: String,
    #[serde(default)]
    pub separate_schema: bool,
    /// Defaults to `source:relation_type:target`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub relation_type: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub upsert: bool,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct BatchDeleteParams {
    pub tenant: String,
    #[serde(default)]
    pub separate_schema: bool,
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SearchParams {
    pub tenant: String,
    #[serde(default)]
    pub separate_schema: bool,
    /// Search request. `strategy` is one of vector, graph, hybrid, pagerank,
    /// multihop, filtered, traverse; `limit` and `rerank` are optional.
    pub request: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ImportParams {
    pub tenant: String,
    #[serde(default)]
    pub separate_schema: bool,
    /// CSV or JSON file to import
    pub path: String,
    /// Inline schema mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<serde_json::Value>,
    /// Mapping file (JSON or TOML), used when `mapping` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_path: Option<String>,
    /// auto, csv, json or json_lines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// upsert or bulk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_errors: Option<bool>,
}

#[tool_router]
impl KgraphMcpService {
    #[tool(description = "Create an entity (or replace it when upsert is true)")]
    async fn add_entity(&self, Parameters(req): Parameters<AddEntityParams>) -> Result<CallToolResult, ErrorData> {
        self.call(ToolOperation::AddEntity, &req).await
    }

    #[tool(description = "Read an entity by id")]
    async fn get_entity(&self, Parameters(req): Parameters<ItemParams>) -> Result<CallToolResult, ErrorData> {
        self.call(ToolOperation::GetEntity, &req).await
    }

    #[tool(description = "Delete an entity and every relation touching it")]
    async fn delete_entity(&self, Parameters(req): Parameters<ItemParams>) -> Result<CallToolResult, ErrorData> {
        self.call(ToolOperation::DeleteEntity, &req).await
    }

    #[tool(description = "Create a relation between two entities")]
    async fn add_relation(&self, Parameters(req): Parameters<AddRelationParams>) -> Result<CallToolResult, ErrorData> {
        self.call(ToolOperation::AddRelation, &req).await
    }

    #[tool(description = "Read a relation by id")]
    async fn get_relation(&self, Parameters(req): Parameters<ItemParams>) -> Result<CallToolResult, ErrorData> {
        self.call(ToolOperation::GetRelation, &req).await
    }

    #[tool(description = "Delete a relation by id")]
    async fn delete_relation(&self, Parameters(req): Parameters<ItemParams>) -> Result<CallToolResult, ErrorData> {
        self.call(ToolOperation::DeleteRelation, &req).await
    }

    #[tool(description = "Delete many entities at once; missing ids are ignored")]
    async fn batch_delete_entities(
        &self,
        Parameters(req): Parameters<BatchDeleteParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.call(ToolOperation::BatchDeleteEntities, &req).await
    }

    #[tool(description = "Search the graph with one of the retrieval strategies, optionally reranked")]
    async fn search(&self, Parameters(req): Parameters<SearchParams>) -> Result<CallToolResult, ErrorData> {
        self.call(ToolOperation::Search, &req).await
    }

    #[tool(description = "Import entities and relations from a CSV or JSON file through a schema mapping")]
    async fn import(&self, Parameters(req): Parameters<ImportParams>) -> Result<CallToolResult, ErrorData> {
        self.call(ToolOperation::Import, &req).await
    }

    #[tool(description = "Entity and relation counts for a tenant, by type")]
    async fn stats(&self, Parameters(req): Parameters<TenantParams>) -> Result<CallToolResult, ErrorData> {
        self.call(ToolOperation::Stats, &req).await
    }

    #[tool(description = "Index recommendations from the access patterns seen so far")]
    async fn index_advice(&self, Parameters(req): Parameters<TenantParams>) -> Result<CallToolResult, ErrorData> {
        self.call(ToolOperation::IndexAdvice, &req).await
    }
}

#[tool_handler]
impl ServerHandler for KgraphMcpService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Multi-tenant knowledge graph. Every tool takes a tenant id. Add and read entities and \
                 relations, search with vector, graph, hybrid, pagerank, multihop, filtered or traverse \
                 strategies, import CSV/JSON files and inspect statistics."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgraph_core::{EngineConfig, TenantContext};
    use kgraph_query::QueryEngine;
    use kgraph_store::{KnowledgeGraph, MemoryBackend};

    fn service() -> KgraphMcpService {
        let graph = Arc::new(KnowledgeGraph::new(Arc::new(MemoryBackend::default()), EngineConfig::default()));
        KgraphMcpService::new(Arc::new(ToolDispatcher::new(Arc::new(QueryEngine::new(graph)))))
    }

    #[test]
    fn every_operation_has_a_tool() {
        let tools = KgraphMcpService::tool_router().list_all();
        for op in ToolOperation::ALL {
            assert!(tools.iter().any(|t| t.name == op.as_str()), "no tool for {op}");
        }
        assert_eq!(tools.len(), ToolOperation::ALL.len());
    }

    #[tokio::test]
    async fn tool_params_reach_the_graph() {
        let service = service();
        let params = AddEntityParams {
            tenant: "acme".into(),
            separate_schema: false,
            entity: serde_json::json!({"id": "e1", "entity_type": "Node"}),
            upsert: false,
        };
        service.call(ToolOperation::AddEntity, &params).await.unwrap();
        let stored = service
            .dispatcher
            .graph()
            .get_entity(&TenantContext::shared("acme"), "e1")
            .await
            .unwrap();
        assert_eq!(stored.entity_type, "Node");
    }

    #[tokio::test]
    async fn missing_entity_maps_to_resource_not_found() {
        let params = ItemParams {
            tenant: "acme".into(),
            separate_schema: false,
            id: "ghost".into(),
        };
        let err = service().call(ToolOperation::GetEntity, &params).await.unwrap_err();
        assert_eq!(err.code, rmcp::model::ErrorCode::RESOURCE_NOT_FOUND);
    }
}
