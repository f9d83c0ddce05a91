//! Batched import of mapped rows into a [`KnowledgeGraph`].

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kgraph_core::{EngineConfig, KgError, Result, TenantContext, WriteMode};
use kgraph_store::KnowledgeGraph;

use crate::mapping::{RowOutput, SchemaMapping};
use crate::reader::{read_path, read_str, InputFormat, SourceData};
use crate::transform::Row;

/// How a batch reaches the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    /// One upsert per entity and relation.
    #[default]
    Upsert,
    /// One transaction per batch through the bulk write path.
    Bulk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOptions {
    pub batch_size: usize,
    pub mode: CommitMode,
    /// Record row errors and continue instead of aborting.
    pub skip_errors: bool,
    pub format: InputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_key: Option<String>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            mode: CommitMode::Upsert,
            skip_errors: true,
            format: InputFormat::Auto,
            array_key: None,
        }
    }
}

impl ImportOptions {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.import.batch_size,
            ..Self::default()
        }
    }
}

/// A row that could not be imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// 1-based data row number in the source.
    pub row: usize,
    pub message: String,
}

/// Counters after one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportProgress {
    pub batch: usize,
    pub rows_processed: usize,
    pub total_rows: usize,
    pub entities_added: usize,
    pub relations_added: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub entities_added: usize,
    pub relations_added: usize,
    pub rows_processed: usize,
    pub errors: Vec<RowError>,
    pub warnings: Vec<String>,
}

type ProgressFn = dyn Fn(&ImportProgress) + Send + Sync;

/// Imports CSV or JSON sources through a [`SchemaMapping`].
///
/// Rows are handled in source order, `batch_size` at a time. Within a batch
/// entities are written before relations, so a relation may point at an
/// entity from the same batch or any earlier one.
pub struct BatchLoader {
    graph: Arc<KnowledgeGraph>,
    mapping: SchemaMapping,
    options: ImportOptions,
    progress: Option<Box<ProgressFn>>,
}

impl BatchLoader {
    #[must_use]
    pub fn new(graph: Arc<KnowledgeGraph>, mapping: SchemaMapping) -> Self {
        let options = ImportOptions::from_config(graph.config());
        Self {
            graph,
            mapping,
            options,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ImportOptions) -> Self {
        self.options = options;
        self
    }

    /// Called after every committed batch.
    #[must_use]
    pub fn on_progress(mut self, callback: impl Fn(&ImportProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Import a file.
    ///
    /// # Errors
    ///
    /// Unreadable sources, invalid mappings, and with `skip_errors = false`
    /// the first row error. Batches committed before an error stay.
    pub async fn import_path(&self, ctx: &TenantContext, path: &Path) -> Result<ImportResult> {
        let data = read_path(path, self.options.format, self.options.array_key.as_deref()).await?;
        info!(path = %path.display(), rows = data.records.len(), "import started");
        self.run(ctx, data).await
    }

    /// Import in-memory text.
    ///
    /// # Errors
    ///
    /// See [`BatchLoader::import_path`].
    pub async fn import_str(&self, ctx: &TenantContext, text: &str) -> Result<ImportResult> {
        let data = read_str(text, self.options.format, self.options.array_key.as_deref())?;
        self.run(ctx, data).await
    }

    /// Import rows that are already parsed.
    ///
    /// # Errors
    ///
    /// See [`BatchLoader::import_path`].
    pub async fn import_rows(&self, ctx: &TenantContext, rows: Vec<Row>) -> Result<ImportResult> {
        self.run(ctx, SourceData::from_rows(rows)).await
    }

    async fn run(&self, ctx: &TenantContext, data: SourceData) -> Result<ImportResult> {
        let inner = async {
            self.mapping.validate()?;
            if self.options.batch_size == 0 {
                return Err(KgError::validation("batch_size", "must be at least 1"));
            }
            let mut result = ImportResult::default();
            for column in self.mapping.required_columns() {
                if !data.headers.contains(&column) {
                    warn!(column = %column, "mapped column missing from source");
                    result.warnings.push(format!("column '{column}' is not in the source header"));
                }
            }

            let total_rows = data.records.len();
            for (index, batch) in data.records.chunks(self.options.batch_size).enumerate() {
                let mut built: Vec<(usize, RowOutput)> = Vec::with_capacity(batch.len());
                for record in batch {
                    result.rows_processed += 1;
                    let output = record
                        .row
                        .as_ref()
                        .map_err(|message| KgError::validation("row", message.clone()))
                        .and_then(|row| self.mapping.build_row(row));
                    match output {
                        Ok(output) => built.push((record.line, output)),
                        Err(e) => self.row_failed(&mut result, record.line, e)?,
                    }
                }

                match self.options.mode {
                    CommitMode::Upsert => self.commit_rows(ctx, &built, &mut result).await?,
                    CommitMode::Bulk => self.commit_bulk(ctx, &built, &mut result).await?,
                }

                let progress = ImportProgress {
                    batch: index + 1,
                    rows_processed: result.rows_processed,
                    total_rows,
                    entities_added: result.entities_added,
                    relations_added: result.relations_added,
                    errors: result.errors.len(),
                };
                debug!(batch = progress.batch, rows = progress.rows_processed, "import batch committed");
                if let Some(ref callback) = self.progress {
                    callback(&progress);
                }
            }
            info!(
                rows = result.rows_processed,
                entities = result.entities_added,
                relations = result.relations_added,
                errors = result.errors.len(),
                "import finished"
            );
            Ok(result)
        };
        let fut = async { inner.await.map_err(|e| e.with_context("import", &ctx.tenant_id)) };
        self.graph
            .monitor()
            .track("import", Some(ctx.tenant_id.as_str()), fut, |r: &ImportResult| r.rows_processed)
            .await
    }

    fn row_failed(&self, result: &mut ImportResult, row: usize, error: KgError) -> Result<()> {
        if !self.options.skip_errors {
            return Err(KgError::validation("row", format!("row {row}: {error}")));
        }
        debug!(row, error = %error, "row skipped");
        result.errors.push(RowError {
            row,
            message: error.to_string(),
        });
        Ok(())
    }

    /// Per-row upserts: every row's entities, then every row's relations.
    async fn commit_rows(&self, ctx: &TenantContext, built: &[(usize, RowOutput)], result: &mut ImportResult) -> Result<()> {
        let mut failed: Vec<usize> = Vec::new();
        for (line, output) in built {
            for entity in &output.entities {
                match self.graph.upsert_entity(ctx, entity.clone()).await {
                    Ok(_) => result.entities_added += 1,
                    Err(e) => {
                        self.row_failed(result, *line, e)?;
                        failed.push(*line);
                        break;
                    }
                }
            }
        }
        for (line, output) in built.iter().filter(|(line, _)| !failed.contains(line)) {
            for relation in &output.relations {
                match self.graph.upsert_relation(ctx, relation.clone()).await {
                    Ok(_) => result.relations_added += 1,
                    Err(e) => {
                        self.row_failed(result, *line, e)?;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One bulk write per batch, falling back to per-row upserts when the
    /// batch fails and errors are being skipped.
    async fn commit_bulk(&self, ctx: &TenantContext, built: &[(usize, RowOutput)], result: &mut ImportResult) -> Result<()> {
        let entities: Vec<_> = built.iter().flat_map(|(_, o)| o.entities.iter().cloned()).collect();
        let relations: Vec<_> = built.iter().flat_map(|(_, o)| o.relations.iter().cloned()).collect();
        let bulk = async {
            let e = if entities.is_empty() {
                0
            } else {
                self.graph.batch_add_entities(ctx, entities, WriteMode::Upsert).await?
            };
            let r = if relations.is_empty() {
                0
            } else {
                self.graph.batch_add_relations(ctx, relations, WriteMode::Upsert).await?
            };
            Ok::<_, KgError>((e, r))
        };
        match bulk.await {
            Ok((e, r)) => {
                result.entities_added += e;
                result.relations_added += r;
                Ok(())
            }
            Err(e) if self.options.skip_errors => {
                warn!(error = %e, "bulk batch failed, retrying row by row");
                self.commit_rows(ctx, built, result).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use kgraph_core::Entity;
    use kgraph_store::MemoryBackend;

    use crate::mapping::{EntityMapping, RelationMapping};
    use crate::transform::{CastType, Transformation};

    fn graph() -> Arc<KnowledgeGraph> {
        Arc::new(KnowledgeGraph::new(Arc::new(MemoryBackend::default()), EngineConfig::default()))
    }

    fn mapping() -> SchemaMapping {
        SchemaMapping {
            entities: vec![EntityMapping {
                entity_type: "Person".into(),
                id_column: "id".into(),
                source_columns: vec!["id".into(), "name".into(), "age".into()],
                property_mapping: BTreeMap::new(),
                transformations: vec![Transformation::Cast {
                    column: "age".into(),
                    to: CastType::Integer,
                }],
                embedding_column: None,
            }],
            relations: vec![RelationMapping {
                relation_type: "WORKS_FOR".into(),
                source_entity_column: "id".into(),
                target_entity_column: "company".into(),
                id_column: None,
                weight_column: None,
                source_columns: Vec::new(),
                property_mapping: BTreeMap::new(),
            }],
        }
    }

    const PEOPLE: &str = "id,name,age,company\np1,Ada,36,acme\np2,Grace,unknown,acme\np3,Linus,28,globex\n";

    #[tokio::test]
    async fn malformed_row_is_recorded_and_skipped() {
        let graph = graph();
        let ctx = TenantContext::shared("acme");
        let result = BatchLoader::new(graph.clone(), mapping())
            .import_str(&ctx, PEOPLE)
            .await
            .unwrap();
        assert_eq!(result.rows_processed, 3);
        assert_eq!(result.entities_added, 2);
        assert_eq!(result.relations_added, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].row, 2);
        assert!(graph.get_entity(&ctx, "p2").await.is_err());
    }

    #[tokio::test]
    async fn abort_keeps_committed_batches() {
        let graph = graph();
        let ctx = TenantContext::shared("acme");
        let options = ImportOptions {
            batch_size: 1,
            skip_errors: false,
            ..ImportOptions::default()
        };
        let err = BatchLoader::new(graph.clone(), mapping())
            .with_options(options)
            .import_str(&ctx, PEOPLE)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("row 2"));
        assert!(graph.get_entity(&ctx, "p1").await.is_ok());
        assert!(graph.get_entity(&ctx, "p3").await.is_err());
    }

    #[tokio::test]
    async fn reimport_is_idempotent() {
        let graph = graph();
        let ctx = TenantContext::shared("acme");
        for mode in [CommitMode::Upsert, CommitMode::Bulk, CommitMode::Upsert] {
            let loader = BatchLoader::new(graph.clone(), mapping()).with_options(ImportOptions {
                mode,
                ..ImportOptions::default()
            });
            let result = loader.import_str(&ctx, PEOPLE).await.unwrap();
            assert_eq!(result.entities_added, 2);
            let stats = graph.stats(&ctx).await.unwrap();
            assert_eq!(stats.entity_count, 2);
            assert_eq!(stats.relation_count, 2);
        }
    }

    #[tokio::test]
    async fn progress_reported_per_batch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = ImportOptions {
            batch_size: 2,
            ..ImportOptions::default()
        };
        BatchLoader::new(graph(), mapping())
            .with_options(options)
            .on_progress(move |p| sink.lock().unwrap().push((p.batch, p.rows_processed)))
            .import_str(&TenantContext::shared("acme"), PEOPLE)
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 2), (2, 3)]);
    }

    #[tokio::test]
    async fn missing_columns_are_warned() {
        let result = BatchLoader::new(graph(), mapping())
            .import_str(&TenantContext::shared("acme"), "id,name,company\np1,Ada,acme\n")
            .await
            .unwrap();
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("age"));
        assert_eq!(result.entities_added, 1);
    }

    #[tokio::test]
    async fn import_rows_accepts_parsed_json() {
        let graph = graph();
        let ctx = TenantContext::shared("acme");
        let rows: Vec<Row> = serde_json::from_str(r#"[{"id": "p9", "name": "Barbara", "age": 81, "company": "mit"}]"#).unwrap();
        let result = BatchLoader::new(graph.clone(), mapping())
            .import_rows(&ctx, rows)
            .await
            .unwrap();
        assert_eq!(result.entities_added, 1);
        let stored: Entity = graph.get_entity(&ctx, "p9").await.unwrap();
        assert_eq!(stored.properties["age"], serde_json::json!(81));
    }
}
