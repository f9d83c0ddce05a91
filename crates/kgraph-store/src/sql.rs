//! SQLite statements shared by the file-backed and relational backends.
//!
//! Both backends run the same SQL; they differ in how a connection is
//! obtained ([`SqlExecutor`]) and whether the native vector index is on.
//! Shared-schema scopes bind `tenant_id = ?` into every predicate and insert.
//! Namespaced scopes address `<ns>__graph_entities` and
//! `<ns>__graph_relations`, which have no tenant column.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, info};
use zerocopy::{FromBytes, IntoBytes};

use kgraph_core::{
    cosine_similarity, BackendKind, Direction, Entity, ItemKind, KgError, Properties, Relation, Result,
    WriteMode,
};

use crate::backend::{
    builtin_indexes, rank_top_k, GraphQuery, GraphStats, IndexDefinition, IndexInfo, IndexTable, Scope,
    StorageBackend,
};

/// Upper bound on ids bound into a single `IN (...)` list.
const IN_CHUNK: usize = 500;

static NAMESPACE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]{1,72}$").expect("static regex is valid"));

const ENTITY_COLUMNS: [&str; 6] = ["id", "entity_type", "properties", "embedding", "created_at", "updated_at"];
const RELATION_COLUMNS: [&str; 8] = [
    "id",
    "relation_type",
    "source_id",
    "target_id",
    "properties",
    "weight",
    "created_at",
    "updated_at",
];

// ---------------------------------------------------------------------------
// Errors and encoding
// ---------------------------------------------------------------------------

/// Classify a SQLite failure. Busy and locked databases are retryable.
pub(crate) fn map_sql_error(err: rusqlite::Error) -> KgError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            KgError::TransientBackend(err.to_string())
        }
        _ => KgError::Backend(err.to_string()),
    }
}

fn is_primary_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Embeddings are stored as packed native-endian `f32` (little-endian on every supported target).
pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.as_bytes().to_vec()
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(KgError::Serialization(format!(
            "embedding blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            f32::read_from_bytes(chunk)
                .map_err(|_| KgError::Serialization("truncated embedding component".to_string()))
        })
        .collect()
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KgError::Serialization(format!("bad timestamp '{raw}': {e}")))
}

fn parse_properties(raw: &str) -> Result<Properties> {
    Ok(serde_json::from_str(raw)?)
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Physical table names for one scope.
#[derive(Debug, Clone)]
pub(crate) struct Tables {
    pub entities: String,
    pub relations: String,
    /// sqlite-vec table mirroring entity embeddings, when the native index is on.
    pub vectors: Option<String>,
    /// Prefix for index names: empty for shared tables, `<ns>__` otherwise.
    pub prefix: String,
    tenant: Option<String>,
    partition: String,
}

impl Tables {
    pub fn for_scope(scope: &Scope, native_vectors: bool) -> Self {
        let prefix = scope.namespace().map(|ns| format!("{ns}__")).unwrap_or_default();
        Self {
            entities: format!("{prefix}graph_entities"),
            relations: format!("{prefix}graph_relations"),
            vectors: native_vectors.then(|| format!("{prefix}graph_entity_vectors")),
            tenant: scope.tenant_filter().map(str::to_string),
            partition: scope.partition_key(),
            prefix,
        }
    }

    fn has_tenant(&self) -> bool {
        self.tenant.is_some()
    }

    fn key_columns(&self) -> &'static str {
        if self.has_tenant() {
            "tenant_id, id"
        } else {
            "id"
        }
    }
}

/// `WHERE` clause assembled from positional `?` predicates.
struct Filter {
    alias: &'static str,
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Filter {
    /// A filter pre-loaded with the tenant predicate, if any.
    fn scoped(tables: &Tables, alias: &'static str) -> Self {
        let mut filter = Self {
            alias,
            clauses: Vec::new(),
            params: Vec::new(),
        };
        if let Some(ref tenant) = tables.tenant {
            filter.push("tenant_id = ?", [Value::Text(tenant.clone())]);
        }
        filter
    }

    /// Add a predicate. Column names in `clause` get the filter's alias.
    fn push(&mut self, clause: &str, params: impl IntoIterator<Item = Value>) {
        self.clauses.push(format!("{}{clause}", self.alias));
        self.params.extend(params);
    }

    fn push_raw(&mut self, clause: String, params: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause);
        self.params.extend(params);
    }

    fn push_in(&mut self, column: &str, ids: &[String]) {
        let marks = vec!["?"; ids.len()].join(", ");
        self.push(&format!("{column} IN ({marks})"), ids.iter().cloned().map(Value::Text));
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn columns(cols: &[&str], alias: &str) -> String {
    cols.iter().map(|c| format!("{alias}{c}")).collect::<Vec<_>>().join(", ")
}

fn shared_ddl() -> String {
    "
    CREATE TABLE IF NOT EXISTS graph_entities (
        tenant_id   TEXT NOT NULL,
        id          TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        properties  TEXT NOT NULL DEFAULT '{}',
        embedding   BLOB,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        PRIMARY KEY (tenant_id, id)
    );

    CREATE TABLE IF NOT EXISTS graph_relations (
        tenant_id     TEXT NOT NULL,
        id            TEXT NOT NULL,
        relation_type TEXT NOT NULL,
        source_id     TEXT NOT NULL,
        target_id     TEXT NOT NULL,
        properties    TEXT NOT NULL DEFAULT '{}',
        weight        REAL NOT NULL DEFAULT 1.0,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL,
        PRIMARY KEY (tenant_id, id),
        FOREIGN KEY (tenant_id, source_id) REFERENCES graph_entities(tenant_id, id) ON DELETE CASCADE,
        FOREIGN KEY (tenant_id, target_id) REFERENCES graph_entities(tenant_id, id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_graph_entities_tenant ON graph_entities(tenant_id);
    CREATE INDEX IF NOT EXISTS idx_graph_entities_tenant_type ON graph_entities(tenant_id, entity_type);
    CREATE INDEX IF NOT EXISTS idx_graph_relations_tenant_source ON graph_relations(tenant_id, source_id);
    CREATE INDEX IF NOT EXISTS idx_graph_relations_tenant_target ON graph_relations(tenant_id, target_id);

    CREATE TABLE IF NOT EXISTS graph_index_catalog (
        partition  TEXT NOT NULL,
        name       TEXT NOT NULL,
        definition TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (partition, name)
    );
    "
    .to_string()
}

fn namespace_ddl(ns: &str) -> String {
    format!(
        "
    CREATE TABLE IF NOT EXISTS {ns}__graph_entities (
        id          TEXT NOT NULL PRIMARY KEY,
        entity_type TEXT NOT NULL,
        properties  TEXT NOT NULL DEFAULT '{{}}',
        embedding   BLOB,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS {ns}__graph_relations (
        id            TEXT NOT NULL PRIMARY KEY,
        relation_type TEXT NOT NULL,
        source_id     TEXT NOT NULL REFERENCES {ns}__graph_entities(id) ON DELETE CASCADE,
        target_id     TEXT NOT NULL REFERENCES {ns}__graph_entities(id) ON DELETE CASCADE,
        properties    TEXT NOT NULL DEFAULT '{{}}',
        weight        REAL NOT NULL DEFAULT 1.0,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS {ns}__idx_graph_entities_type ON {ns}__graph_entities(entity_type);
    CREATE INDEX IF NOT EXISTS {ns}__idx_graph_relations_source ON {ns}__graph_relations(source_id);
    CREATE INDEX IF NOT EXISTS {ns}__idx_graph_relations_target ON {ns}__graph_relations(target_id);
    "
    )
}

/// sqlite-vec mirror of `entities`, kept in sync by a delete trigger.
fn vector_ddl(prefix: &str, dimension: usize) -> String {
    format!(
        "
    CREATE VIRTUAL TABLE IF NOT EXISTS {prefix}graph_entity_vectors USING vec0(embedding float[{dimension}]);

    CREATE TRIGGER IF NOT EXISTS {prefix}graph_entity_vectors_ad AFTER DELETE ON {prefix}graph_entities BEGIN
        DELETE FROM {prefix}graph_entity_vectors WHERE rowid = old.rowid;
    END;
    "
    )
}

/// Apply per-connection pragmas. Foreign keys are off by default in SQLite.
pub(crate) fn configure_connection(conn: &Connection, busy_timeout: std::time::Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout).map_err(map_sql_error)?;
    conn.pragma_update(None, "foreign_keys", "ON").map_err(map_sql_error)?;
    let mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .map_err(map_sql_error)?;
    debug!(journal_mode = %mode, "sqlite connection configured");
    conn.pragma_update(None, "synchronous", "NORMAL").map_err(map_sql_error)?;
    Ok(())
}

/// Create the shared tables (and the shared vector mirror when enabled).
pub(crate) fn create_shared_schema(conn: &Connection, vector_dimension: Option<usize>) -> Result<()> {
    conn.execute_batch(&shared_ddl()).map_err(map_sql_error)?;
    if let Some(dim) = vector_dimension {
        conn.execute_batch(&vector_ddl("", dim)).map_err(map_sql_error)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

struct EntityRow {
    id: String,
    entity_type: String,
    properties: String,
    embedding: Option<Vec<u8>>,
    created_at: String,
    updated_at: String,
}

impl EntityRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            properties: row.get(2)?,
            embedding: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_entity(self) -> Result<Entity> {
        Ok(Entity {
            properties: parse_properties(&self.properties)?,
            embedding: self.embedding.as_deref().map(decode_embedding).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            entity_type: self.entity_type,
        })
    }
}

struct RelationRow {
    id: String,
    relation_type: String,
    source_id: String,
    target_id: String,
    properties: String,
    weight: f64,
    created_at: String,
    updated_at: String,
}

impl RelationRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            relation_type: row.get(1)?,
            source_id: row.get(2)?,
            target_id: row.get(3)?,
            properties: row.get(4)?,
            weight: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_relation(self) -> Result<Relation> {
        Ok(Relation {
            properties: parse_properties(&self.properties)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            relation_type: self.relation_type,
            source_id: self.source_id,
            target_id: self.target_id,
            weight: self.weight,
        })
    }
}

fn select_entities(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Entity>> {
    let mut stmt = conn.prepare_cached(sql).map_err(map_sql_error)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), EntityRow::read)
        .map_err(map_sql_error)?;
    rows.map(|r| r.map_err(map_sql_error).and_then(EntityRow::into_entity))
        .collect()
}

fn select_relations(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Relation>> {
    let mut stmt = conn.prepare_cached(sql).map_err(map_sql_error)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), RelationRow::read)
        .map_err(map_sql_error)?;
    rows.map(|r| r.map_err(map_sql_error).and_then(RelationRow::into_relation))
        .collect()
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

fn stored_created_at(conn: &Connection, t: &Tables, table: &str, id: &str) -> Result<Option<String>> {
    let mut filter = Filter::scoped(t, "");
    filter.push("id = ?", [Value::Text(id.to_string())]);
    let sql = format!("SELECT created_at FROM {table}{}", filter.where_sql());
    conn.query_row(&sql, params_from_iter(filter.params.iter()), |row| row.get(0))
        .optional()
        .map_err(map_sql_error)
}

fn entity_exists(conn: &Connection, t: &Tables, id: &str) -> Result<bool> {
    Ok(stored_created_at(conn, t, &t.entities, id)?.is_some())
}

fn insert_sql(t: &Tables, table: &str, cols: &[&str], update: &[&str], mode: WriteMode) -> String {
    let mut all: Vec<&str> = Vec::with_capacity(cols.len() + 1);
    if t.has_tenant() {
        all.push("tenant_id");
    }
    all.extend_from_slice(cols);
    let marks = vec!["?"; all.len()].join(", ");
    let mut sql = format!("INSERT INTO {table} ({}) VALUES ({marks})", all.join(", "));
    if mode == WriteMode::Upsert {
        let sets: Vec<String> = update.iter().map(|c| format!("{c} = excluded.{c}")).collect();
        sql.push_str(&format!(
            " ON CONFLICT({}) DO UPDATE SET {}",
            t.key_columns(),
            sets.join(", ")
        ));
    }
    sql
}

fn with_tenant(t: &Tables, mut values: Vec<Value>) -> Vec<Value> {
    if let Some(ref tenant) = t.tenant {
        values.insert(0, Value::Text(tenant.clone()));
    }
    values
}

/// Insert or upsert one entity. Upserts keep the stored `created_at`.
pub(crate) fn write_entity(conn: &Connection, t: &Tables, mut entity: Entity, mode: WriteMode) -> Result<Entity> {
    if let Some(created) = stored_created_at(conn, t, &t.entities, &entity.id)? {
        if mode == WriteMode::Insert {
            return Err(KgError::conflict(ItemKind::Entity, entity.id));
        }
        entity.created_at = parse_ts(&created)?;
    }

    let sql = insert_sql(
        t,
        &t.entities,
        &ENTITY_COLUMNS,
        &["entity_type", "properties", "embedding", "updated_at"],
        mode,
    );
    let values = with_tenant(
        t,
        vec![
            Value::Text(entity.id.clone()),
            Value::Text(entity.entity_type.clone()),
            Value::Text(serde_json::to_string(&entity.properties)?),
            entity
                .embedding
                .as_deref()
                .map_or(Value::Null, |e| Value::Blob(encode_embedding(e))),
            Value::Text(format_ts(&entity.created_at)),
            Value::Text(format_ts(&entity.updated_at)),
        ],
    );
    conn.prepare_cached(&sql)
        .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())))
        .map_err(|e| {
            if is_primary_key_violation(&e) {
                KgError::conflict(ItemKind::Entity, entity.id.clone())
            } else {
                map_sql_error(e)
            }
        })?;

    if let Some(ref vectors) = t.vectors {
        sync_vector(conn, t, vectors, &entity)?;
    }
    Ok(entity)
}

/// Mirror one entity's embedding into the sqlite-vec table.
fn sync_vector(conn: &Connection, t: &Tables, vectors: &str, entity: &Entity) -> Result<()> {
    let mut filter = Filter::scoped(t, "");
    filter.push("id = ?", [Value::Text(entity.id.clone())]);
    let sql = format!("SELECT rowid FROM {}{}", t.entities, filter.where_sql());
    let rowid: i64 = conn
        .query_row(&sql, params_from_iter(filter.params.iter()), |row| row.get(0))
        .map_err(map_sql_error)?;

    conn.execute(&format!("DELETE FROM {vectors} WHERE rowid = ?"), [rowid])
        .map_err(map_sql_error)?;
    if let Some(ref embedding) = entity.embedding {
        let mut unit = embedding.clone();
        kgraph_core::embedding::normalize(&mut unit);
        conn.execute(
            &format!("INSERT INTO {vectors}(rowid, embedding) VALUES (?, ?)"),
            rusqlite::params![rowid, encode_embedding(&unit)],
        )
        .map_err(map_sql_error)?;
    }
    Ok(())
}

/// Insert or upsert one relation after checking both endpoints exist.
pub(crate) fn write_relation(
    conn: &Connection,
    t: &Tables,
    mut relation: Relation,
    mode: WriteMode,
) -> Result<Relation> {
    for endpoint in [&relation.source_id, &relation.target_id] {
        if !entity_exists(conn, t, endpoint)? {
            return Err(KgError::entity_not_found(endpoint.clone()));
        }
    }
    if let Some(created) = stored_created_at(conn, t, &t.relations, &relation.id)? {
        if mode == WriteMode::Insert {
            return Err(KgError::conflict(ItemKind::Relation, relation.id));
        }
        relation.created_at = parse_ts(&created)?;
    }

    let sql = insert_sql(
        t,
        &t.relations,
        &RELATION_COLUMNS,
        &[
            "relation_type",
            "source_id",
            "target_id",
            "properties",
            "weight",
            "updated_at",
        ],
        mode,
    );
    let values = with_tenant(
        t,
        vec![
            Value::Text(relation.id.clone()),
            Value::Text(relation.relation_type.clone()),
            Value::Text(relation.source_id.clone()),
            Value::Text(relation.target_id.clone()),
            Value::Text(serde_json::to_string(&relation.properties)?),
            Value::Real(relation.weight),
            Value::Text(format_ts(&relation.created_at)),
            Value::Text(format_ts(&relation.updated_at)),
        ],
    );
    conn.prepare_cached(&sql)
        .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())))
        .map_err(|e| {
            if is_primary_key_violation(&e) {
                KgError::conflict(ItemKind::Relation, relation.id.clone())
            } else {
                map_sql_error(e)
            }
        })?;
    Ok(relation)
}

pub(crate) fn get_entities(conn: &Connection, t: &Tables, ids: &[String]) -> Result<Vec<Entity>> {
    let unique: Vec<String> = ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
    let mut found = Vec::with_capacity(unique.len());
    for chunk in unique.chunks(IN_CHUNK) {
        let mut filter = Filter::scoped(t, "");
        filter.push_in("id", chunk);
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY id",
            columns(&ENTITY_COLUMNS, ""),
            t.entities,
            filter.where_sql()
        );
        found.extend(select_entities(conn, &sql, &filter.params)?);
    }
    Ok(found)
}

pub(crate) fn get_entity(conn: &Connection, t: &Tables, id: &str) -> Result<Entity> {
    get_entities(conn, t, &[id.to_string()])?
        .pop()
        .ok_or_else(|| KgError::entity_not_found(id))
}

pub(crate) fn get_relation(conn: &Connection, t: &Tables, id: &str) -> Result<Relation> {
    let mut filter = Filter::scoped(t, "");
    filter.push("id = ?", [Value::Text(id.to_string())]);
    let sql = format!(
        "SELECT {} FROM {}{}",
        columns(&RELATION_COLUMNS, ""),
        t.relations,
        filter.where_sql()
    );
    select_relations(conn, &sql, &filter.params)?
        .pop()
        .ok_or_else(|| KgError::relation_not_found(id))
}

fn delete_by_id(conn: &Connection, t: &Tables, table: &str, id: &str) -> Result<usize> {
    let mut filter = Filter::scoped(t, "");
    filter.push("id = ?", [Value::Text(id.to_string())]);
    let sql = format!("DELETE FROM {table}{}", filter.where_sql());
    conn.prepare_cached(&sql)
        .and_then(|mut stmt| stmt.execute(params_from_iter(filter.params.iter())))
        .map_err(map_sql_error)
}

/// Delete an entity; relations go with it through `ON DELETE CASCADE`.
pub(crate) fn delete_entity(conn: &Connection, t: &Tables, id: &str) -> Result<()> {
    match delete_by_id(conn, t, &t.entities, id)? {
        0 => Err(KgError::entity_not_found(id)),
        _ => Ok(()),
    }
}

pub(crate) fn delete_relation(conn: &Connection, t: &Tables, id: &str) -> Result<()> {
    match delete_by_id(conn, t, &t.relations, id)? {
        0 => Err(KgError::relation_not_found(id)),
        _ => Ok(()),
    }
}

pub(crate) fn batch_delete_entities(conn: &Connection, t: &Tables, ids: &[String]) -> Result<usize> {
    let unique: BTreeSet<&String> = ids.iter().collect();
    let mut removed = 0;
    for id in unique {
        removed += delete_by_id(conn, t, &t.entities, id)?;
    }
    Ok(removed)
}

/// Bind a JSON equality test on one property. Type is compared too, so
/// `true` never matches `1` and `1` never matches `1.0`.
fn push_property_eq(filter: &mut Filter, key: &str, value: &serde_json::Value) -> Result<()> {
    let path = Value::Text(format!("$.\"{key}\""));
    let (json_type, bound) = match value {
        serde_json::Value::Null => ("null", None),
        serde_json::Value::Bool(true) => ("true", None),
        serde_json::Value::Bool(false) => ("false", None),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => ("integer", Some(Value::Integer(i))),
            None => ("real", Some(Value::Real(n.as_f64().unwrap_or(f64::NAN)))),
        },
        serde_json::Value::String(s) => ("text", Some(Value::Text(s.clone()))),
        serde_json::Value::Array(_) => ("array", Some(Value::Text(serde_json::to_string(value)?))),
        serde_json::Value::Object(_) => ("object", Some(Value::Text(serde_json::to_string(value)?))),
    };
    filter.push_raw(
        "json_type(properties, ?) = ?".to_string(),
        [path.clone(), Value::Text(json_type.to_string())],
    );
    if let Some(bound) = bound {
        filter.push_raw("json_extract(properties, ?) = ?".to_string(), [path, bound]);
    }
    Ok(())
}

pub(crate) fn query(conn: &Connection, t: &Tables, query: &GraphQuery) -> Result<Vec<Entity>> {
    query.validate()?;
    let mut filter = Filter::scoped(t, "");
    if let Some(ref entity_type) = query.entity_type {
        filter.push("entity_type = ?", [Value::Text(entity_type.clone())]);
    }
    for (key, value) in &query.properties {
        push_property_eq(&mut filter, key, value)?;
    }

    match query.ids {
        Some(ref ids) if ids.len() > IN_CHUNK => {
            // Too many ids to bind at once: filter in Rust after the id lookup.
            let mut hits: Vec<Entity> = get_entities(conn, t, ids)?
                .into_iter()
                .filter(|e| query.matches(e))
                .collect();
            hits = hits.into_iter().skip(query.offset).collect();
            if let Some(limit) = query.limit {
                hits.truncate(limit);
            }
            return Ok(hits);
        }
        Some(ref ids) => filter.push_in("id", ids),
        None => {}
    }

    let limit = query.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
    let offset = i64::try_from(query.offset).unwrap_or(i64::MAX);
    let sql = format!(
        "SELECT {} FROM {}{} ORDER BY id LIMIT ? OFFSET ?",
        columns(&ENTITY_COLUMNS, ""),
        t.entities,
        filter.where_sql()
    );
    let mut params = filter.params;
    params.push(Value::Integer(limit));
    params.push(Value::Integer(offset));
    select_entities(conn, &sql, &params)
}

pub(crate) fn relations_for(conn: &Connection, t: &Tables, ids: &[String], direction: Direction) -> Result<Vec<Relation>> {
    let unique: Vec<String> = ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
    let mut found: BTreeMap<String, Relation> = BTreeMap::new();
    for chunk in unique.chunks(IN_CHUNK) {
        let marks = vec!["?"; chunk.len()].join(", ");
        let mut filter = Filter::scoped(t, "");
        let ids = chunk.iter().cloned().map(Value::Text);
        match direction {
            Direction::Outgoing => filter.push_raw(format!("source_id IN ({marks})"), ids),
            Direction::Incoming => filter.push_raw(format!("target_id IN ({marks})"), ids),
            Direction::Both => filter.push_raw(
                format!("(source_id IN ({marks}) OR target_id IN ({marks}))"),
                ids.clone().chain(ids),
            ),
        }
        let sql = format!(
            "SELECT {} FROM {}{}",
            columns(&RELATION_COLUMNS, ""),
            t.relations,
            filter.where_sql()
        );
        for relation in select_relations(conn, &sql, &filter.params)? {
            found.insert(relation.id.clone(), relation);
        }
    }
    Ok(found.into_values().collect())
}

/// Exact cosine ranking over every embedded entity in scope.
pub(crate) fn brute_force_search(
    conn: &Connection,
    t: &Tables,
    embedding: &[f32],
    k: usize,
    entity_type: Option<&str>,
) -> Result<Vec<(Entity, f32)>> {
    let mut filter = Filter::scoped(t, "");
    filter.push_raw("embedding IS NOT NULL".to_string(), Vec::new());
    if let Some(entity_type) = entity_type {
        filter.push("entity_type = ?", [Value::Text(entity_type.to_string())]);
    }
    let sql = format!(
        "SELECT {} FROM {}{}",
        columns(&ENTITY_COLUMNS, ""),
        t.entities,
        filter.where_sql()
    );
    let scored = select_entities(conn, &sql, &filter.params)?
        .into_iter()
        .filter_map(|e| {
            let sim = cosine_similarity(embedding, e.embedding.as_deref()?);
            Some((e, sim))
        })
        .collect();
    Ok(rank_top_k(scored, k))
}

/// Nearest neighbours through the sqlite-vec index, scored with exact cosine.
///
/// The KNN step ignores tenant and type, so it falls back to the brute-force
/// scan when filtering leaves fewer than `k` hits.
pub(crate) fn native_vector_search(
    conn: &Connection,
    t: &Tables,
    vectors: &str,
    embedding: &[f32],
    k: usize,
    entity_type: Option<&str>,
) -> Result<Vec<(Entity, f32)>> {
    let mut unit = embedding.to_vec();
    kgraph_core::embedding::normalize(&mut unit);

    let mut filter = Filter::scoped(t, "e.");
    if let Some(entity_type) = entity_type {
        filter.push("entity_type = ?", [Value::Text(entity_type.to_string())]);
    }
    let sql = format!(
        "SELECT {} FROM (SELECT rowid, distance FROM {vectors} WHERE embedding MATCH ? AND k = ?) v \
         JOIN {} e ON e.rowid = v.rowid{} ORDER BY v.distance",
        columns(&ENTITY_COLUMNS, "e."),
        t.entities,
        filter.where_sql()
    );
    let mut params = vec![
        Value::Blob(encode_embedding(&unit)),
        Value::Integer(i64::try_from(k).unwrap_or(i64::MAX)),
    ];
    params.extend(filter.params);

    let hits = select_entities(conn, &sql, &params)?;
    if hits.len() < k {
        debug!(hits = hits.len(), k, "vector index under-filled, scanning");
        return brute_force_search(conn, t, embedding, k, entity_type);
    }
    let scored = hits
        .into_iter()
        .filter_map(|e| {
            let sim = cosine_similarity(embedding, e.embedding.as_deref()?);
            Some((e, sim))
        })
        .collect();
    Ok(rank_top_k(scored, k))
}

pub(crate) fn stats(conn: &Connection, t: &Tables) -> Result<GraphStats> {
    let grouped = |table: &str, column: &str| -> Result<BTreeMap<String, usize>> {
        let filter = Filter::scoped(t, "");
        let sql = format!(
            "SELECT {column}, COUNT(*) FROM {table}{} GROUP BY {column}",
            filter.where_sql()
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(map_sql_error)?;
        let rows = stmt
            .query_map(params_from_iter(filter.params.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(map_sql_error)?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (key, n) = row.map_err(map_sql_error)?;
            out.insert(key, usize::try_from(n).unwrap_or(0));
        }
        Ok(out)
    };

    let entities_by_type = grouped(&t.entities, "entity_type")?;
    let relations_by_type = grouped(&t.relations, "relation_type")?;
    Ok(GraphStats {
        entity_count: entities_by_type.values().sum(),
        relation_count: relations_by_type.values().sum(),
        entities_by_type,
        relations_by_type,
    })
}

pub(crate) fn list_indexes(conn: &Connection, t: &Tables) -> Result<Vec<IndexInfo>> {
    let mut indexes = builtin_indexes();
    let mut stmt = conn
        .prepare_cached("SELECT definition FROM graph_index_catalog WHERE partition = ? ORDER BY name")
        .map_err(map_sql_error)?;
    let rows = stmt
        .query_map([&t.partition], |row| row.get::<_, String>(0))
        .map_err(map_sql_error)?;
    for row in rows {
        let definition: IndexDefinition = serde_json::from_str(&row.map_err(map_sql_error)?)?;
        indexes.push(IndexInfo {
            definition,
            builtin: false,
            primary: false,
        });
    }
    Ok(indexes)
}

pub(crate) fn create_index(conn: &Connection, t: &Tables, definition: &IndexDefinition) -> Result<()> {
    definition.validate()?;
    if builtin_indexes().iter().any(|i| i.definition.name == definition.name) {
        return Err(KgError::conflict(ItemKind::Index, definition.name.clone()));
    }
    let table = match definition.table {
        IndexTable::Entities => &t.entities,
        IndexTable::Relations => &t.relations,
    };
    let physical = format!("{}{}", t.prefix, definition.name);
    let ddl = definition.to_sql(&physical, table, t.has_tenant());
    conn.execute_batch(&ddl).map_err(map_sql_error)?;
    conn.execute(
        "INSERT INTO graph_index_catalog (partition, name, definition, created_at) VALUES (?, ?, ?, ?)
         ON CONFLICT(partition, name) DO UPDATE SET definition = excluded.definition",
        rusqlite::params![
            t.partition,
            definition.name,
            serde_json::to_string(definition)?,
            format_ts(&Utc::now())
        ],
    )
    .map_err(map_sql_error)?;
    info!(index = %physical, "created index");
    Ok(())
}

pub(crate) fn provision_namespace(conn: &Connection, ns: &str, vector_dimension: Option<usize>) -> Result<()> {
    if !NAMESPACE_NAME.is_match(ns) {
        return Err(KgError::Provisioning {
            namespace: ns.to_string(),
            message: "namespace name is not a safe identifier".to_string(),
        });
    }
    let provisioning = |e: rusqlite::Error| KgError::Provisioning {
        namespace: ns.to_string(),
        message: e.to_string(),
    };
    conn.execute_batch(&namespace_ddl(ns)).map_err(provisioning)?;
    if let Some(dim) = vector_dimension {
        conn.execute_batch(&vector_ddl(&format!("{ns}__"), dim))
            .map_err(provisioning)?;
    }
    Ok(())
}

pub(crate) fn namespace_exists(conn: &Connection, ns: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
        [format!("{ns}__graph_entities")],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(map_sql_error)
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// How a SQL backend obtains a connection for one call.
///
/// `f` runs on a blocking thread with exclusive use of the connection.
#[async_trait]
pub trait SqlExecutor: Send + Sync + 'static {
    const KIND: BackendKind;

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static;
}

/// A [`StorageBackend`] over SQLite, generic in how connections are handed out.
pub struct SqlBackend<E> {
    executor: E,
    /// Dimension of the sqlite-vec mirror; `None` when the native index is off.
    vector_dimension: Option<usize>,
}

impl<E: SqlExecutor> SqlBackend<E> {
    /// Wrap an executor whose database already has the shared schema.
    pub(crate) fn from_executor(executor: E, vector_dimension: Option<usize>) -> Self {
        Self {
            executor,
            vector_dimension,
        }
    }

    pub fn native_vector_index(&self) -> bool {
        self.vector_dimension.is_some()
    }

    fn tables(&self, scope: &Scope) -> Tables {
        Tables::for_scope(scope, self.vector_dimension.is_some())
    }

    /// Run `f` inside one transaction.
    async fn transact<T, F>(&self, scope: &Scope, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &Tables) -> Result<T> + Send + 'static,
    {
        let tables = self.tables(scope);
        self.executor
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(map_sql_error)?;
                let out = f(&tx, &tables)?;
                tx.commit().map_err(map_sql_error)?;
                Ok(out)
            })
            .await
    }

    /// Run a read-only `f` without an explicit transaction.
    async fn read<T, F>(&self, scope: &Scope, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &Tables) -> Result<T> + Send + 'static,
    {
        let tables = self.tables(scope);
        self.executor.with_conn(move |conn| f(conn, &tables)).await
    }
}

#[async_trait]
impl<E: SqlExecutor> StorageBackend for SqlBackend<E> {
    fn kind(&self) -> BackendKind {
        E::KIND
    }

    async fn provision_namespace(&self, namespace: &str) -> Result<()> {
        let ns = namespace.to_string();
        let dim = self.vector_dimension;
        self.executor
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(map_sql_error)?;
                provision_namespace(&tx, &ns, dim)?;
                tx.commit().map_err(map_sql_error)?;
                info!(namespace = %ns, "provisioned namespace");
                Ok(())
            })
            .await
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        let ns = namespace.to_string();
        self.executor.with_conn(move |conn| namespace_exists(conn, &ns)).await
    }

    async fn add_entity(&self, scope: &Scope, entity: Entity, mode: WriteMode) -> Result<Entity> {
        self.transact(scope, move |conn, t| write_entity(conn, t, entity, mode))
            .await
    }

    async fn get_entity(&self, scope: &Scope, id: &str) -> Result<Entity> {
        let id = id.to_string();
        self.read(scope, move |conn, t| get_entity(conn, t, &id)).await
    }

    async fn get_entities(&self, scope: &Scope, ids: &[String]) -> Result<Vec<Entity>> {
        let ids = ids.to_vec();
        self.read(scope, move |conn, t| get_entities(conn, t, &ids)).await
    }

    async fn delete_entity(&self, scope: &Scope, id: &str) -> Result<()> {
        let id = id.to_string();
        self.transact(scope, move |conn, t| delete_entity(conn, t, &id)).await
    }

    async fn add_relation(&self, scope: &Scope, relation: Relation, mode: WriteMode) -> Result<Relation> {
        self.transact(scope, move |conn, t| write_relation(conn, t, relation, mode))
            .await
    }

    async fn get_relation(&self, scope: &Scope, id: &str) -> Result<Relation> {
        let id = id.to_string();
        self.read(scope, move |conn, t| get_relation(conn, t, &id)).await
    }

    async fn delete_relation(&self, scope: &Scope, id: &str) -> Result<()> {
        let id = id.to_string();
        self.transact(scope, move |conn, t| delete_relation(conn, t, &id)).await
    }

    async fn batch_add_entities(&self, scope: &Scope, entities: Vec<Entity>, mode: WriteMode) -> Result<usize> {
        self.transact(scope, move |conn, t| {
            let count = entities.len();
            for entity in entities {
                write_entity(conn, t, entity, mode)?;
            }
            Ok(count)
        })
        .await
    }

    async fn batch_add_relations(&self, scope: &Scope, relations: Vec<Relation>, mode: WriteMode) -> Result<usize> {
        self.transact(scope, move |conn, t| {
            let count = relations.len();
            for relation in relations {
                write_relation(conn, t, relation, mode)?;
            }
            Ok(count)
        })
        .await
    }

    async fn batch_delete_entities(&self, scope: &Scope, ids: &[String]) -> Result<usize> {
        let ids = ids.to_vec();
        self.transact(scope, move |conn, t| batch_delete_entities(conn, t, &ids))
            .await
    }

    async fn query(&self, scope: &Scope, graph_query: &GraphQuery) -> Result<Vec<Entity>> {
        let graph_query = graph_query.clone();
        self.read(scope, move |conn, t| query(conn, t, &graph_query)).await
    }

    async fn relations_for(&self, scope: &Scope, ids: &[String], direction: Direction) -> Result<Vec<Relation>> {
        let ids = ids.to_vec();
        self.read(scope, move |conn, t| relations_for(conn, t, &ids, direction))
            .await
    }

    async fn vector_search(
        &self,
        scope: &Scope,
        embedding: &[f32],
        k: usize,
        entity_type: Option<&str>,
    ) -> Result<Vec<(Entity, f32)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let embedding = embedding.to_vec();
        let entity_type = entity_type.map(str::to_string);
        self.read(scope, move |conn, t| match t.vectors {
            Some(ref vectors) => {
                native_vector_search(conn, t, vectors, &embedding, k, entity_type.as_deref())
            }
            None => brute_force_search(conn, t, &embedding, k, entity_type.as_deref()),
        })
        .await
    }

    async fn stats(&self, scope: &Scope) -> Result<GraphStats> {
        self.read(scope, stats).await
    }

    async fn list_indexes(&self, scope: &Scope) -> Result<Vec<IndexInfo>> {
        self.read(scope, list_indexes).await
    }

    async fn create_index(&self, scope: &Scope, definition: &IndexDefinition) -> Result<()> {
        let definition = definition.clone();
        self.transact(scope, move |conn, t| create_index(conn, t, &definition))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        create_shared_schema(&conn, None).unwrap();
        conn
    }

    #[test]
    fn embedding_blob_roundtrip() {
        let v = vec![0.25_f32, -1.5, 3.0];
        let bytes = encode_embedding(&v);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_embedding(&bytes).unwrap(), v);
        assert!(decode_embedding(&bytes[..5]).is_err());
    }

    #[test]
    fn upsert_keeps_rowid_and_relations() {
        let conn = shared_conn();
        let t = Tables::for_scope(&Scope::shared("acme"), false);
        write_entity(&conn, &t, Entity::new("a", "T"), WriteMode::Insert).unwrap();
        write_entity(&conn, &t, Entity::new("b", "T"), WriteMode::Insert).unwrap();
        write_relation(&conn, &t, Relation::new("r", "L", "a", "b"), WriteMode::Insert).unwrap();

        let first = get_entity(&conn, &t, "a").unwrap();
        let updated = Entity::new("a", "T").with_property("v", 2);
        let stored = write_entity(&conn, &t, updated, WriteMode::Upsert).unwrap();
        assert_eq!(stored.created_at, first.created_at);
        assert!(get_relation(&conn, &t, "r").is_ok());
    }

    #[test]
    fn insert_conflicts_on_duplicate() {
        let conn = shared_conn();
        let t = Tables::for_scope(&Scope::shared("acme"), false);
        write_entity(&conn, &t, Entity::new("a", "T"), WriteMode::Insert).unwrap();
        let err = write_entity(&conn, &t, Entity::new("a", "T"), WriteMode::Insert).unwrap_err();
        assert!(matches!(err, KgError::Conflict { kind: ItemKind::Entity, .. }));
    }

    #[test]
    fn relation_with_missing_endpoint_is_not_found() {
        let conn = shared_conn();
        let t = Tables::for_scope(&Scope::shared("acme"), false);
        write_entity(&conn, &t, Entity::new("a", "T"), WriteMode::Insert).unwrap();
        let err = write_relation(&conn, &t, Relation::new("r", "L", "a", "ghost"), WriteMode::Insert)
            .unwrap_err();
        assert_eq!(err.to_string(), "entity 'ghost' not found");
    }

    #[test]
    fn property_equality_is_type_strict() {
        let conn = shared_conn();
        let t = Tables::for_scope(&Scope::shared("acme"), false);
        write_entity(&conn, &t, Entity::new("a", "T").with_property("flag", true), WriteMode::Insert)
            .unwrap();
        write_entity(&conn, &t, Entity::new("b", "T").with_property("flag", 1), WriteMode::Insert).unwrap();

        let hits = query(&conn, &t, &GraphQuery::default().with_property("flag", true)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
        let hits = query(&conn, &t, &GraphQuery::default().with_property("flag", 1)).unwrap();
        assert_eq!(hits[0].id, "b");
    }

    #[test]
    fn namespace_tables_are_separate() {
        let conn = shared_conn();
        provision_namespace(&conn, "tenant_acme", None).unwrap();
        assert!(namespace_exists(&conn, "tenant_acme").unwrap());
        assert!(!namespace_exists(&conn, "tenant_globex").unwrap());
        assert!(provision_namespace(&conn, "bad name", None).is_err());

        let ns = Tables::for_scope(&Scope::namespaced("acme", "tenant_acme"), false);
        let shared = Tables::for_scope(&Scope::shared("acme"), false);
        write_entity(&conn, &ns, Entity::new("a", "T"), WriteMode::Insert).unwrap();
        assert!(get_entity(&conn, &shared, "a").is_err());
        assert!(get_entity(&conn, &ns, "a").is_ok());
    }

    #[test]
    fn custom_index_is_recorded_in_catalog() {
        use crate::backend::IndexColumn;

        let conn = shared_conn();
        let t = Tables::for_scope(&Scope::shared("acme"), false);
        let def = IndexDefinition {
            name: "idx_graph_entities_prop_email".into(),
            table: IndexTable::Entities,
            columns: vec![IndexColumn::Property("email".into())],
        };
        create_index(&conn, &t, &def).unwrap();
        let indexes = list_indexes(&conn, &t).unwrap();
        assert!(indexes.iter().any(|i| i.definition == def && !i.builtin));

        // Catalog entries are per partition.
        let other = Tables::for_scope(&Scope::shared("globex"), false);
        assert!(!list_indexes(&conn, &other).unwrap().iter().any(|i| i.definition == def));
    }
}
