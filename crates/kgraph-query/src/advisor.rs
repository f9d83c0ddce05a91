//! Access-pattern log and offline index advice.
//!
//! The engine records which access paths each search uses. The advisor
//! compares those counts with the indexes that exist and reports unused
//! indexes and missing-index recommendations. Nothing is applied; a
//! recommendation's [`IndexDefinition`] is passed to
//! [`kgraph_store::KnowledgeGraph::create_index`] explicitly.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kgraph_core::Direction;
use kgraph_store::{GraphStats, IndexColumn, IndexDefinition, IndexInfo, IndexTable};

use crate::optimizer::{PlanFilter, PlanStep, QueryPlan};
use crate::request::QueryRequest;

/// Entity count above which the vector note is emitted.
const LARGE_VECTOR_SET: usize = 10_000;
const PROPERTY_SELECTIVITY: f64 = 0.1;

/// One access path a query used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum AccessPattern {
    EntityType,
    /// Equality on one property key.
    Property(String),
    RelationType,
    Adjacency(Direction),
    Vector,
}

impl AccessPattern {
    fn label(&self) -> String {
        match self {
            Self::EntityType => "entity_type".to_string(),
            Self::Property(key) => format!("property:{key}"),
            Self::RelationType => "relation_type".to_string(),
            Self::Adjacency(d) => format!("adjacency:{d:?}").to_lowercase(),
            Self::Vector => "vector".to_string(),
        }
    }

    /// Leading index keys that serve this pattern.
    fn needs(&self) -> Vec<(IndexTable, IndexColumn)> {
        let column = |c: &str| IndexColumn::Column(c.to_string());
        match self {
            Self::EntityType => vec![(IndexTable::Entities, column("entity_type"))],
            Self::Property(key) => vec![(IndexTable::Entities, IndexColumn::Property(key.clone()))],
            Self::RelationType => vec![(IndexTable::Relations, column("relation_type"))],
            Self::Adjacency(Direction::Outgoing) => vec![(IndexTable::Relations, column("source_id"))],
            Self::Adjacency(Direction::Incoming) => vec![(IndexTable::Relations, column("target_id"))],
            Self::Adjacency(Direction::Both) => vec![
                (IndexTable::Relations, column("source_id")),
                (IndexTable::Relations, column("target_id")),
            ],
            Self::Vector => Vec::new(),
        }
    }
}

/// Patterns a search request exercises.
#[must_use]
pub fn patterns_for_request(request: &QueryRequest) -> Vec<AccessPattern> {
    let mut patterns = Vec::new();
    match request {
        QueryRequest::Vector(q) => {
            patterns.push(AccessPattern::Vector);
            if q.entity_type.is_some() {
                patterns.push(AccessPattern::EntityType);
            }
        }
        QueryRequest::Graph(q) => patterns.push(AccessPattern::Adjacency(q.direction)),
        QueryRequest::Hybrid(q) => {
            patterns.push(AccessPattern::Vector);
            patterns.push(AccessPattern::Adjacency(q.direction));
            if q.entity_type.is_some() {
                patterns.push(AccessPattern::EntityType);
            }
        }
        QueryRequest::Pagerank(q) => patterns.push(AccessPattern::Adjacency(q.direction)),
        QueryRequest::Multihop(q) => patterns.push(AccessPattern::Adjacency(q.direction)),
        QueryRequest::Filtered(q) => {
            if q.entity_type.is_some() {
                patterns.push(AccessPattern::EntityType);
            }
            patterns.extend(q.properties.keys().cloned().map(AccessPattern::Property));
        }
        QueryRequest::Traverse(q) => {
            patterns.push(AccessPattern::Adjacency(q.direction));
            patterns.push(AccessPattern::RelationType);
        }
    }
    patterns
}

fn filter_pattern(filter: &PlanFilter) -> AccessPattern {
    match filter {
        PlanFilter::EntityType { .. } => AccessPattern::EntityType,
        PlanFilter::Property { key, .. } => AccessPattern::Property(key.clone()),
    }
}

/// Patterns a plan exercises.
#[must_use]
pub fn patterns_for_plan(plan: &QueryPlan) -> Vec<AccessPattern> {
    let mut patterns = Vec::new();
    for step in &plan.steps {
        match step {
            PlanStep::TypeScan { .. } => patterns.push(AccessPattern::EntityType),
            PlanStep::Expand {
                direction,
                relation_types,
                filters,
            } => {
                patterns.push(AccessPattern::Adjacency(*direction));
                if !relation_types.is_empty() {
                    patterns.push(AccessPattern::RelationType);
                }
                patterns.extend(filters.iter().map(filter_pattern));
            }
            PlanStep::Filter { filter } => patterns.push(filter_pattern(filter)),
            PlanStep::Seed { .. } | PlanStep::Limit { .. } => {}
        }
    }
    patterns
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternCount {
    pub pattern: AccessPattern,
    pub count: u64,
}

/// Thread-safe access-pattern counters.
#[derive(Debug, Default)]
pub struct QueryPatternLog {
    counts: Mutex<HashMap<AccessPattern, u64>>,
}

impl QueryPatternLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, pattern: AccessPattern) {
        *self.counts.lock().entry(pattern).or_default() += 1;
    }

    pub fn record_all(&self, patterns: impl IntoIterator<Item = AccessPattern>) {
        let mut counts = self.counts.lock();
        for pattern in patterns {
            *counts.entry(pattern).or_default() += 1;
        }
    }

    /// Counts, most frequent first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PatternCount> {
        let mut out: Vec<PatternCount> = self
            .counts
            .lock()
            .iter()
            .map(|(pattern, &count)| PatternCount {
                pattern: pattern.clone(),
                count,
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.pattern.label().cmp(&b.pattern.label())));
        out
    }

    pub fn clear(&self) {
        self.counts.lock().clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRecommendation {
    pub pattern: AccessPattern,
    pub occurrences: u64,
    /// Rows a lookup avoids scanning, times occurrences.
    pub estimated_benefit: f64,
    pub definition: IndexDefinition,
    /// DDL for the shared-schema tables.
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnusedIndex {
    pub name: String,
    pub table: IndexTable,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexReport {
    pub unused: Vec<UnusedIndex>,
    pub recommendations: Vec<IndexRecommendation>,
    pub notes: Vec<String>,
}

/// Offline index analysis.
#[derive(Debug, Clone)]
pub struct IndexAdvisor {
    /// Patterns seen fewer times than this produce no recommendation.
    pub min_occurrences: u64,
}

impl Default for IndexAdvisor {
    fn default() -> Self {
        Self { min_occurrences: 5 }
    }
}

fn leading_key(info: &IndexInfo) -> Option<(IndexTable, &IndexColumn)> {
    info.definition
        .columns
        .first()
        .map(|c| (info.definition.table, c))
}

fn table_name(table: IndexTable) -> &'static str {
    match table {
        IndexTable::Entities => "graph_entities",
        IndexTable::Relations => "graph_relations",
    }
}

fn index_name(table: IndexTable, column: &IndexColumn) -> String {
    let prefix = match table {
        IndexTable::Entities => "idx_entities",
        IndexTable::Relations => "idx_relations",
    };
    match column {
        IndexColumn::Column(c) => format!("{prefix}_{c}"),
        IndexColumn::Property(p) => format!("{prefix}_prop_{p}"),
    }
}

impl IndexAdvisor {
    #[must_use]
    pub fn analyze(&self, patterns: &[PatternCount], indexes: &[IndexInfo], stats: &GraphStats) -> IndexReport {
        let mut report = IndexReport::default();

        let mut needed: HashMap<(IndexTable, IndexColumn), (AccessPattern, u64)> = HashMap::new();
        for pc in patterns {
            for key in pc.pattern.needs() {
                let entry = needed.entry(key).or_insert((pc.pattern.clone(), 0));
                entry.1 += pc.count;
            }
        }

        for info in indexes.iter().filter(|i| !i.primary) {
            // Column-less indexes back the tenant filter itself.
            let Some((table, column)) = leading_key(info) else {
                continue;
            };
            if !needed.contains_key(&(table, column.clone())) {
                report.unused.push(UnusedIndex {
                    name: info.definition.name.clone(),
                    table,
                });
            }
        }

        for ((table, column), (pattern, count)) in needed {
            let covered = indexes
                .iter()
                .filter_map(leading_key)
                .any(|(t, c)| t == table && c == &column);
            if covered || count < self.min_occurrences {
                continue;
            }
            let definition = IndexDefinition {
                name: index_name(table, &column),
                table,
                columns: vec![column.clone()],
            };
            if definition.validate().is_err() {
                report.notes.push(format!(
                    "{} is queried {count} times but cannot be indexed safely",
                    pattern.label()
                ));
                continue;
            }
            let saved = rows_saved(&pattern, stats);
            report.recommendations.push(IndexRecommendation {
                sql: definition.to_sql(&definition.name, table_name(table), true),
                pattern,
                occurrences: count,
                estimated_benefit: saved * count as f64,
                definition,
            });
        }
        report.recommendations.sort_by(|a, b| {
            b.estimated_benefit
                .partial_cmp(&a.estimated_benefit)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.definition.name.cmp(&b.definition.name))
        });
        report.unused.sort_by(|a, b| a.name.cmp(&b.name));

        if let Some(vector) = patterns.iter().find(|p| p.pattern == AccessPattern::Vector) {
            if vector.count >= self.min_occurrences && stats.entity_count > LARGE_VECTOR_SET {
                report.notes.push(format!(
                    "{} vector searches over {} entities: consider storage.native_vector_index",
                    vector.count, stats.entity_count
                ));
            }
        }
        report
    }
}

/// Rows one indexed lookup avoids compared with a scan of the tenant's table.
fn rows_saved(pattern: &AccessPattern, stats: &GraphStats) -> f64 {
    let types = |n: usize| 1.0 / n.max(1) as f64;
    match pattern {
        AccessPattern::Property(_) => stats.entity_count as f64 * (1.0 - PROPERTY_SELECTIVITY),
        AccessPattern::EntityType => stats.entity_count as f64 * (1.0 - types(stats.entities_by_type.len())),
        AccessPattern::RelationType => stats.relation_count as f64 * (1.0 - types(stats.relations_by_type.len())),
        AccessPattern::Adjacency(_) => (stats.relation_count as f64 - stats.avg_out_degree()).max(0.0),
        AccessPattern::Vector => 0.0,
    }
}
