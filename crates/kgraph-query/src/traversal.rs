//! Bounded graph walks over the tenant's relations.
//!
//! Walks fetch adjacency one frontier at a time through
//! [`KnowledgeGraph::relations_for`], so every hop is one backend call and
//! shares the query cache.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use kgraph_core::{Direction, Relation, Result, TenantContext};
use kgraph_store::KnowledgeGraph;

/// Nodes reached by a walk and the relations followed to reach them.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// id -> hop count from the nearest seed (seeds are 0).
    pub depths: BTreeMap<String, u32>,
    /// Relations seen while walking, keyed by id.
    pub relations: BTreeMap<String, Relation>,
}

impl Expansion {
    /// Reached ids, seeds included only when asked.
    #[must_use]
    pub fn reached(&self, include_seeds: bool) -> Vec<(String, u32)> {
        self.depths
            .iter()
            .filter(|(_, &d)| include_seeds || d > 0)
            .map(|(id, &d)| (id.clone(), d))
            .collect()
    }

    /// Relations whose endpoints were both reached.
    pub fn internal_relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations
            .values()
            .filter(|r| self.depths.contains_key(&r.source_id) && self.depths.contains_key(&r.target_id))
    }
}

fn allowed(relation: &Relation, relation_types: Option<&HashSet<String>>) -> bool {
    relation_types.is_none_or(|types| types.contains(&relation.relation_type))
}

/// Level-by-level breadth-first walk up to `max_depth` hops.
///
/// # Errors
///
/// Backend errors from the adjacency lookups.
pub async fn breadth_first(
    graph: &KnowledgeGraph,
    ctx: &TenantContext,
    seeds: &[String],
    max_depth: u32,
    direction: Direction,
    relation_types: Option<&HashSet<String>>,
) -> Result<Expansion> {
    let mut expansion = Expansion::default();
    let mut frontier: BTreeSet<String> = seeds.iter().cloned().collect();
    for seed in &frontier {
        expansion.depths.insert(seed.clone(), 0);
    }

    for depth in 1..=max_depth {
        if frontier.is_empty() {
            break;
        }
        let ids: Vec<String> = frontier.iter().cloned().collect();
        let relations = graph.relations_for(ctx, &ids, direction).await?;
        let mut next = BTreeSet::new();
        for relation in relations {
            if !allowed(&relation, relation_types) {
                continue;
            }
            for node in [&relation.source_id, &relation.target_id] {
                if !frontier.contains(node) {
                    continue;
                }
                if let Some(other) = direction.step(&relation, node) {
                    if !expansion.depths.contains_key(other) {
                        next.insert(other.to_string());
                    }
                }
            }
            expansion.relations.insert(relation.id.clone(), relation);
        }
        for id in &next {
            expansion.depths.insert(id.clone(), depth);
        }
        frontier = next;
    }
    Ok(expansion)
}

/// Depth-first walk up to `max_depth` hops. Each node keeps the depth at
/// which the walk first reached it, which may exceed its shortest distance.
///
/// # Errors
///
/// Backend errors from the adjacency lookups.
pub async fn depth_first(
    graph: &KnowledgeGraph,
    ctx: &TenantContext,
    seeds: &[String],
    max_depth: u32,
    direction: Direction,
    relation_types: Option<&HashSet<String>>,
) -> Result<Expansion> {
    let mut expansion = Expansion::default();
    let mut sorted: Vec<&String> = seeds.iter().collect();
    sorted.sort();
    sorted.dedup();
    let mut stack: Vec<(String, u32)> = sorted.into_iter().rev().map(|s| (s.clone(), 0)).collect();

    while let Some((id, depth)) = stack.pop() {
        if expansion.depths.contains_key(&id) {
            continue;
        }
        expansion.depths.insert(id.clone(), depth);
        if depth == max_depth {
            continue;
        }
        let relations = graph
            .relations_for(ctx, std::slice::from_ref(&id), direction)
            .await?;
        let mut children = BTreeSet::new();
        for relation in relations {
            if !allowed(&relation, relation_types) {
                continue;
            }
            if let Some(other) = direction.step(&relation, &id) {
                if !expansion.depths.contains_key(other) {
                    children.insert(other.to_string());
                }
            }
            expansion.relations.insert(relation.id.clone(), relation);
        }
        // Reverse so the smallest id is explored first.
        stack.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
    }
    Ok(expansion)
}
