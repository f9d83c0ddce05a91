//! Cost-based rewriting of multi-step query plans.
//!
//! A [`QueryPlan`] starts from a seed set or a type scan and then alternates
//! expansions, filters and limits. The cost of a plan is the number of rows
//! every step materializes plus the cost of evaluating its filters, estimated
//! from [`GraphStats`]. Two rewrites are applied:
//!
//! - **filter pushdown**: filters directly following an expansion are folded
//!   into it, so neighbours failing them never materialize;
//! - **filter reordering**: runs of filters (standalone or folded) are sorted
//!   so the cheapest, most selective filter runs first.
//!
//! Filters are never moved across a `Limit`.

use serde::{Deserialize, Serialize};

use kgraph_core::{Direction, Entity, KgError, Result};
use kgraph_store::GraphStats;

/// Assumed fraction of entities matching one property equality.
const PROPERTY_SELECTIVITY: f64 = 0.1;
const TYPE_FILTER_COST: f64 = 0.05;
const PROPERTY_FILTER_COST: f64 = 0.2;

/// A predicate on entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanFilter {
    EntityType { entity_type: String },
    Property { key: String, value: serde_json::Value },
}

impl PlanFilter {
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::EntityType { entity_type } => &entity.entity_type == entity_type,
            Self::Property { key, value } => entity.properties.get(key) == Some(value),
        }
    }

    fn selectivity(&self, stats: &GraphStats) -> f64 {
        match self {
            Self::EntityType { entity_type } => stats.type_selectivity(entity_type),
            Self::Property { .. } => PROPERTY_SELECTIVITY,
        }
    }

    fn unit_cost(&self) -> f64 {
        match self {
            Self::EntityType { .. } => TYPE_FILTER_COST,
            Self::Property { .. } => PROPERTY_FILTER_COST,
        }
    }

    /// Sort key: lower runs earlier.
    fn rank(&self, stats: &GraphStats) -> f64 {
        let drop = 1.0 - self.selectivity(stats);
        if drop <= 0.0 {
            f64::INFINITY
        } else {
            self.unit_cost() / drop
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanStep {
    Seed {
        ids: Vec<String>,
    },
    TypeScan {
        entity_type: String,
    },
    Expand {
        #[serde(default)]
        direction: Direction,
        /// Empty means every relation type.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        relation_types: Vec<String>,
        /// Applied to neighbours as they are reached.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        filters: Vec<PlanFilter>,
    },
    Filter {
        filter: PlanFilter,
    },
    Limit {
        count: usize,
    },
}

impl PlanStep {
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Seed { ids } => format!("seed({})", ids.len()),
            Self::TypeScan { entity_type } => format!("type_scan({entity_type})"),
            Self::Expand {
                direction,
                relation_types,
                filters,
            } => {
                let mut label = format!("expand({direction:?}");
                if !relation_types.is_empty() {
                    label.push_str(&format!(", types={}", relation_types.join("|")));
                }
                if !filters.is_empty() {
                    label.push_str(&format!(", filters={}", filters.len()));
                }
                label.push(')');
                label
            }
            Self::Filter { filter } => match filter {
                PlanFilter::EntityType { entity_type } => format!("filter(type={entity_type})"),
                PlanFilter::Property { key, value } => format!("filter({key}={value})"),
            },
            Self::Limit { count } => format!("limit({count})"),
        }
    }
}

/// Ordered plan steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub steps: Vec<PlanStep>,
}

impl QueryPlan {
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] unless the plan starts with exactly one
    /// non-empty seed set or type scan.
    pub fn validate(&self) -> Result<()> {
        match self.steps.first() {
            Some(PlanStep::Seed { ids }) if ids.is_empty() => {
                return Err(KgError::validation("plan.steps", "seed step has no ids"));
            }
            Some(PlanStep::Seed { .. } | PlanStep::TypeScan { .. }) => {}
            _ => {
                return Err(KgError::validation("plan.steps", "a plan must start with a seed or type_scan step"));
            }
        }
        if self.steps[1..]
            .iter()
            .any(|s| matches!(s, PlanStep::Seed { .. } | PlanStep::TypeScan { .. }))
        {
            return Err(KgError::validation("plan.steps", "seed and type_scan may only appear first"));
        }
        Ok(())
    }
}

/// Per-step cardinality and total cost estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEstimate {
    pub rows: Vec<f64>,
    pub cost: f64,
}

/// Cardinality model over one tenant's statistics.
pub struct CostModel<'a> {
    stats: &'a GraphStats,
}

impl<'a> CostModel<'a> {
    #[must_use]
    pub fn new(stats: &'a GraphStats) -> Self {
        Self { stats }
    }

    fn apply_filters(&self, mut rows: f64, filters: &[PlanFilter], cost: &mut f64) -> f64 {
        for f in filters {
            *cost += rows * f.unit_cost();
            rows *= f.selectivity(self.stats);
        }
        rows
    }

    fn fan_out(&self, direction: Direction, relation_types: &[String]) -> f64 {
        let mut degree = self.stats.avg_out_degree();
        if direction == Direction::Both {
            degree *= 2.0;
        }
        if !relation_types.is_empty() {
            let share: f64 = relation_types
                .iter()
                .map(|t| self.stats.relation_selectivity(t))
                .sum();
            degree *= share.min(1.0);
        }
        degree
    }

    #[must_use]
    pub fn estimate(&self, plan: &QueryPlan) -> PlanEstimate {
        let mut rows = 0.0_f64;
        let mut cost = 0.0_f64;
        let mut per_step = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            rows = match step {
                PlanStep::Seed { ids } => ids.len() as f64,
                PlanStep::TypeScan { entity_type } => {
                    self.stats.entities_by_type.get(entity_type).copied().unwrap_or(0) as f64
                }
                PlanStep::Expand {
                    direction,
                    relation_types,
                    filters,
                } => {
                    let reached = rows * self.fan_out(*direction, relation_types);
                    self.apply_filters(reached, filters, &mut cost)
                }
                PlanStep::Filter { filter } => self.apply_filters(rows, std::slice::from_ref(filter), &mut cost),
                PlanStep::Limit { count } => rows.min(*count as f64),
            };
            cost += rows;
            per_step.push(rows);
        }
        PlanEstimate { rows: per_step, cost }
    }
}

/// A rewrite the optimizer applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rewrite", rename_all = "snake_case")]
pub enum Rewrite {
    /// `filters` standalone filters folded into the expansion at `step`.
    FilterPushdown { step: usize, filters: usize },
    /// Filters at `step` were reordered.
    FilterReorder { step: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizedPlan {
    pub plan: QueryPlan,
    pub cost_before: f64,
    pub cost_after: f64,
    pub rewrites: Vec<Rewrite>,
}

pub struct Optimizer<'a> {
    model: CostModel<'a>,
}

impl<'a> Optimizer<'a> {
    #[must_use]
    pub fn new(stats: &'a GraphStats) -> Self {
        Self {
            model: CostModel::new(stats),
        }
    }

    /// Rewrite `plan`. The original is returned untouched when no rewrite lowers its cost.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] for malformed plans.
    pub fn optimize(&self, plan: &QueryPlan) -> Result<OptimizedPlan> {
        plan.validate()?;
        let cost_before = self.model.estimate(plan).cost;

        let mut rewrites = Vec::new();
        let pushed = self.push_down(plan, &mut rewrites);
        let reordered = self.reorder(pushed, &mut rewrites);
        let cost_after = self.model.estimate(&reordered).cost;

        if cost_after > cost_before {
            return Ok(OptimizedPlan {
                plan: plan.clone(),
                cost_before,
                cost_after: cost_before,
                rewrites: Vec::new(),
            });
        }
        Ok(OptimizedPlan {
            plan: reordered,
            cost_before,
            cost_after,
            rewrites,
        })
    }

    fn push_down(&self, plan: &QueryPlan, rewrites: &mut Vec<Rewrite>) -> QueryPlan {
        let mut steps: Vec<PlanStep> = Vec::with_capacity(plan.steps.len());
        let mut iter = plan.steps.iter().peekable();
        while let Some(step) = iter.next() {
            let PlanStep::Expand {
                direction,
                relation_types,
                filters,
            } = step
            else {
                steps.push(step.clone());
                continue;
            };
            let mut folded = filters.clone();
            let mut moved = 0;
            while let Some(PlanStep::Filter { filter }) = iter.peek() {
                folded.push(filter.clone());
                moved += 1;
                iter.next();
            }
            if moved > 0 {
                rewrites.push(Rewrite::FilterPushdown {
                    step: steps.len(),
                    filters: moved,
                });
            }
            steps.push(PlanStep::Expand {
                direction: *direction,
                relation_types: relation_types.clone(),
                filters: folded,
            });
        }
        QueryPlan { steps }
    }

    fn sort_filters(&self, filters: &mut [PlanFilter]) -> bool {
        let before: Vec<PlanFilter> = filters.to_vec();
        let stats = self.model.stats;
        filters.sort_by(|a, b| {
            a.rank(stats)
                .partial_cmp(&b.rank(stats))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        before.as_slice() != &filters[..]
    }

    fn reorder(&self, plan: QueryPlan, rewrites: &mut Vec<Rewrite>) -> QueryPlan {
        let mut steps = plan.steps;
        let mut i = 0;
        while i < steps.len() {
            if let PlanStep::Expand { filters, .. } = &mut steps[i] {
                if filters.len() > 1 && self.sort_filters(filters) {
                    rewrites.push(Rewrite::FilterReorder { step: i });
                }
                i += 1;
                continue;
            }
            if !matches!(steps[i], PlanStep::Filter { .. }) {
                i += 1;
                continue;
            }
            let start = i;
            while i < steps.len() && matches!(steps[i], PlanStep::Filter { .. }) {
                i += 1;
            }
            if i - start < 2 {
                continue;
            }
            let mut run: Vec<PlanFilter> = steps[start..i]
                .iter()
                .filter_map(|s| match s {
                    PlanStep::Filter { filter } => Some(filter.clone()),
                    _ => None,
                })
                .collect();
            if self.sort_filters(&mut run) {
                for (slot, filter) in steps[start..i].iter_mut().zip(run) {
                    *slot = PlanStep::Filter { filter };
                }
                rewrites.push(Rewrite::FilterReorder { step: start });
            }
        }
        QueryPlan { steps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn stats() -> GraphStats {
        GraphStats {
            entity_count: 1000,
            relation_count: 5000,
            entities_by_type: BTreeMap::from([("Person".to_string(), 900), ("Company".to_string(), 100)]),
            relations_by_type: BTreeMap::from([("KNOWS".to_string(), 4000), ("WORKS_FOR".to_string(), 1000)]),
        }
    }

    fn type_filter(t: &str) -> PlanStep {
        PlanStep::Filter {
            filter: PlanFilter::EntityType { entity_type: t.into() },
        }
    }

    fn prop_filter(k: &str, v: &str) -> PlanStep {
        PlanStep::Filter {
            filter: PlanFilter::Property {
                key: k.into(),
                value: v.into(),
            },
        }
    }

    fn expand() -> PlanStep {
        PlanStep::Expand {
            direction: Direction::Outgoing,
            relation_types: Vec::new(),
            filters: Vec::new(),
        }
    }

    #[test]
    fn filters_after_expand_are_pushed_down() {
        let stats = stats();
        let plan = QueryPlan {
            steps: vec![
                PlanStep::Seed { ids: vec!["alice".into()] },
                expand(),
                type_filter("Company"),
                PlanStep::Limit { count: 5 },
            ],
        };
        let optimized = Optimizer::new(&stats).optimize(&plan).unwrap();
        assert_eq!(optimized.plan.steps.len(), 3);
        assert!(matches!(
            optimized.plan.steps[1],
            PlanStep::Expand { ref filters, .. } if filters.len() == 1
        ));
        assert_eq!(optimized.rewrites, vec![Rewrite::FilterPushdown { step: 1, filters: 1 }]);
        assert!(optimized.cost_after < optimized.cost_before);
    }

    #[test]
    fn filters_never_cross_limit() {
        let stats = stats();
        let plan = QueryPlan {
            steps: vec![
                PlanStep::Seed { ids: vec!["alice".into()] },
                expand(),
                PlanStep::Limit { count: 5 },
                type_filter("Company"),
            ],
        };
        let optimized = Optimizer::new(&stats).optimize(&plan).unwrap();
        assert_eq!(optimized.plan, plan);
        assert!(optimized.rewrites.is_empty());
    }

    #[test]
    fn selective_filter_runs_first() {
        let stats = stats();
        let plan = QueryPlan {
            steps: vec![
                PlanStep::TypeScan {
                    entity_type: "Person".into(),
                },
                type_filter("Person"),
                prop_filter("city", "Oslo"),
            ],
        };
        let optimized = Optimizer::new(&stats).optimize(&plan).unwrap();
        assert_eq!(optimized.plan.steps[1], prop_filter("city", "Oslo"));
        assert_eq!(optimized.rewrites, vec![Rewrite::FilterReorder { step: 1 }]);
        assert!(optimized.cost_after <= optimized.cost_before);
    }

    #[test]
    fn folded_filters_are_reordered() {
        let stats = stats();
        let plan = QueryPlan {
            steps: vec![
                PlanStep::Seed { ids: vec!["alice".into()] },
                expand(),
                type_filter("Person"),
                prop_filter("city", "Oslo"),
            ],
        };
        let optimized = Optimizer::new(&stats).optimize(&plan).unwrap();
        let PlanStep::Expand { ref filters, .. } = optimized.plan.steps[1] else {
            panic!("expected expand");
        };
        assert!(matches!(filters[0], PlanFilter::Property { .. }));
        assert_eq!(optimized.rewrites.len(), 2);
    }

    #[test]
    fn malformed_plans_are_rejected() {
        let stats = stats();
        let optimizer = Optimizer::new(&stats);
        assert!(optimizer.optimize(&QueryPlan { steps: vec![] }).is_err());
        assert!(optimizer.optimize(&QueryPlan { steps: vec![expand()] }).is_err());
        assert!(optimizer
            .optimize(&QueryPlan {
                steps: vec![PlanStep::Seed { ids: vec![] }]
            })
            .is_err());
    }

    #[test]
    fn plan_roundtrips_through_json() {
        let json = serde_json::json!({
            "steps": [
                {"op": "seed", "ids": ["a"]},
                {"op": "expand", "direction": "outgoing", "relation_types": ["KNOWS"]},
                {"op": "filter", "filter": {"kind": "entity_type", "entity_type": "Person"}},
                {"op": "limit", "count": 3}
            ]
        });
        let plan: QueryPlan = serde_json::from_value(json).unwrap();
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.steps[1].label(), "expand(Outgoing, types=KNOWS)");
    }
}
