//! Personalized PageRank by power iteration.

use std::collections::HashMap;

use kgraph_core::{Direction, Relation};

/// Iteration parameters.
#[derive(Debug, Clone, Copy)]
pub struct PageRankParams {
    pub damping: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for PageRankParams {
    fn default() -> Self {
        Self {
            damping: 0.85,
            tolerance: 1e-6,
            max_iterations: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageRankResult {
    /// Rank per node id; sums to 1.
    pub ranks: HashMap<String, f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Run personalized PageRank over `nodes`, teleporting to `seeds`.
///
/// Relation weights are edge weights. `direction` decides edge orientation:
/// `Incoming` reverses every edge and `Both` treats them as undirected.
/// Relations touching nodes outside `nodes` are ignored. Dangling mass is
/// returned to the seeds.
#[must_use]
pub fn personalized_pagerank<'a>(
    nodes: &[String],
    relations: impl IntoIterator<Item = &'a Relation>,
    seeds: &[String],
    direction: Direction,
    params: PageRankParams,
) -> PageRankResult {
    let index: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    let n = nodes.len();
    if n == 0 {
        return PageRankResult {
            ranks: HashMap::new(),
            iterations: 0,
            converged: true,
        };
    }

    // out[i] = (target, weight)
    let mut out: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    for relation in relations {
        let (Some(&s), Some(&t)) = (index.get(relation.source_id.as_str()), index.get(relation.target_id.as_str())) else {
            continue;
        };
        let w = relation.weight;
        if w <= 0.0 {
            continue;
        }
        match direction {
            Direction::Outgoing => out[s].push((t, w)),
            Direction::Incoming => out[t].push((s, w)),
            Direction::Both => {
                out[s].push((t, w));
                if s != t {
                    out[t].push((s, w));
                }
            }
        }
    }
    let out_weight: Vec<f64> = out.iter().map(|edges| edges.iter().map(|(_, w)| w).sum()).collect();

    let mut teleport = vec![0.0; n];
    let seed_idx: Vec<usize> = seeds.iter().filter_map(|s| index.get(s.as_str()).copied()).collect();
    if seed_idx.is_empty() {
        teleport.iter_mut().for_each(|t| *t = 1.0 / n as f64);
    } else {
        for &i in &seed_idx {
            teleport[i] += 1.0 / seed_idx.len() as f64;
        }
    }

    let d = params.damping;
    let mut rank = teleport.clone();
    let mut iterations = 0;
    let mut converged = false;
    while iterations < params.max_iterations {
        iterations += 1;
        let dangling: f64 = (0..n).filter(|&i| out_weight[i] == 0.0).map(|i| rank[i]).sum();
        let mut next: Vec<f64> = teleport.iter().map(|t| (1.0 - d) * t + d * dangling * t).collect();
        for (i, edges) in out.iter().enumerate() {
            if out_weight[i] == 0.0 {
                continue;
            }
            let share = d * rank[i] / out_weight[i];
            for &(j, w) in edges {
                next[j] += share * w;
            }
        }
        let delta: f64 = next.iter().zip(&rank).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < params.tolerance {
            converged = true;
            break;
        }
    }

    PageRankResult {
        ranks: nodes.iter().cloned().zip(rank).collect(),
        iterations,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn edge(s: &str, t: &str, w: f64) -> Relation {
        Relation::new(Relation::derive_id(s, "L", t), "L", s, t).with_weight(w)
    }

    #[test]
    fn ranks_sum_to_one_and_converge() {
        let nodes = ids(&["a", "b", "c", "d"]);
        let rels = vec![edge("a", "b", 1.0), edge("b", "c", 1.0), edge("c", "a", 1.0), edge("c", "d", 1.0)];
        let result = personalized_pagerank(&nodes, &rels, &ids(&["a"]), Direction::Outgoing, PageRankParams::default());
        let total: f64 = result.ranks.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(result.converged);
        assert!(result.ranks["a"] > result.ranks["d"]);
    }

    #[test]
    fn heavier_edges_carry_more_rank() {
        let nodes = ids(&["s", "x", "y"]);
        let rels = vec![edge("s", "x", 5.0), edge("s", "y", 1.0)];
        let result = personalized_pagerank(&nodes, &rels, &ids(&["s"]), Direction::Outgoing, PageRankParams::default());
        assert!(result.ranks["x"] > result.ranks["y"]);
    }

    #[test]
    fn iteration_cap_is_respected() {
        let nodes = ids(&["a", "b"]);
        let rels = vec![edge("a", "b", 1.0), edge("b", "a", 1.0)];
        let params = PageRankParams {
            max_iterations: 2,
            tolerance: 1e-15,
            ..PageRankParams::default()
        };
        let result = personalized_pagerank(&nodes, &rels, &ids(&["a"]), Direction::Both, params);
        assert_eq!(result.iterations, 2);
        assert!(!result.converged);
    }

    #[test]
    fn relations_outside_subgraph_are_ignored() {
        let nodes = ids(&["a", "b"]);
        let rels = vec![edge("a", "b", 1.0), edge("b", "zzz", 1.0)];
        let result = personalized_pagerank(&nodes, &rels, &ids(&["a"]), Direction::Outgoing, PageRankParams::default());
        assert_eq!(result.ranks.len(), 2);
        let total: f64 = result.ranks.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }
}
