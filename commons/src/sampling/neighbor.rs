use fnv::FnvHashSet;
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::err::{GraphFlowError, Result};
use crate::graph::{Direction, GraphIndex};
use crate::sampling::nodeflow::{FlowBlock, NodeFlow, SELF_LOOP_EDGE_ID};
use crate::sampling::Sampler;
use crate::{EdgeId, NodeId};

/// How many neighbors to keep per node per hop, resolved against the node's
/// degree at sample time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExpandFactor {
    /// An absolute count.
    Count(usize),
    /// A fraction of the neighbor list.
    Fraction(f64),
    /// `ceil(sqrt(degree))`.
    SqrtDegree,
}

impl ExpandFactor {
    pub fn resolve(&self, degree: usize) -> usize {
        let wanted = match *self {
            ExpandFactor::Count(k) => k,
            ExpandFactor::Fraction(f) => (f * degree as f64).ceil() as usize,
            ExpandFactor::SqrtDegree => (degree as f64).sqrt().ceil() as usize,
        };
        wanted.min(degree)
    }
}

/// Per-seed neighborhood expansion: every hop samples up to the expand
/// factor from each frontier node's neighbor list, growing one NodeFlow
/// layer per hop.
#[derive(Debug, Clone)]
pub struct NeighborSampler {
    expand_factor: ExpandFactor,
    num_hops: usize,
    direction: Direction,
    node_prob: Option<Vec<f64>>,
    add_self_loop: bool,
}

impl NeighborSampler {
    pub fn new(expand_factor: ExpandFactor, num_hops: usize) -> Self {
        NeighborSampler {
            expand_factor,
            num_hops,
            direction: Direction::In,
            node_prob: None,
            add_self_loop: false,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Per-node sampling weights indexed by node id; `None` is uniform.
    pub fn with_node_prob(mut self, node_prob: Vec<f64>) -> Self {
        self.node_prob = Some(node_prob);
        self
    }

    pub fn with_self_loop(mut self, add_self_loop: bool) -> Self {
        self.add_self_loop = add_self_loop;
        self
    }
}

impl Sampler for NeighborSampler {
    fn sample(&self, graph: &dyn GraphIndex, seeds: &[NodeId]) -> Result<NodeFlow> {
        check_seeds(graph, seeds)?;
        if let Some(prob) = &self.node_prob {
            if prob.len() != graph.num_nodes() {
                return Err(GraphFlowError::config(format!(
                    "node_prob has {} entries for a graph of {} nodes",
                    prob.len(),
                    graph.num_nodes()
                )));
            }
        }

        let mut rng = rand::rng();
        let seed_layer = crate::graph::unique_in_order(seeds);
        // Built seed-side first, reversed at the end so layer 0 is farthest.
        let mut layers_rev = vec![seed_layer];
        let mut blocks_rev = Vec::with_capacity(self.num_hops);

        for _ in 0..self.num_hops {
            let frontier = layers_rev.last().unwrap().clone();
            let mut next = Vec::new();
            let mut seen = FnvHashSet::default();
            let mut block = FlowBlock::default();
            for &v in &frontier {
                let candidates = graph.neighbors(v, self.direction);
                let k = self.expand_factor.resolve(candidates.len());
                for (u, e) in pick_neighbors(&mut rng, &candidates, k, self.node_prob.as_deref()) {
                    block.src.push(u);
                    block.dst.push(v);
                    block.eid.push(e as i64);
                    if seen.insert(u) {
                        next.push(u);
                    }
                }
                if self.add_self_loop {
                    block.src.push(v);
                    block.dst.push(v);
                    block.eid.push(SELF_LOOP_EDGE_ID);
                    if seen.insert(v) {
                        next.push(v);
                    }
                }
            }
            layers_rev.push(next);
            blocks_rev.push(block);
        }

        layers_rev.reverse();
        blocks_rev.reverse();
        NodeFlow::new(layers_rev, blocks_rev)
    }
}

pub(crate) fn check_seeds(graph: &dyn GraphIndex, seeds: &[NodeId]) -> Result<()> {
    let count = graph.num_nodes() as u64;
    for &s in seeds {
        if s >= count {
            return Err(GraphFlowError::OutOfRange { id: s, count });
        }
    }
    Ok(())
}

/// Sample `k` candidates without replacement, optionally weighted by the
/// destination node's probability. Weighted draws use exponential sort keys
/// (`u^(1/w)`), which reduces to uniform sampling when all weights match.
pub(crate) fn pick_neighbors<R: Rng>(
    rng: &mut R,
    candidates: &[(NodeId, EdgeId)],
    k: usize,
    node_prob: Option<&[f64]>,
) -> Vec<(NodeId, EdgeId)> {
    if k >= candidates.len() {
        return candidates.to_vec();
    }
    match node_prob {
        None => index::sample(rng, candidates.len(), k)
            .into_iter()
            .map(|i| candidates[i])
            .collect(),
        Some(prob) => {
            let mut keyed: Vec<(f64, usize)> = candidates
                .iter()
                .enumerate()
                .filter_map(|(i, &(u, _))| {
                    let w = prob.get(u as usize).copied().unwrap_or(0.0);
                    if w <= 0.0 {
                        return None;
                    }
                    let key = rng.random::<f64>().powf(1.0 / w);
                    Some((key, i))
                })
                .collect();
            keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            keyed.truncate(k);
            keyed.into_iter().map(|(_, i)| candidates[i]).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CsrGraph;
    use fnv::FnvHashSet;

    fn chain_with_fanin() -> CsrGraph {
        // Nodes 1..=4 all point into 0; node 5 points into 1 and 2.
        CsrGraph::from_edges(6, &[(1, 0), (2, 0), (3, 0), (4, 0), (5, 1), (5, 2)]).unwrap()
    }

    #[test]
    fn expand_factor_resolution() {
        assert_eq!(ExpandFactor::Count(3).resolve(10), 3);
        assert_eq!(ExpandFactor::Count(30).resolve(10), 10);
        assert_eq!(ExpandFactor::Fraction(0.5).resolve(10), 5);
        assert_eq!(ExpandFactor::SqrtDegree.resolve(9), 3);
        assert_eq!(ExpandFactor::SqrtDegree.resolve(0), 0);
    }

    #[test]
    fn layer_count_and_seed_layer() {
        let g = chain_with_fanin();
        let sampler = NeighborSampler::new(ExpandFactor::Count(2), 2);
        let flow = sampler.sample(&g, &[0]).unwrap();
        assert_eq!(flow.num_layers(), 3);
        assert_eq!(flow.seeds(), &[0]);
    }

    #[test]
    fn every_edge_connects_consecutive_layers() {
        let g = chain_with_fanin();
        let sampler = NeighborSampler::new(ExpandFactor::Count(10), 2);
        let flow = sampler.sample(&g, &[0]).unwrap();
        for i in 0..flow.num_hops() {
            let upper: FnvHashSet<_> = flow.layer(i).unwrap().iter().copied().collect();
            let lower: FnvHashSet<_> = flow.layer(i + 1).unwrap().iter().copied().collect();
            let block = flow.edges_between(i).unwrap();
            for (&u, &v) in block.src.iter().zip(&block.dst) {
                assert!(upper.contains(&u));
                assert!(lower.contains(&v));
            }
        }
        // Full expansion pulls the whole fan-in at hop one.
        let hop1: FnvHashSet<_> = flow.layer(1).unwrap().iter().copied().collect();
        assert_eq!(hop1, [1u64, 2, 3, 4].into_iter().collect());
    }

    #[test]
    fn expand_factor_caps_sampled_neighbors() {
        let g = chain_with_fanin();
        let sampler = NeighborSampler::new(ExpandFactor::Count(2), 1);
        let flow = sampler.sample(&g, &[0]).unwrap();
        assert_eq!(flow.edges_between(0).unwrap().len(), 2);
        assert_eq!(flow.layer(0).unwrap().len(), 2);
    }

    #[test]
    fn self_loops_use_the_sentinel_edge_id() {
        let g = chain_with_fanin();
        let sampler = NeighborSampler::new(ExpandFactor::Count(1), 1).with_self_loop(true);
        let flow = sampler.sample(&g, &[0]).unwrap();
        let block = flow.edges_between(0).unwrap();
        assert!(block.eid.contains(&SELF_LOOP_EDGE_ID));
        assert!(flow.layer(0).unwrap().contains(&0));
    }

    #[test]
    fn zero_probability_nodes_are_never_sampled() {
        let g = chain_with_fanin();
        let mut prob = vec![1.0; 6];
        prob[3] = 0.0;
        let sampler = NeighborSampler::new(ExpandFactor::Count(3), 1).with_node_prob(prob);
        for _ in 0..20 {
            let flow = sampler.sample(&g, &[0]).unwrap();
            assert!(!flow.layer(0).unwrap().contains(&3));
        }
    }

    #[test]
    fn out_of_range_seed_is_rejected() {
        let g = chain_with_fanin();
        let sampler = NeighborSampler::new(ExpandFactor::Count(1), 1);
        assert!(matches!(
            sampler.sample(&g, &[6]),
            Err(GraphFlowError::OutOfRange { id: 6, count: 6 })
        ));
    }

    #[test]
    fn bad_node_prob_length_is_config_error() {
        let g = chain_with_fanin();
        let sampler = NeighborSampler::new(ExpandFactor::Count(1), 1).with_node_prob(vec![1.0; 2]);
        assert!(matches!(
            sampler.sample(&g, &[0]),
            Err(GraphFlowError::Config(_))
        ));
    }
}
