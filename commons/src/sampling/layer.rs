use fnv::FnvHashSet;

use crate::err::{GraphFlowError, Result};
use crate::graph::{Direction, GraphIndex};
use crate::sampling::neighbor::{check_seeds, pick_neighbors};
use crate::sampling::nodeflow::{FlowBlock, NodeFlow};
use crate::sampling::Sampler;
use crate::NodeId;

/// Layer-wise sampling: instead of expanding every seed independently, each
/// hop draws one fixed-size node set from the candidate pool induced by the
/// previous layer. One batched draw per layer, which is the cheap strategy
/// on dense graphs.
#[derive(Debug, Clone)]
pub struct LayerSampler {
    /// Requested node count per sampled layer, seed-side first.
    layer_sizes: Vec<usize>,
    direction: Direction,
    node_prob: Option<Vec<f64>>,
}

impl LayerSampler {
    pub fn new(layer_sizes: Vec<usize>) -> Self {
        LayerSampler {
            layer_sizes,
            direction: Direction::In,
            node_prob: None,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_node_prob(mut self, node_prob: Vec<f64>) -> Self {
        self.node_prob = Some(node_prob);
        self
    }
}

impl Sampler for LayerSampler {
    fn sample(&self, graph: &dyn GraphIndex, seeds: &[NodeId]) -> Result<NodeFlow> {
        check_seeds(graph, seeds)?;
        if self.layer_sizes.iter().any(|&s| s == 0) {
            return Err(GraphFlowError::config("layer sizes must be positive"));
        }
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
        let mut layers_rev = vec![crate::graph::unique_in_order(seeds)];
        let mut blocks_rev = Vec::with_capacity(self.layer_sizes.len());

        for &size in &self.layer_sizes {
            let frontier = layers_rev.last().unwrap().clone();
            // Pool of distinct candidate ancestors across the whole layer.
            let mut pool = Vec::new();
            let mut pool_seen = FnvHashSet::default();
            let mut edges = Vec::new();
            for &v in &frontier {
                for (u, e) in graph.neighbors(v, self.direction) {
                    edges.push((u, v, e));
                    if pool_seen.insert(u) {
                        pool.push((u, 0));
                    }
                }
            }
            let k = size.min(pool.len());
            let chosen: FnvHashSet<NodeId> =
                pick_neighbors(&mut rng, &pool, k, self.node_prob.as_deref())
                    .into_iter()
                    .map(|(u, _)| u)
                    .collect();
            // Keep every pool edge whose ancestor survived the draw, so the
            // chosen layer stays fully wired to the previous one.
            let mut block = FlowBlock::default();
            let mut next = Vec::with_capacity(chosen.len());
            let mut next_seen = FnvHashSet::default();
            for (u, v, e) in edges {
                if chosen.contains(&u) {
                    block.src.push(u);
                    block.dst.push(v);
                    block.eid.push(e as i64);
                    if next_seen.insert(u) {
                        next.push(u);
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
