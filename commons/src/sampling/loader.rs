use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::err::{GraphFlowError, Result};
use crate::graph::GraphIndex;
use crate::sampling::nodeflow::NodeFlow;
use crate::sampling::Sampler;
use crate::NodeId;

/// Batching options for a [`NodeFlowLoader`].
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    /// Seed population; `None` means every node in the graph.
    pub seed_nodes: Option<Vec<NodeId>>,
    /// Permute batch order. Each batch's internal structure stays
    /// deterministic given its node set.
    pub shuffle: bool,
    /// Chunks materialized per prefetch round. Chunks are independently
    /// computable and order-stable by index, not OS threads.
    pub num_workers: usize,
    /// Drop a ragged final batch instead of yielding it short.
    pub drop_last: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions {
            batch_size: 32,
            seed_nodes: None,
            shuffle: false,
            num_workers: 1,
            drop_last: false,
        }
    }
}

impl LoaderOptions {
    /// One worker chunk per available core.
    pub fn parallel(batch_size: usize) -> Self {
        LoaderOptions {
            batch_size,
            num_workers: num_cpus::get().max(1),
            ..LoaderOptions::default()
        }
    }
}

/// Lazy, finite, non-restartable stream of NodeFlows: seed nodes sliced
/// into `batch_size` chunks, `num_workers` chunks sampled per round in
/// parallel, yielded in chunk order.
pub struct NodeFlowLoader {
    graph: Arc<dyn GraphIndex>,
    sampler: Arc<dyn Sampler>,
    chunks: Vec<Vec<NodeId>>,
    num_workers: usize,
    next_chunk: usize,
    ready: VecDeque<Result<NodeFlow>>,
    faulted: bool,
}

impl NodeFlowLoader {
    pub fn new(
        graph: Arc<dyn GraphIndex>,
        sampler: Arc<dyn Sampler>,
        options: LoaderOptions,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(GraphFlowError::config("batch_size must be at least 1"));
        }
        if options.num_workers == 0 {
            return Err(GraphFlowError::config("num_workers must be at least 1"));
        }
        if !graph.is_readonly() {
            return Err(GraphFlowError::config(
                "NodeFlow loaders only support read-only graphs",
            ));
        }
        let num_nodes = graph.num_nodes() as u64;
        let mut seeds = match options.seed_nodes {
            Some(seeds) => {
                if let Some(&bad) = seeds.iter().find(|&&s| s >= num_nodes) {
                    return Err(GraphFlowError::OutOfRange {
                        id: bad,
                        count: num_nodes,
                    });
                }
                seeds
            }
            None => (0..num_nodes).collect(),
        };
        if options.shuffle {
            seeds.shuffle(&mut rand::rng());
        }
        let mut chunks: Vec<Vec<NodeId>> = seeds
            .chunks(options.batch_size)
            .map(|c| c.to_vec())
            .collect();
        if options.drop_last {
            if let Some(last) = chunks.last() {
                if last.len() < options.batch_size {
                    chunks.pop();
                }
            }
        }
        debug!(
            "loader over {} seed(s): {} batch(es) of size {}",
            chunks.iter().map(|c| c.len()).sum::<usize>(),
            chunks.len(),
            options.batch_size
        );
        Ok(NodeFlowLoader {
            graph,
            sampler,
            chunks,
            num_workers: options.num_workers,
            next_chunk: 0,
            ready: VecDeque::new(),
            faulted: false,
        })
    }

    /// Total batches this loader will yield.
    pub fn num_batches(&self) -> usize {
        self.chunks.len()
    }

    fn refill(&mut self) {
        if self.next_chunk >= self.chunks.len() {
            return;
        }
        let end = (self.next_chunk + self.num_workers).min(self.chunks.len());
        let round = &self.chunks[self.next_chunk..end];
        let graph = &self.graph;
        let sampler = &self.sampler;
        let results: Vec<Result<NodeFlow>> = if round.len() == 1 {
            vec![sampler.sample(graph.as_ref(), &round[0])]
        } else {
            round
                .par_iter()
                .map(|chunk| sampler.sample(graph.as_ref(), chunk))
                .collect()
        };
        self.next_chunk = end;
        self.ready.extend(results);
    }
}

impl Iterator for NodeFlowLoader {
    type Item = Result<NodeFlow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.faulted {
            return None;
        }
        if self.ready.is_empty() {
            self.refill();
        }
        match self.ready.pop_front() {
            Some(Ok(flow)) => Some(Ok(flow)),
            Some(Err(e)) => {
                // A sampling failure ends the stream after being reported.
                self.faulted = true;
                Some(Err(e))
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CsrGraph;
    use crate::sampling::neighbor::{ExpandFactor, NeighborSampler};
    use fnv::FnvHashSet;

    fn ring(n: u64) -> Arc<CsrGraph> {
        let edges: Vec<(u64, u64)> = (0..n).map(|i| (i, (i + 1) % n)).collect();
        Arc::new(CsrGraph::from_edges(n as usize, &edges).unwrap())
    }

    fn sampler() -> Arc<NeighborSampler> {
        Arc::new(NeighborSampler::new(ExpandFactor::Count(2), 1))
    }

    #[test]
    fn batch_count_over_202_seeds() {
        let graph = ring(202);
        let loader = NodeFlowLoader::new(
            graph,
            sampler(),
            LoaderOptions {
                batch_size: 32,
                ..LoaderOptions::default()
            },
        )
        .unwrap();
        assert_eq!(loader.num_batches(), 7);
        let batches: Vec<_> = loader.map(|r| r.unwrap()).collect();
        assert_eq!(batches.len(), 7);
        for flow in &batches[..6] {
            assert_eq!(flow.seeds().len(), 32);
        }
        assert_eq!(batches[6].seeds().len(), 10);
    }

    #[test]
    fn drop_last_discards_ragged_tail() {
        let graph = ring(202);
        let loader = NodeFlowLoader::new(
            graph,
            sampler(),
            LoaderOptions {
                batch_size: 32,
                drop_last: true,
                ..LoaderOptions::default()
            },
        )
        .unwrap();
        assert_eq!(loader.num_batches(), 6);
        assert_eq!(loader.count(), 6);
    }

    #[test]
    fn unshuffled_batches_preserve_chunk_order() {
        let graph = ring(10);
        let loader = NodeFlowLoader::new(
            graph,
            sampler(),
            LoaderOptions {
                batch_size: 4,
                num_workers: 3,
                ..LoaderOptions::default()
            },
        )
        .unwrap();
        let seeds: Vec<Vec<u64>> = loader.map(|r| r.unwrap().seeds().to_vec()).collect();
        assert_eq!(seeds, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
    }

    #[test]
    fn shuffle_permutes_but_covers_all_seeds() {
        let graph = ring(64);
        let loader = NodeFlowLoader::new(
            graph,
            sampler(),
            LoaderOptions {
                shuffle: true,
                ..LoaderOptions::parallel(16)
            },
        )
        .unwrap();
        let seen: FnvHashSet<u64> = loader
            .flat_map(|r| r.unwrap().seeds().to_vec())
            .collect();
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn explicit_seed_nodes_are_validated() {
        let graph = ring(4);
        let result = NodeFlowLoader::new(
            graph,
            sampler(),
            LoaderOptions {
                batch_size: 2,
                seed_nodes: Some(vec![1, 9]),
                ..LoaderOptions::default()
            },
        );
        assert!(matches!(
            result,
            Err(GraphFlowError::OutOfRange { id: 9, count: 4 })
        ));
    }

    #[test]
    fn zero_batch_size_is_config_error() {
        let graph = ring(4);
        let result = NodeFlowLoader::new(
            graph,
            sampler(),
            LoaderOptions {
                batch_size: 0,
                ..LoaderOptions::default()
            },
        );
        assert!(matches!(result, Err(GraphFlowError::Config(_))));
    }

    #[test]
    fn exhausted_loader_stays_exhausted() {
        let graph = ring(4);
        let mut loader = NodeFlowLoader::new(
            graph,
            sampler(),
            LoaderOptions {
                batch_size: 4,
                ..LoaderOptions::default()
            },
        )
        .unwrap();
        assert!(loader.next().is_some());
        assert!(loader.next().is_none());
        assert!(loader.next().is_none());
    }
}
