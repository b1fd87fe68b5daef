use std::sync::Arc;

use fnv::FnvHashMap;
use log::debug;

use graphflow_commons::conf::DistMode;
use graphflow_commons::err::{GraphFlowError, Result};
use graphflow_commons::graph::{unique_in_order, Direction, GraphIndex};
use graphflow_commons::partbook::PartitionBook;
use graphflow_commons::rpc::{Request, Response};
use graphflow_commons::sampling::{
    FlowBlock, LoaderOptions, NodeFlow, NodeFlowLoader, PrefetchLoader, Sampler, SamplerSpec,
};
use graphflow_commons::service::{SamplingRequest, SamplingResponse};
use graphflow_commons::NodeId;

use crate::cltctx::ClientContext;

/// Batching and strategy options for a [`DistNodeFlowLoader`].
#[derive(Debug, Clone)]
pub struct DistLoaderOptions {
    pub batch_size: usize,
    pub seed_nodes: Vec<NodeId>,
    pub spec: SamplerSpec,
    pub direction: Direction,
    pub shuffle: bool,
    pub drop_last: bool,
    /// Worker chunks per round when sampling locally.
    pub num_workers: usize,
}

enum Backend {
    /// Route each seed batch to owning partitions over RPC and merge the
    /// per-partition flows.
    Remote {
        ctx: Arc<ClientContext>,
        book: Arc<dyn PartitionBook>,
        chunks: Vec<Vec<NodeId>>,
        next_chunk: usize,
        spec: SamplerSpec,
        direction: Direction,
    },
    /// Sample in process, no sockets.
    Local(NodeFlowLoader),
}

/// NodeFlow stream for a trainer. In distributed mode every batch is
/// scattered to the partitions owning its seeds; in standalone mode it
/// degenerates to the in-process loader.
pub struct DistNodeFlowLoader {
    backend: Backend,
    faulted: bool,
}

impl DistNodeFlowLoader {
    pub fn remote(
        ctx: Arc<ClientContext>,
        book: Arc<dyn PartitionBook>,
        options: DistLoaderOptions,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(GraphFlowError::config("batch_size must be at least 1"));
        }
        let mut seeds = options.seed_nodes;
        if options.shuffle {
            use rand::seq::SliceRandom;
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
        Ok(DistNodeFlowLoader {
            backend: Backend::Remote {
                ctx,
                book,
                chunks,
                next_chunk: 0,
                spec: options.spec,
                direction: options.direction,
            },
            faulted: false,
        })
    }

    pub fn local(graph: Arc<dyn GraphIndex>, options: DistLoaderOptions) -> Result<Self> {
        let sampler: Arc<dyn Sampler> = Arc::from(options.spec.build(options.direction));
        let loader = NodeFlowLoader::new(
            graph,
            sampler,
            LoaderOptions {
                batch_size: options.batch_size,
                seed_nodes: Some(options.seed_nodes),
                shuffle: options.shuffle,
                num_workers: options.num_workers,
                drop_last: options.drop_last,
            },
        )?;
        Ok(DistNodeFlowLoader {
            backend: Backend::Local(loader),
            faulted: false,
        })
    }

    /// Pick the backend from the process-mode toggle: distributed mode
    /// needs the connected client and book, anything else samples locally.
    pub fn auto(
        remote: Option<(Arc<ClientContext>, Arc<dyn PartitionBook>)>,
        local_graph: Option<Arc<dyn GraphIndex>>,
        options: DistLoaderOptions,
    ) -> Result<Self> {
        match DistMode::from_env() {
            DistMode::Distributed => {
                let (ctx, book) = remote.ok_or_else(|| {
                    GraphFlowError::config("distributed mode needs a connected client context")
                })?;
                Self::remote(ctx, book, options)
            }
            DistMode::Standalone => {
                let graph = local_graph.ok_or_else(|| {
                    GraphFlowError::config("standalone mode needs a local graph")
                })?;
                Self::local(graph, options)
            }
        }
    }

    pub fn num_batches(&self) -> usize {
        match &self.backend {
            Backend::Remote { chunks, .. } => chunks.len(),
            Backend::Local(loader) => loader.num_batches(),
        }
    }

    /// Overlap sampling with training through a bounded prefetch queue.
    pub fn with_prefetch(self, num_prefetch: usize) -> Result<PrefetchLoader<NodeFlow>> {
        PrefetchLoader::new(move || Ok(self), num_prefetch)
    }

}

fn next_remote(
    ctx: &ClientContext,
    book: &Arc<dyn PartitionBook>,
    chunks: &[Vec<NodeId>],
    next_chunk: &mut usize,
    spec: &SamplerSpec,
    direction: Direction,
) -> Option<Result<NodeFlow>> {
    if *next_chunk >= chunks.len() {
        return None;
    }
    let chunk = &chunks[*next_chunk];
    *next_chunk += 1;

    let result = (|| {
        // Group the batch's seeds by owning partition.
        let owners = book.nid2partid(chunk)?;
        let mut grouped: FnvHashMap<usize, Vec<NodeId>> = FnvHashMap::default();
        for (&seed, &owner) in chunk.iter().zip(&owners) {
            grouped.entry(owner).or_default().push(seed);
        }
        let parts: Vec<usize> = grouped.keys().copied().collect();
        let requests: Vec<SamplingRequest> = parts
            .iter()
            .map(|p| SamplingRequest {
                seeds: grouped[p].clone(),
                spec: spec.clone(),
                direction,
            })
            .collect();
        let targets: Vec<(usize, &dyn Request)> = parts
            .iter()
            .zip(&requests)
            .map(|(&p, r)| (p, r as &dyn Request))
            .collect();
        debug!(
            "sampling batch of {} seed(s) across {} partition(s)",
            chunk.len(),
            parts.len()
        );
        let responses = ctx.remote_call_to_machine(&targets)?;
        let flows = responses
            .into_iter()
            .map(|resp| {
                resp.as_any()
                    .downcast_ref::<SamplingResponse>()
                    .map(|s| s.flow.clone())
                    .ok_or_else(|| {
                        GraphFlowError::internal("sampling returned a foreign response")
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        merge_flows(flows)
    })();
    Some(result)
}

impl Iterator for DistNodeFlowLoader {
    type Item = Result<NodeFlow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.faulted {
            return None;
        }
        let item = match &mut self.backend {
            Backend::Remote {
                ctx,
                book,
                chunks,
                next_chunk,
                spec,
                direction,
            } => next_remote(ctx, book, chunks, next_chunk, spec, *direction),
            Backend::Local(loader) => loader.next(),
        };
        if matches!(item, Some(Err(_))) {
            self.faulted = true;
        }
        item
    }
}

/// Union per-partition flows for one seed batch: layers concatenate (first
/// occurrence wins on duplicates), blocks concatenate. All inputs share the
/// same layer count because they were sampled with the same strategy.
fn merge_flows(flows: Vec<NodeFlow>) -> Result<NodeFlow> {
    let mut iter = flows.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| GraphFlowError::internal("no flows to merge"))?;
    let num_layers = first.num_layers();
    let mut layers: Vec<Vec<NodeId>> = (0..num_layers)
        .map(|i| first.layer(i).map(|l| l.to_vec()))
        .collect::<Result<Vec<_>>>()?;
    let mut blocks: Vec<FlowBlock> = first.blocks().to_vec();

    for flow in iter {
        if flow.num_layers() != num_layers {
            return Err(GraphFlowError::internal(format!(
                "cannot merge flows with {} and {} layers",
                num_layers,
                flow.num_layers()
            )));
        }
        for (i, layer) in layers.iter_mut().enumerate() {
            layer.extend_from_slice(flow.layer(i)?);
        }
        for (i, block) in blocks.iter_mut().enumerate() {
            let other = flow.edges_between(i)?;
            block.src.extend_from_slice(&other.src);
            block.dst.extend_from_slice(&other.dst);
            block.eid.extend_from_slice(&other.eid);
        }
    }
    let layers = layers.into_iter().map(|l| unique_in_order(&l)).collect();
    NodeFlow::new(layers, blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphflow_commons::conf::IpConfig;
    use graphflow_commons::frame::FeatureFrame;
    use graphflow_commons::graph::CsrGraph;
    use graphflow_commons::partition::{load_book, load_partition, partition_graph, EdgeCutPartition};
    use graphflow_commons::rpc::server::start_server;
    use graphflow_commons::rpc::{ServerState, ServiceRegistry};
    use graphflow_commons::sampling::ExpandFactor;
    use graphflow_commons::service::register_builtin_services;
    use graphflow_commons::tensor::Tensor;

    fn path_graph(n: usize) -> CsrGraph {
        let mut edges = Vec::new();
        for i in 0..(n as u64 - 1) {
            edges.push((i, i + 1));
            edges.push((i + 1, i));
        }
        CsrGraph::from_edges(n, &edges).unwrap()
    }

    fn neighbor_spec() -> SamplerSpec {
        SamplerSpec::Neighbor {
            expand_factor: ExpandFactor::Count(2),
            num_hops: 2,
            add_self_loop: false,
        }
    }

    fn options(seeds: Vec<u64>, batch_size: usize) -> DistLoaderOptions {
        DistLoaderOptions {
            batch_size,
            seed_nodes: seeds,
            spec: neighbor_spec(),
            direction: Direction::In,
            shuffle: false,
            drop_last: false,
            num_workers: 1,
        }
    }

    #[test]
    fn local_backend_batches_and_samples() {
        let graph: Arc<dyn GraphIndex> = Arc::new(path_graph(20));
        let loader =
            DistNodeFlowLoader::local(graph, options((0..20).collect(), 8)).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let flows: Vec<NodeFlow> = loader.map(|r| r.unwrap()).collect();
        assert_eq!(flows.len(), 3);
        assert_eq!(flows[2].seeds().len(), 4);
        for flow in &flows {
            assert_eq!(flow.num_layers(), 3);
        }
    }

    #[test]
    fn auto_defaults_to_standalone() {
        // Without the env toggle the loader must not require a connection.
        let graph: Arc<dyn GraphIndex> = Arc::new(path_graph(10));
        let loader =
            DistNodeFlowLoader::auto(None, Some(graph), options((0..10).collect(), 5)).unwrap();
        assert_eq!(loader.num_batches(), 2);
    }

    #[test]
    fn local_backend_with_prefetch_overlap() {
        let graph: Arc<dyn GraphIndex> = Arc::new(path_graph(32));
        let loader =
            DistNodeFlowLoader::local(graph, options((0..32).collect(), 8)).unwrap();
        let prefetched = loader.with_prefetch(2).unwrap();
        let flows: Vec<NodeFlow> = prefetched.map(|r| r.unwrap()).collect();
        assert_eq!(flows.len(), 4);
    }

    #[test]
    fn merge_unions_layers_and_concatenates_blocks() {
        let a = NodeFlow::new(
            vec![vec![2], vec![1]],
            vec![FlowBlock {
                src: vec![2],
                dst: vec![1],
                eid: vec![0],
            }],
        )
        .unwrap();
        let b = NodeFlow::new(
            vec![vec![2, 4], vec![3]],
            vec![FlowBlock {
                src: vec![2, 4],
                dst: vec![3, 3],
                eid: vec![1, 2],
            }],
        )
        .unwrap();
        let merged = merge_flows(vec![a, b]).unwrap();
        assert_eq!(merged.layer(0).unwrap(), &[2, 4]);
        assert_eq!(merged.seeds(), &[1, 3]);
        assert_eq!(merged.edges_between(0).unwrap().len(), 3);
    }

    #[test]
    fn distributed_sampling_and_feature_pull_end_to_end() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let graph = path_graph(40);
        let mut feats = FeatureFrame::new(40);
        feats
            .insert("labels", Tensor::from_slice(&(0..40i64).collect::<Vec<_>>()))
            .unwrap();
        let manifest = partition_graph(
            &graph,
            "dist",
            2,
            dir.path(),
            2,
            &EdgeCutPartition::new(),
            Some(&feats),
            None,
            false,
        )
        .unwrap();

        // Two single-server "machines" on loopback, one partition each.
        let ip_config = IpConfig::parse("127.0.0.1 1\n127.0.0.1 1")
            .unwrap()
            .with_base_port(31901);
        let mut servers = Vec::new();
        for server_id in 0..2usize {
            let conf = ip_config.clone();
            let manifest = manifest.clone();
            servers.push(std::thread::spawn(move || {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async move {
                    let part = load_partition(&manifest, server_id).unwrap();
                    let state = ServerState::from_partition(part);
                    let mut registry = ServiceRegistry::new();
                    register_builtin_services(&mut registry).unwrap();
                    start_server(server_id, &conf, 2, 1, state, Arc::new(registry))
                        .await
                        .unwrap();
                });
            }));
        }

        let ctx = Arc::new(ClientContext::connect(ip_config, 2).unwrap());
        let book = load_book(&manifest).unwrap();

        // Cross-partition pull comes back in caller order.
        let ids = vec![5u64, 30, 1, 38, 17];
        let pulled = ctx.pull(&book, "node/labels", &ids).unwrap();
        assert_eq!(
            pulled.to_vec::<i64>().unwrap(),
            vec![5, 30, 1, 38, 17]
        );

        // Distributed sampling covers every seed with the right layer count.
        let loader = DistNodeFlowLoader::remote(
            ctx.clone(),
            book.clone(),
            options((0..40).collect(), 8),
        )
        .unwrap();
        assert_eq!(loader.num_batches(), 5);
        let mut seen = 0;
        for flow in loader {
            let flow = flow.unwrap();
            assert_eq!(flow.num_layers(), 3);
            seen += flow.seeds().len();
        }
        assert_eq!(seen, 40);

        // Push a new value and read it back through the other direction.
        ctx.push(&book, "node/labels", &[7, 33], &Tensor::from_slice(&[-7i64, -33]))
            .unwrap();
        let updated = ctx.pull(&book, "node/labels", &[33, 7]).unwrap();
        assert_eq!(updated.to_vec::<i64>().unwrap(), vec![-33, -7]);

        ctx.exit().unwrap();
        for server in servers {
            server.join().unwrap();
        }
    }
}
