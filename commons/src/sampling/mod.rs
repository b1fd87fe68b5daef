pub mod layer;
pub mod loader;
pub mod neighbor;
pub mod nodeflow;
pub mod prefetch;

use serde::{Deserialize, Serialize};

use crate::err::Result;
use crate::graph::{Direction, GraphIndex};
use crate::NodeId;

pub use layer::LayerSampler;
pub use loader::{LoaderOptions, NodeFlowLoader};
pub use neighbor::{ExpandFactor, NeighborSampler};
pub use nodeflow::{FlowBlock, NodeFlow, SELF_LOOP_EDGE_ID};
pub use prefetch::PrefetchLoader;

/// A sampling strategy: consumes a graph handle and a seed set, produces
/// one layered NodeFlow. Implementations must be freely shareable across
/// the loader's worker chunks.
pub trait Sampler: Send + Sync {
    fn sample(&self, graph: &dyn GraphIndex, seeds: &[NodeId]) -> Result<NodeFlow>;
}

/// Wire-friendly description of a sampler, used by sampling requests to
/// rebuild the strategy server-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SamplerSpec {
    Neighbor {
        expand_factor: ExpandFactor,
        num_hops: usize,
        add_self_loop: bool,
    },
    Layer {
        layer_sizes: Vec<usize>,
    },
}

impl SamplerSpec {
    pub fn build(&self, direction: Direction) -> Box<dyn Sampler> {
        match self {
            SamplerSpec::Neighbor {
                expand_factor,
                num_hops,
                add_self_loop,
            } => Box::new(
                NeighborSampler::new(*expand_factor, *num_hops)
                    .with_direction(direction)
                    .with_self_loop(*add_self_loop),
            ),
            SamplerSpec::Layer { layer_sizes } => {
                Box::new(LayerSampler::new(layer_sizes.clone()).with_direction(direction))
            }
        }
    }
}
