use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};

use crate::err::{GraphFlowError, Result};
use crate::rpc::{decode_meta, encode_meta, Payload};
use crate::tensor::Tensor;
use crate::NodeId;

/// Synthetic self-loop edges carry this id instead of a real edge id.
pub const SELF_LOOP_EDGE_ID: i64 = -1;

/// Edges connecting one NodeFlow layer to the next. `src[j]` lives in layer
/// `i`, `dst[j]` in layer `i + 1`; `eid[j]` is the originating graph edge or
/// [`SELF_LOOP_EDGE_ID`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowBlock {
    pub src: Vec<NodeId>,
    pub dst: Vec<NodeId>,
    pub eid: Vec<i64>,
}

impl FlowBlock {
    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }
}

/// A layered, acyclic subgraph produced by one sampling call. Layer `k` is
/// the seed set, layer `0` the farthest ancestors; edges only run from a
/// layer to the next one. Disposable: rebuilt per call, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFlow {
    layers: Vec<Vec<NodeId>>,
    blocks: Vec<FlowBlock>,
}

impl NodeFlow {
    /// Assemble and validate: `blocks.len() + 1 == layers.len()`, and every
    /// block edge must connect consecutive layers. Construction is the only
    /// mutation point, which is what keeps a NodeFlow acyclic.
    pub fn new(layers: Vec<Vec<NodeId>>, blocks: Vec<FlowBlock>) -> Result<Self> {
        if layers.is_empty() {
            return Err(GraphFlowError::config("a NodeFlow needs at least one layer"));
        }
        if blocks.len() + 1 != layers.len() {
            return Err(GraphFlowError::config(format!(
                "{} blocks cannot connect {} layers",
                blocks.len(),
                layers.len()
            )));
        }
        for (i, block) in blocks.iter().enumerate() {
            if block.src.len() != block.dst.len() || block.src.len() != block.eid.len() {
                return Err(GraphFlowError::config("flow block arrays disagree on length"));
            }
            let upper: FnvHashSet<NodeId> = layers[i].iter().copied().collect();
            let lower: FnvHashSet<NodeId> = layers[i + 1].iter().copied().collect();
            for (&u, &v) in block.src.iter().zip(&block.dst) {
                if !upper.contains(&u) || !lower.contains(&v) {
                    return Err(GraphFlowError::config(format!(
                        "edge ({}, {}) does not connect layer {} to layer {}",
                        u,
                        v,
                        i,
                        i + 1
                    )));
                }
            }
        }
        Ok(NodeFlow { layers, blocks })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Hops sampled, i.e. `num_layers() - 1`.
    pub fn num_hops(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn num_nodes(&self) -> usize {
        self.layers.iter().map(|l| l.len()).sum()
    }

    pub fn num_edges(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    pub fn layer(&self, i: usize) -> Result<&[NodeId]> {
        self.layers
            .get(i)
            .map(|l| l.as_slice())
            .ok_or_else(|| GraphFlowError::config(format!("layer {} out of range", i)))
    }

    /// The seed layer (the last one).
    pub fn seeds(&self) -> &[NodeId] {
        self.layers.last().map(|l| l.as_slice()).unwrap_or(&[])
    }

    /// Edges from layer `i` to layer `i + 1`.
    pub fn edges_between(&self, i: usize) -> Result<&FlowBlock> {
        self.blocks
            .get(i)
            .ok_or_else(|| GraphFlowError::config(format!("block {} out of range", i)))
    }

    pub fn blocks(&self) -> &[FlowBlock] {
        &self.blocks
    }

    /// Map graph-global ids to NodeFlow-local ids. Nodes are numbered layer
    /// by layer starting at layer 0; an id appearing in several layers maps
    /// to its earliest occurrence.
    pub fn map_to_subgraph_id(&self, ids: &[NodeId]) -> Result<Vec<u64>> {
        let mut local_of = FnvHashMap::default();
        let mut next = 0u64;
        for layer in &self.layers {
            for &n in layer {
                local_of.entry(n).or_insert_with(|| {
                    let assigned = next;
                    next += 1;
                    assigned
                });
            }
        }
        ids.iter()
            .map(|id| {
                local_of.get(id).copied().ok_or(GraphFlowError::OutOfRange {
                    id: *id,
                    count: next,
                })
            })
            .collect()
    }

    /// Rewrite node and edge ids through lookup tables, keeping the layer
    /// structure. Servers use this to translate partition-local flows back
    /// to global ids before shipping them.
    pub fn relabel(
        &self,
        node_ids: impl Fn(NodeId) -> Result<NodeId>,
        edge_ids: impl Fn(i64) -> Result<i64>,
    ) -> Result<NodeFlow> {
        let layers = self
            .layers
            .iter()
            .map(|layer| layer.iter().map(|&n| node_ids(n)).collect::<Result<Vec<_>>>())
            .collect::<Result<Vec<_>>>()?;
        let blocks = self
            .blocks
            .iter()
            .map(|b| {
                Ok(FlowBlock {
                    src: b.src.iter().map(|&n| node_ids(n)).collect::<Result<Vec<_>>>()?,
                    dst: b.dst.iter().map(|&n| node_ids(n)).collect::<Result<Vec<_>>>()?,
                    eid: b.eid.iter().map(|&e| edge_ids(e)).collect::<Result<Vec<_>>>()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        NodeFlow::new(layers, blocks)
    }
}

#[derive(Serialize, Deserialize)]
struct NodeFlowMeta {
    layer_sizes: Vec<usize>,
    block_sizes: Vec<usize>,
}

impl Payload for NodeFlow {
    /// Numeric id arrays ride the tensor lane; only the layer/block sizes
    /// go through the metadata encoder.
    fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        let meta = NodeFlowMeta {
            layer_sizes: self.layers.iter().map(|l| l.len()).collect(),
            block_sizes: self.blocks.iter().map(|b| b.len()).collect(),
        };
        let nodes: Vec<i64> = self
            .layers
            .iter()
            .flat_map(|l| l.iter().map(|&n| n as i64))
            .collect();
        let src: Vec<i64> = self
            .blocks
            .iter()
            .flat_map(|b| b.src.iter().map(|&n| n as i64))
            .collect();
        let dst: Vec<i64> = self
            .blocks
            .iter()
            .flat_map(|b| b.dst.iter().map(|&n| n as i64))
            .collect();
        let eid: Vec<i64> = self.blocks.iter().flat_map(|b| b.eid.iter().copied()).collect();
        Ok((
            encode_meta(&meta)?,
            vec![
                Tensor::from_slice(&nodes),
                Tensor::from_slice(&src),
                Tensor::from_slice(&dst),
                Tensor::from_slice(&eid),
            ],
        ))
    }

    fn from_payload(data: &[u8], tensors: Vec<Tensor>) -> Result<Self> {
        let meta: NodeFlowMeta = decode_meta(data)?;
        if tensors.len() != 4 {
            return Err(GraphFlowError::Deserialization(format!(
                "NodeFlow payload expects 4 tensors, got {}",
                tensors.len()
            )));
        }
        let nodes = tensors[0].to_vec::<i64>()?;
        let src = tensors[1].to_vec::<i64>()?;
        let dst = tensors[2].to_vec::<i64>()?;
        let eid = tensors[3].to_vec::<i64>()?;

        let mut layers = Vec::with_capacity(meta.layer_sizes.len());
        let mut offset = 0;
        for &size in &meta.layer_sizes {
            let end = offset + size;
            if end > nodes.len() {
                return Err(GraphFlowError::Deserialization(
                    "layer sizes exceed the node buffer".into(),
                ));
            }
            layers.push(nodes[offset..end].iter().map(|&n| n as NodeId).collect());
            offset = end;
        }
        let mut blocks = Vec::with_capacity(meta.block_sizes.len());
        let mut eoff = 0;
        for &size in &meta.block_sizes {
            let end = eoff + size;
            if end > src.len() || end > dst.len() || end > eid.len() {
                return Err(GraphFlowError::Deserialization(
                    "block sizes exceed the edge buffers".into(),
                ));
            }
            blocks.push(FlowBlock {
                src: src[eoff..end].iter().map(|&n| n as NodeId).collect(),
                dst: dst[eoff..end].iter().map(|&n| n as NodeId).collect(),
                eid: eid[eoff..end].to_vec(),
            });
            eoff = end;
        }
        NodeFlow::new(layers, blocks)
    }
}
