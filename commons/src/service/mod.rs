//! Built-in services: sampling, feature pull/push and graph metadata. Both
//! sides of the wire register these with the same ids before connecting.

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::err::{GraphFlowError, Result};
use crate::graph::{Direction, GraphIndex};
use crate::partbook::PartitionBook;
use crate::rpc::{
    decode_meta, encode_meta, Payload, Request, Response, ServerState, ServiceId, ServiceRegistry,
};
use crate::sampling::nodeflow::SELF_LOOP_EDGE_ID;
use crate::sampling::{NodeFlow, Sampler, SamplerSpec};
use crate::tensor::Tensor;
use crate::NodeId;

pub const SAMPLING_SERVICE_ID: ServiceId = 1001;
pub const FEATURE_PULL_SERVICE_ID: ServiceId = 1002;
pub const FEATURE_PUSH_SERVICE_ID: ServiceId = 1003;
pub const GRAPH_META_SERVICE_ID: ServiceId = 1004;

/// Register every built-in service. Idempotent, so server and client can
/// both call it on a shared registry.
pub fn register_builtin_services(registry: &mut ServiceRegistry) -> Result<()> {
    registry.register::<SamplingRequest, SamplingResponse>(SAMPLING_SERVICE_ID)?;
    registry.register::<PullRequest, PullResponse>(FEATURE_PULL_SERVICE_ID)?;
    registry.register::<PushRequest, PushResponse>(FEATURE_PUSH_SERVICE_ID)?;
    registry.register::<GraphMetaRequest, GraphMetaResponse>(GRAPH_META_SERVICE_ID)?;
    Ok(())
}

fn ids_tensor(ids: &[u64]) -> Tensor {
    let signed: Vec<i64> = ids.iter().map(|&v| v as i64).collect();
    Tensor::from_slice(&signed)
}

fn tensor_ids(tensor: &Tensor) -> Result<Vec<u64>> {
    Ok(tensor.to_vec::<i64>()?.into_iter().map(|v| v as u64).collect())
}

fn take_tensor(tensors: &mut Vec<Tensor>, index: usize, what: &str) -> Result<Tensor> {
    if index >= tensors.len() {
        return Err(GraphFlowError::Deserialization(format!(
            "payload is missing the {} buffer",
            what
        )));
    }
    Ok(std::mem::take(&mut tensors[index]))
}

/// Translate global seed ids to partition-local ids through the server's
/// partition book; identity when the server runs standalone.
fn seeds_to_local(state: &ServerState, seeds: &[NodeId]) -> Result<Vec<NodeId>> {
    match &state.partition_book {
        Some(book) => book.nid2localnid(seeds, state.part_id),
        None => Ok(seeds.to_vec()),
    }
}

/// Translate a partition-local NodeFlow back to global ids before it goes
/// on the wire; identity when no mapping arrays were loaded.
fn flow_to_global(state: &ServerState, flow: NodeFlow) -> Result<NodeFlow> {
    if state.global_nids.is_empty() {
        return Ok(flow);
    }
    let nids = &state.global_nids;
    let eids = &state.global_eids;
    flow.relabel(
        |n| {
            nids.get(n as usize).copied().ok_or(GraphFlowError::OutOfRange {
                id: n,
                count: nids.len() as u64,
            })
        },
        |e| {
            if e == SELF_LOOP_EDGE_ID {
                return Ok(e);
            }
            eids.get(e as usize)
                .map(|&g| g as i64)
                .ok_or(GraphFlowError::OutOfRange {
                    id: e as u64,
                    count: eids.len() as u64,
                })
        },
    )
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Sample a NodeFlow from the server's local partition for a batch of
/// global seed ids. Seeds must be owned by the target partition.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingRequest {
    pub seeds: Vec<NodeId>,
    pub spec: SamplerSpec,
    pub direction: Direction,
}

#[derive(Serialize, Deserialize)]
struct SamplingMeta {
    spec: SamplerSpec,
    direction: Direction,
}

impl Payload for SamplingRequest {
    fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        let meta = SamplingMeta {
            spec: self.spec.clone(),
            direction: self.direction,
        };
        Ok((encode_meta(&meta)?, vec![ids_tensor(&self.seeds)]))
    }

    fn from_payload(data: &[u8], mut tensors: Vec<Tensor>) -> Result<Self> {
        let meta: SamplingMeta = decode_meta(data)?;
        let seeds = tensor_ids(&take_tensor(&mut tensors, 0, "seed")?)?;
        Ok(SamplingRequest {
            seeds,
            spec: meta.spec,
            direction: meta.direction,
        })
    }
}

impl Request for SamplingRequest {
    fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        self.to_payload()
    }

    fn process(&self, state: &ServerState) -> Result<Box<dyn Response>> {
        let graph = state.graph()?;
        let local_seeds = seeds_to_local(state, &self.seeds)?;
        let sampler = self.spec.build(self.direction);
        let local_flow = sampler.sample(graph.as_ref(), &local_seeds)?;
        let flow = flow_to_global(state, local_flow)?;
        Ok(Box::new(SamplingResponse { flow }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingResponse {
    pub flow: NodeFlow,
}

impl Payload for SamplingResponse {
    fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        self.flow.to_payload()
    }

    fn from_payload(data: &[u8], tensors: Vec<Tensor>) -> Result<Self> {
        Ok(SamplingResponse {
            flow: NodeFlow::from_payload(data, tensors)?,
        })
    }
}

impl Response for SamplingResponse {
    fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        self.to_payload()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Feature pull / push
// ---------------------------------------------------------------------------

/// Fetch feature rows by global node id from the server's K-V store.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub name: String,
    pub ids: Vec<u64>,
}

impl Payload for PullRequest {
    fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        Ok((encode_meta(&self.name)?, vec![ids_tensor(&self.ids)]))
    }

    fn from_payload(data: &[u8], mut tensors: Vec<Tensor>) -> Result<Self> {
        Ok(PullRequest {
            name: decode_meta(data)?,
            ids: tensor_ids(&take_tensor(&mut tensors, 0, "row id")?)?,
        })
    }
}

impl Request for PullRequest {
    fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        self.to_payload()
    }

    fn process(&self, state: &ServerState) -> Result<Box<dyn Response>> {
        let rows = seeds_to_local(state, &self.ids)?;
        let tensor = state.kv.pull(&self.name, &rows)?;
        Ok(Box::new(PullResponse { tensor }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullResponse {
    pub tensor: Tensor,
}

impl Payload for PullResponse {
    fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        Ok((Vec::new(), vec![self.tensor.clone()]))
    }

    fn from_payload(_data: &[u8], mut tensors: Vec<Tensor>) -> Result<Self> {
        Ok(PullResponse {
            tensor: take_tensor(&mut tensors, 0, "value")?,
        })
    }
}

impl Response for PullResponse {
    fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        self.to_payload()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Scatter feature rows into the server's K-V store by global node id.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    pub name: String,
    pub ids: Vec<u64>,
    pub values: Tensor,
}

impl Payload for PushRequest {
    fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        Ok((
            encode_meta(&self.name)?,
            vec![ids_tensor(&self.ids), self.values.clone()],
        ))
    }

    fn from_payload(data: &[u8], mut tensors: Vec<Tensor>) -> Result<Self> {
        let name = decode_meta(data)?;
        let ids = tensor_ids(&take_tensor(&mut tensors, 0, "row id")?)?;
        let values = take_tensor(&mut tensors, 1, "value")?;
        Ok(PushRequest { name, ids, values })
    }
}

impl Request for PushRequest {
    fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        self.to_payload()
    }

    fn process(&self, state: &ServerState) -> Result<Box<dyn Response>> {
        let rows = seeds_to_local(state, &self.ids)?;
        state.kv.push(&self.name, &rows, &self.values)?;
        Ok(Box::new(PushResponse))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PushResponse;

impl Payload for PushResponse {
    fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        Ok((Vec::new(), Vec::new()))
    }

    fn from_payload(_data: &[u8], _tensors: Vec<Tensor>) -> Result<Self> {
        Ok(PushResponse)
    }
}

impl Response for PushResponse {
    fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        self.to_payload()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Graph metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphMetaRequest;

impl Payload for GraphMetaRequest {
    fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        Ok((Vec::new(), Vec::new()))
    }

    fn from_payload(_data: &[u8], _tensors: Vec<Tensor>) -> Result<Self> {
        Ok(GraphMetaRequest)
    }
}

impl Request for GraphMetaRequest {
    fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        self.to_payload()
    }

    fn process(&self, state: &ServerState) -> Result<Box<dyn Response>> {
        let graph = state.graph()?;
        Ok(Box::new(GraphMetaResponse {
            part_id: state.part_id as u64,
            num_nodes: graph.num_nodes() as u64,
            num_edges: graph.num_edges() as u64,
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GraphMetaResponse {
    pub part_id: u64,
    pub num_nodes: u64,
    pub num_edges: u64,
}

impl Payload for GraphMetaResponse {
    fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        Ok((encode_meta(self)?, Vec::new()))
    }

    fn from_payload(data: &[u8], _tensors: Vec<Tensor>) -> Result<Self> {
        decode_meta(data)
    }
}

impl Response for GraphMetaResponse {
    fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
        self.to_payload()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CsrGraph;
    use crate::rpc::{deserialize_from_payload, serialize_to_payload};
    use crate::sampling::ExpandFactor;
    use std::sync::Arc;

    fn state_with_graph() -> ServerState {
        let graph = CsrGraph::from_edges(5, &[(1, 0), (2, 0), (3, 1), (4, 2)]).unwrap();
        let mut state = ServerState::new(0);
        state.graph = Some(Arc::new(graph));
        state
    }

    #[test]
    fn builtin_registration_is_idempotent() {
        let mut registry = ServiceRegistry::new();
        register_builtin_services(&mut registry).unwrap();
        register_builtin_services(&mut registry).unwrap();
        assert!(registry.contains(SAMPLING_SERVICE_ID));
        assert!(registry.contains(GRAPH_META_SERVICE_ID));
    }

    #[test]
    fn sampling_request_round_trip() {
        let req = SamplingRequest {
            seeds: vec![0, 1, 2],
            spec: SamplerSpec::Neighbor {
                expand_factor: ExpandFactor::Count(4),
                num_hops: 2,
                add_self_loop: true,
            },
            direction: Direction::In,
        };
        let (data, tensors) = serialize_to_payload(&req).unwrap();
        let back: SamplingRequest = deserialize_from_payload(&data, tensors).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn sampling_request_processes_against_local_graph() {
        let state = state_with_graph();
        let req = SamplingRequest {
            seeds: vec![0],
            spec: SamplerSpec::Neighbor {
                expand_factor: ExpandFactor::Count(10),
                num_hops: 2,
                add_self_loop: false,
            },
            direction: Direction::In,
        };
        let resp = req.process(&state).unwrap();
        let sampled = resp.as_any().downcast_ref::<SamplingResponse>().unwrap();
        assert_eq!(sampled.flow.num_layers(), 3);
        assert_eq!(sampled.flow.seeds(), &[0]);
    }

    #[test]
    fn sampling_translates_local_flow_to_global_ids() {
        let mut state = state_with_graph();
        // Local node i is global node i + 100, local edge e is global e + 50.
        state.global_nids = (100..105).collect();
        state.global_eids = (50..54).collect();
        let req = SamplingRequest {
            seeds: vec![0],
            spec: SamplerSpec::Neighbor {
                expand_factor: ExpandFactor::Count(10),
                num_hops: 1,
                add_self_loop: true,
            },
            direction: Direction::In,
        };
        let resp = req.process(&state).unwrap();
        let flow = &resp.as_any().downcast_ref::<SamplingResponse>().unwrap().flow;
        assert_eq!(flow.seeds(), &[100]);
        for &e in &flow.edges_between(0).unwrap().eid {
            assert!(e == SELF_LOOP_EDGE_ID || (50..54).contains(&e));
        }
    }

    #[test]
    fn pull_and_push_round_trip_through_kv() {
        let state = state_with_graph();
        state.kv.init("emb", Tensor::zeros(crate::tensor::DType::I64, &[5]));
        let push = PushRequest {
            name: "emb".into(),
            ids: vec![1, 4],
            values: Tensor::from_slice(&[7i64, 9]),
        };
        push.process(&state).unwrap();
        let pull = PullRequest {
            name: "emb".into(),
            ids: vec![0, 1, 4],
        };
        let resp = pull.process(&state).unwrap();
        let pulled = resp.as_any().downcast_ref::<PullResponse>().unwrap();
        assert_eq!(pulled.tensor.to_vec::<i64>().unwrap(), vec![0, 7, 9]);
    }

    #[test]
    fn pull_unknown_key_fails() {
        let state = state_with_graph();
        let pull = PullRequest {
            name: "missing".into(),
            ids: vec![0],
        };
        assert!(pull.process(&state).is_err());
    }

    #[test]
    fn graph_meta_reports_partition_counts() {
        let state = state_with_graph();
        let resp = GraphMetaRequest.process(&state).unwrap();
        let meta = resp.as_any().downcast_ref::<GraphMetaResponse>().unwrap();
        assert_eq!(meta.num_nodes, 5);
        assert_eq!(meta.num_edges, 4);
        assert_eq!(meta.part_id, 0);
    }
}
