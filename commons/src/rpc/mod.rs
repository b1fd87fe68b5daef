use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::err::{GraphFlowError, Result};
use crate::frame::KvStore;
use crate::graph::CsrGraph;
use crate::partbook::PartitionBook;
use crate::tensor::Tensor;
use crate::PartId;

pub mod client;
pub mod codec;
pub mod server;

/// Identifier of a registered (Request, Response) pair. Must resolve to the
/// same pair on every RPC participant.
pub type ServiceId = u32;

/// One framed message on the wire. `data` holds the metadata-encoded state
/// of a request or response; `tensors` carries the raw numeric buffers so
/// they never pass through the metadata encoder.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RpcMessage {
    pub service_id: ServiceId,
    /// Per-sender monotonically increasing counter. Detects reordering and
    /// correlates scatter/gather calls; it does not impose a total order.
    pub msg_seq: u64,
    pub client_id: i64,
    pub server_id: i64,
    pub data: Vec<u8>,
    pub tensors: Vec<Tensor>,
}

/// Declared state capture of a wire-crossing object: how it splits into a
/// metadata blob plus raw tensor buffers, and how it reassembles.
pub trait Payload: Sized {
    fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)>;
    fn from_payload(data: &[u8], tensors: Vec<Tensor>) -> Result<Self>;
}

/// Encode the metadata half of a payload with MessagePack.
pub fn encode_meta<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| GraphFlowError::internal(e.to_string()))
}

/// Decode the metadata half of a payload.
pub fn decode_meta<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(|e| GraphFlowError::Deserialization(e.to_string()))
}

pub fn serialize_to_payload<T: Payload>(value: &T) -> Result<(Vec<u8>, Vec<Tensor>)> {
    value.to_payload()
}

pub fn deserialize_from_payload<T: Payload>(data: &[u8], tensors: Vec<Tensor>) -> Result<T> {
    T::from_payload(data, tensors)
}

/// A request dispatched on a server. Processing runs on blocking worker
/// threads; requests to one `ServerState` may execute concurrently, so any
/// mutable server resource synchronizes internally.
pub trait Request: Send + Sync + 'static {
    fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)>;
    fn process(&self, state: &ServerState) -> Result<Box<dyn Response>>;
    fn as_any(&self) -> &dyn Any;
}

/// A completed reply. Unlike a request it carries no processing logic.
pub trait Response: Send + 'static {
    fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)>;
    fn as_any(&self) -> &dyn Any;
}

/// Everything a server exposes to request processing: the loaded local
/// partition, the shared partition book, and the in-memory K-V store.
/// `global_nids`/`global_eids` translate partition-local ids back to global
/// ones; left empty they act as identity maps (standalone mode).
pub struct ServerState {
    pub part_id: PartId,
    pub graph: Option<Arc<CsrGraph>>,
    pub partition_book: Option<Arc<dyn PartitionBook>>,
    pub global_nids: Vec<crate::NodeId>,
    pub global_eids: Vec<crate::EdgeId>,
    pub kv: KvStore,
}

impl ServerState {
    pub fn new(part_id: PartId) -> Self {
        ServerState {
            part_id,
            graph: None,
            partition_book: None,
            global_nids: Vec::new(),
            global_eids: Vec::new(),
            kv: KvStore::new(),
        }
    }

    /// Wire a loaded partition into the server state, seeding the K-V store
    /// with the partition's feature columns under `node/` and `edge/`
    /// prefixes.
    pub fn from_partition(partition: crate::partition::LoadedPartition) -> Self {
        let mut state = ServerState::new(partition.part_id);
        state.graph = Some(partition.graph);
        state.partition_book = Some(partition.book);
        state.global_nids = partition.global_nids;
        state.global_eids = partition.global_eids;
        for name in partition.node_feats.names().map(str::to_string).collect::<Vec<_>>() {
            if let Some(tensor) = partition.node_feats.column(&name) {
                state.kv.init(format!("node/{}", name), tensor.clone());
            }
        }
        for name in partition.edge_feats.names().map(str::to_string).collect::<Vec<_>>() {
            if let Some(tensor) = partition.edge_feats.column(&name) {
                state.kv.init(format!("edge/{}", name), tensor.clone());
            }
        }
        state
    }

    pub fn graph(&self) -> Result<&Arc<CsrGraph>> {
        self.graph
            .as_ref()
            .ok_or_else(|| GraphFlowError::internal("server has no graph loaded"))
    }

    pub fn partition_book(&self) -> Result<&Arc<dyn PartitionBook>> {
        self.partition_book
            .as_ref()
            .ok_or_else(|| GraphFlowError::internal("server has no partition book loaded"))
    }
}

type DecodeRequestFn = fn(&[u8], Vec<Tensor>) -> Result<Box<dyn Request>>;
type DecodeResponseFn = fn(&[u8], Vec<Tensor>) -> Result<Box<dyn Response>>;

struct ServiceEntry {
    request_type: TypeId,
    response_type: TypeId,
    decode_request: DecodeRequestFn,
    decode_response: DecodeResponseFn,
}

/// Process-scoped dispatch table keyed by service id. Built once before any
/// send or receive, then shared read-only behind an `Arc`; registering the
/// identical pair twice is a no-op, a conflicting pair is an error.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceId, ServiceEntry>,
    request_service: HashMap<TypeId, ServiceId>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<Q, R>(&mut self, service_id: ServiceId) -> Result<()>
    where
        Q: Request + Payload,
        R: Response + Payload,
    {
        let entry = ServiceEntry {
            request_type: TypeId::of::<Q>(),
            response_type: TypeId::of::<R>(),
            decode_request: |data, tensors| {
                Ok(Box::new(Q::from_payload(data, tensors)?) as Box<dyn Request>)
            },
            decode_response: |data, tensors| {
                Ok(Box::new(R::from_payload(data, tensors)?) as Box<dyn Response>)
            },
        };
        match self.services.get(&service_id) {
            Some(existing)
                if existing.request_type == entry.request_type
                    && existing.response_type == entry.response_type =>
            {
                Ok(())
            }
            Some(_) => Err(GraphFlowError::DuplicateService(service_id)),
            None => {
                if self.request_service.contains_key(&entry.request_type) {
                    // One request type cannot serve two ids; replies could
                    // not be routed back to a unique service.
                    return Err(GraphFlowError::DuplicateService(service_id));
                }
                self.request_service.insert(entry.request_type, service_id);
                self.services.insert(service_id, entry);
                Ok(())
            }
        }
    }

    pub fn contains(&self, service_id: ServiceId) -> bool {
        self.services.contains_key(&service_id)
    }

    /// Service id a request value belongs to, resolved by its type.
    pub fn service_of(&self, request: &dyn Request) -> Result<ServiceId> {
        self.request_service
            .get(&request.as_any().type_id())
            .copied()
            .ok_or_else(|| {
                GraphFlowError::config("request type is not registered with any service")
            })
    }

    pub fn decode_request(
        &self,
        service_id: ServiceId,
        data: &[u8],
        tensors: Vec<Tensor>,
    ) -> Result<Box<dyn Request>> {
        let entry = self
            .services
            .get(&service_id)
            .ok_or(GraphFlowError::UnknownService(service_id))?;
        (entry.decode_request)(data, tensors)
    }

    pub fn decode_response(
        &self,
        service_id: ServiceId,
        data: &[u8],
        tensors: Vec<Tensor>,
    ) -> Result<Box<dyn Response>> {
        let entry = self
            .services
            .get(&service_id)
            .ok_or(GraphFlowError::UnknownService(service_id))?;
        (entry.decode_response)(data, tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct EchoRequest {
        text: String,
        numbers: Vec<i64>,
    }

    impl Payload for EchoRequest {
        fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
            Ok((encode_meta(&self.text)?, vec![Tensor::from_slice(&self.numbers)]))
        }

        fn from_payload(data: &[u8], tensors: Vec<Tensor>) -> Result<Self> {
            let text = decode_meta(data)?;
            let numbers = tensors
                .first()
                .ok_or_else(|| GraphFlowError::Deserialization("missing tensor".into()))?
                .to_vec::<i64>()?;
            Ok(EchoRequest { text, numbers })
        }
    }

    impl Request for EchoRequest {
        fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
            self.to_payload()
        }

        fn process(&self, _state: &ServerState) -> Result<Box<dyn Response>> {
            Ok(Box::new(EchoResponse {
                text: self.text.clone(),
                numbers: self.numbers.clone(),
            }))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct EchoResponse {
        text: String,
        numbers: Vec<i64>,
    }

    impl Payload for EchoResponse {
        fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
            Ok((encode_meta(&self.text)?, vec![Tensor::from_slice(&self.numbers)]))
        }

        fn from_payload(data: &[u8], tensors: Vec<Tensor>) -> Result<Self> {
            let text = decode_meta(data)?;
            let numbers = tensors
                .first()
                .ok_or_else(|| GraphFlowError::Deserialization("missing tensor".into()))?
                .to_vec::<i64>()?;
            Ok(EchoResponse { text, numbers })
        }
    }

    impl Response for EchoResponse {
        fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
            self.to_payload()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct OtherRequest;

    impl Payload for OtherRequest {
        fn to_payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
            Ok((Vec::new(), Vec::new()))
        }

        fn from_payload(_data: &[u8], _tensors: Vec<Tensor>) -> Result<Self> {
            Ok(OtherRequest)
        }
    }

    impl Request for OtherRequest {
        fn payload(&self) -> Result<(Vec<u8>, Vec<Tensor>)> {
            self.to_payload()
        }

        fn process(&self, _state: &ServerState) -> Result<Box<dyn Response>> {
            Err(GraphFlowError::internal("unused"))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn payload_round_trip_preserves_fields_and_buffers() {
        let req = EchoRequest {
            text: "hello world!".into(),
            numbers: vec![3, -1, 4, 1, 5],
        };
        let (data, tensors) = serialize_to_payload(&req).unwrap();
        assert_eq!(tensors.len(), 1);
        let back: EchoRequest = deserialize_from_payload(&data, tensors).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn register_is_idempotent_for_identical_pair() {
        let mut registry = ServiceRegistry::new();
        registry.register::<EchoRequest, EchoResponse>(901).unwrap();
        registry.register::<EchoRequest, EchoResponse>(901).unwrap();
        assert!(registry.contains(901));
    }

    #[test]
    fn conflicting_registration_is_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register::<EchoRequest, EchoResponse>(901).unwrap();
        assert!(matches!(
            registry.register::<OtherRequest, EchoResponse>(901),
            Err(GraphFlowError::DuplicateService(901))
        ));
    }

    #[test]
    fn service_resolution_by_request_type() {
        let mut registry = ServiceRegistry::new();
        registry.register::<EchoRequest, EchoResponse>(44).unwrap();
        let req = EchoRequest {
            text: "x".into(),
            numbers: vec![],
        };
        assert_eq!(registry.service_of(&req).unwrap(), 44);
        assert!(registry.service_of(&OtherRequest).is_err());
    }

    #[test]
    fn decode_unknown_service_fails() {
        let registry = ServiceRegistry::new();
        assert!(matches!(
            registry.decode_request(5, &[], Vec::new()),
            Err(GraphFlowError::UnknownService(5))
        ));
    }

    #[test]
    fn decoded_request_processes_like_original() {
        let mut registry = ServiceRegistry::new();
        registry.register::<EchoRequest, EchoResponse>(7).unwrap();
        let req = EchoRequest {
            text: "abc".into(),
            numbers: vec![1, 2],
        };
        let (data, tensors) = req.payload().unwrap();
        let decoded = registry.decode_request(7, &data, tensors).unwrap();
        let state = ServerState::new(0);
        let resp = decoded.process(&state).unwrap();
        let echo = resp.as_any().downcast_ref::<EchoResponse>().unwrap();
        assert_eq!(echo.text, "abc");
        assert_eq!(echo.numbers, vec![1, 2]);
    }
}
