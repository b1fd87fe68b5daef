use std::sync::Arc;

use fnv::FnvHashMap;
use log::debug;
use tokio::runtime::Runtime;

use graphflow_commons::conf::IpConfig;
use graphflow_commons::err::{GraphFlowError, Result};
use graphflow_commons::partbook::PartitionBook;
use graphflow_commons::rpc::client::RpcClient;
use graphflow_commons::rpc::{Request, Response, ServiceRegistry};
use graphflow_commons::service::{register_builtin_services, PullRequest, PullResponse, PushRequest};
use graphflow_commons::tensor::Tensor;
use graphflow_commons::NodeId;

/// Synchronous trainer-side endpoint. Owns a tokio runtime and a connected
/// [`RpcClient`]; training code calls into it without touching async.
pub struct ClientContext {
    runtime: Runtime,
    client: RpcClient,
}

impl ClientContext {
    /// Connect with the built-in services only.
    pub fn connect(ip_config: IpConfig, num_servers: usize) -> Result<Self> {
        let mut registry = ServiceRegistry::new();
        register_builtin_services(&mut registry)?;
        Self::connect_with_registry(ip_config, num_servers, registry)
    }

    /// Connect with a caller-assembled registry (built-ins plus any custom
    /// services, registered identically on the servers).
    pub fn connect_with_registry(
        ip_config: IpConfig,
        num_servers: usize,
        registry: ServiceRegistry,
    ) -> Result<Self> {
        let runtime = Runtime::new()?;
        let client = runtime.block_on(RpcClient::connect_to_server(
            ip_config,
            num_servers,
            Arc::new(registry),
        ))?;
        Ok(ClientContext { runtime, client })
    }

    pub fn client_id(&self) -> i64 {
        self.client.client_id()
    }

    pub fn num_servers(&self) -> usize {
        self.client.num_servers()
    }

    pub fn send_request(&self, server_id: usize, request: &dyn Request) -> Result<u64> {
        self.runtime.block_on(self.client.send_request(server_id, request))
    }

    pub fn send_request_to_machine(&self, machine_id: usize, request: &dyn Request) -> Result<u64> {
        self.runtime
            .block_on(self.client.send_request_to_machine(machine_id, request))
    }

    pub fn recv_response(&self) -> Result<Box<dyn Response>> {
        self.runtime.block_on(self.client.recv_response())
    }

    pub fn remote_call(&self, targets: &[(usize, &dyn Request)]) -> Result<Vec<Box<dyn Response>>> {
        self.runtime.block_on(self.client.remote_call(targets))
    }

    pub fn remote_call_to_machine(
        &self,
        targets: &[(usize, &dyn Request)],
    ) -> Result<Vec<Box<dyn Response>>> {
        self.runtime.block_on(self.client.remote_call_to_machine(targets))
    }

    /// Gather feature rows by global id across partitions: ids are grouped
    /// by owner, fetched machine-by-machine, and reassembled in input order.
    pub fn pull(
        &self,
        book: &Arc<dyn PartitionBook>,
        name: &str,
        ids: &[NodeId],
    ) -> Result<Tensor> {
        if ids.is_empty() {
            return Err(GraphFlowError::config("pull needs at least one row id"));
        }
        let owners = book.nid2partid(ids)?;
        let mut grouped: FnvHashMap<usize, (Vec<u64>, Vec<u64>)> = FnvHashMap::default();
        for (pos, (&id, &owner)) in ids.iter().zip(&owners).enumerate() {
            let slot = grouped.entry(owner).or_default();
            slot.0.push(id);
            slot.1.push(pos as u64);
        }

        let parts: Vec<usize> = grouped.keys().copied().collect();
        let requests: Vec<PullRequest> = parts
            .iter()
            .map(|p| PullRequest {
                name: name.to_string(),
                ids: grouped[p].0.clone(),
            })
            .collect();
        let targets: Vec<(usize, &dyn Request)> = parts
            .iter()
            .zip(&requests)
            .map(|(&p, r)| (p, r as &dyn Request))
            .collect();
        debug!("pull {:?}: {} row(s) across {} partition(s)", name, ids.len(), parts.len());
        let responses = self.remote_call_to_machine(&targets)?;

        // Reassemble rows into the caller's order.
        let mut merged: Option<Tensor> = None;
        for (part, response) in parts.iter().zip(responses) {
            let pulled = response
                .as_any()
                .downcast_ref::<PullResponse>()
                .ok_or_else(|| GraphFlowError::internal("pull returned a foreign response"))?;
            let rows = &grouped[part].1;
            let out = merged.get_or_insert_with(|| {
                let mut shape = pulled.tensor.shape().to_vec();
                if shape.is_empty() {
                    shape.push(0);
                }
                shape[0] = ids.len();
                Tensor::zeros(pulled.tensor.dtype(), &shape)
            });
            out.scatter_rows(rows, &pulled.tensor)?;
        }
        merged.ok_or_else(|| GraphFlowError::internal("pull gathered no responses"))
    }

    /// Scatter feature rows by global id to their owning partitions.
    pub fn push(
        &self,
        book: &Arc<dyn PartitionBook>,
        name: &str,
        ids: &[NodeId],
        values: &Tensor,
    ) -> Result<()> {
        if ids.len() != values.num_rows() {
            return Err(GraphFlowError::config(format!(
                "push of {} row id(s) with {} value row(s)",
                ids.len(),
                values.num_rows()
            )));
        }
        let owners = book.nid2partid(ids)?;
        let mut grouped: FnvHashMap<usize, (Vec<u64>, Vec<u64>)> = FnvHashMap::default();
        for (pos, (&id, &owner)) in ids.iter().zip(&owners).enumerate() {
            let slot = grouped.entry(owner).or_default();
            slot.0.push(id);
            slot.1.push(pos as u64);
        }
        let parts: Vec<usize> = grouped.keys().copied().collect();
        let mut requests = Vec::with_capacity(parts.len());
        for p in &parts {
            let (part_ids, rows) = &grouped[p];
            requests.push(PushRequest {
                name: name.to_string(),
                ids: part_ids.clone(),
                values: values.rows(rows)?,
            });
        }
        let targets: Vec<(usize, &dyn Request)> = parts
            .iter()
            .zip(&requests)
            .map(|(&p, r)| (p, r as &dyn Request))
            .collect();
        self.remote_call_to_machine(&targets)?;
        Ok(())
    }

    /// Graceful goodbye to every server.
    pub fn exit(&self) -> Result<()> {
        self.runtime.block_on(self.client.exit_client())
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        let _ = self.runtime.block_on(self.client.exit_client());
    }
}
