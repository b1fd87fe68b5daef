//! Client side of the transport: one connection per server, a shared
//! response lane, and scatter/gather calls that restore caller order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::conf::IpConfig;
use crate::err::{GraphFlowError, Result};
use crate::rpc::codec::{self, Frame, RegisterBody, ShutdownBody};
use crate::rpc::{Request, Response, RpcMessage, ServiceRegistry};

const MAX_CONNECT_ATTEMPTS: usize = 60;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// A completed response (or transport fault) delivered off a reader task.
/// `msg_seq` is `None` for faults that cannot be correlated to a request.
struct Envelope {
    msg_seq: Option<u64>,
    result: Result<Box<dyn Response>>,
}

/// Trainer-side RPC endpoint. One TCP connection per server; all sending
/// threads share the per-connection write lock, and completed responses
/// from every server land in one receive lane.
pub struct RpcClient {
    client_id: i64,
    ip_config: IpConfig,
    registry: Arc<ServiceRegistry>,
    seq: AtomicU64,
    writers: Vec<Arc<Mutex<OwnedWriteHalf>>>,
    resp_rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    backlog: Mutex<VecDeque<Envelope>>,
    closed: AtomicBool,
}

impl RpcClient {
    /// Establish one connection per server listed in the ip config. Servers
    /// that have not bound yet are retried with backoff; a server that never
    /// appears within the bounded retries is a `ConnectionError`.
    pub async fn connect_to_server(
        ip_config: IpConfig,
        num_servers: usize,
        registry: Arc<ServiceRegistry>,
    ) -> Result<RpcClient> {
        if num_servers != ip_config.num_servers() {
            return Err(GraphFlowError::config(format!(
                "expected {} servers but ip config lists {}",
                num_servers,
                ip_config.num_servers()
            )));
        }

        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let mut writers = Vec::with_capacity(num_servers);
        let mut client_id: i64 = -1;

        // Server 0 assigns our id; the rest just learn it.
        for server_id in 0..num_servers {
            let addr = ip_config.server_addr(server_id)?;
            let stream = Self::dial_with_retry(&addr).await?;
            let (mut rd, mut wr) = stream.into_split();
            codec::write_frame(&mut wr, &Frame::Register(RegisterBody { client_id })).await?;
            match codec::read_frame(&mut rd).await? {
                Frame::RegisterAck(ack) => {
                    if client_id < 0 {
                        client_id = ack.client_id;
                    }
                }
                other => {
                    return Err(GraphFlowError::Connection(format!(
                        "server {} replied to registration with a {:?} frame",
                        server_id, other
                    )));
                }
            }
            tokio::spawn(read_loop(server_id, rd, registry.clone(), resp_tx.clone()));
            writers.push(Arc::new(Mutex::new(wr)));
            debug!("connected to server {} at {}", server_id, addr);
        }
        info!("client {} connected to {} server(s)", client_id, num_servers);

        Ok(RpcClient {
            client_id,
            ip_config,
            registry,
            seq: AtomicU64::new(0),
            writers,
            resp_rx: Mutex::new(resp_rx),
            backlog: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        })
    }

    async fn dial_with_retry(addr: &str) -> Result<TcpStream> {
        let mut last_err = None;
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Err(e) => {
                    if attempt % 10 == 0 {
                        warn!("still waiting for {} after {} attempts: {}", addr, attempt, e);
                    }
                    last_err = Some(e);
                    sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
        Err(GraphFlowError::Connection(format!(
            "{} unreachable after {} attempts: {}",
            addr,
            MAX_CONNECT_ATTEMPTS,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn num_servers(&self) -> usize {
        self.writers.len()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphFlowError::ConnectionClosed("client has exited".into()));
        }
        Ok(())
    }

    /// Fire-and-forget: enqueue a request to one server and return its
    /// sequence number without waiting for the response.
    pub async fn send_request(&self, server_id: usize, request: &dyn Request) -> Result<u64> {
        self.check_open()?;
        let writer = self.writers.get(server_id).ok_or_else(|| {
            GraphFlowError::config(format!(
                "server id {} out of range, client knows {} servers",
                server_id,
                self.writers.len()
            ))
        })?;
        let service_id = self.registry.service_of(request)?;
        let (data, tensors) = request.payload()?;
        let msg = RpcMessage {
            service_id,
            msg_seq: self.seq.fetch_add(1, Ordering::Relaxed),
            client_id: self.client_id,
            server_id: server_id as i64,
            data,
            tensors,
        };
        let seq = msg.msg_seq;
        let mut wr = writer.lock().await;
        codec::write_frame(&mut *wr, &Frame::Request(msg)).await?;
        Ok(seq)
    }

    /// Route by machine instead of logical server id.
    pub async fn send_request_to_machine(
        &self,
        machine_id: usize,
        request: &dyn Request,
    ) -> Result<u64> {
        let server_id = self.ip_config.first_server_of(machine_id)?;
        self.send_request(server_id, request).await
    }

    async fn next_envelope(&self) -> Result<Envelope> {
        if let Some(env) = self.backlog.lock().await.pop_front() {
            return Ok(env);
        }
        let mut rx = self.resp_rx.lock().await;
        rx.recv().await.ok_or_else(|| {
            GraphFlowError::ConnectionClosed("all server connections are gone".into())
        })
    }

    /// Block until the next completed response for this client arrives.
    /// With several requests in flight, arrival order is not send order;
    /// callers correlate by response content.
    pub async fn recv_response(&self) -> Result<Box<dyn Response>> {
        self.check_open()?;
        self.next_envelope().await?.result
    }

    /// Scatter requests to their target servers and gather all responses,
    /// restoring the input order regardless of wire arrival order.
    pub async fn remote_call(
        &self,
        targets: &[(usize, &dyn Request)],
    ) -> Result<Vec<Box<dyn Response>>> {
        self.check_open()?;
        // Scatter concurrently; per-connection write locks serialize the
        // actual frames.
        let sends = join_all(
            targets
                .iter()
                .map(|(server_id, request)| self.send_request(*server_id, *request)),
        )
        .await;
        let mut pending: FnvHashMap<u64, usize> = FnvHashMap::default();
        for (slot, seq) in sends.into_iter().enumerate() {
            pending.insert(seq?, slot);
        }

        let mut gathered: Vec<Option<Box<dyn Response>>> =
            (0..targets.len()).map(|_| None).collect();
        while !pending.is_empty() {
            let env = self.next_envelope().await?;
            match env.msg_seq.and_then(|seq| pending.remove(&seq)) {
                Some(slot) => gathered[slot] = Some(env.result?),
                None => {
                    if env.msg_seq.is_none() {
                        // Uncorrelated transport fault: nothing later will
                        // complete our pending slots.
                        return Err(env.result.err().unwrap_or_else(|| {
                            GraphFlowError::ConnectionClosed("connection lost".into())
                        }));
                    }
                    // A response for an older bare send; keep it for the
                    // next recv_response call.
                    self.backlog.lock().await.push_back(env);
                }
            }
        }
        gathered
            .into_iter()
            .map(|r| r.ok_or_else(|| GraphFlowError::internal("missing gathered response")))
            .collect()
    }

    /// `remote_call` with machine-level targets.
    pub async fn remote_call_to_machine(
        &self,
        targets: &[(usize, &dyn Request)],
    ) -> Result<Vec<Box<dyn Response>>> {
        let mut by_server = Vec::with_capacity(targets.len());
        for (machine_id, request) in targets {
            by_server.push((self.ip_config.first_server_of(*machine_id)?, *request));
        }
        self.remote_call(&by_server).await
    }

    /// Graceful goodbye: tells every server this client is done. Requests
    /// still in flight may complete with `ConnectionClosedError` afterwards.
    pub async fn exit_client(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for writer in &self.writers {
            let mut wr = writer.lock().await;
            if let Err(e) = codec::write_frame(
                &mut *wr,
                &Frame::Shutdown(ShutdownBody {
                    client_id: self.client_id,
                }),
            )
            .await
            {
                warn!("client {}: shutdown frame failed: {}", self.client_id, e);
            }
        }
        info!("client {} exited", self.client_id);
        Ok(())
    }
}

async fn read_loop(
    server_id: usize,
    mut rd: OwnedReadHalf,
    registry: Arc<ServiceRegistry>,
    tx: mpsc::UnboundedSender<Envelope>,
) {
    loop {
        match codec::read_frame(&mut rd).await {
            Ok(Frame::Response(msg)) => {
                let env = Envelope {
                    msg_seq: Some(msg.msg_seq),
                    result: registry.decode_response(msg.service_id, &msg.data, msg.tensors),
                };
                if tx.send(env).is_err() {
                    break;
                }
            }
            Ok(Frame::Error(body)) => {
                let env = Envelope {
                    msg_seq: Some(body.msg_seq),
                    result: Err(GraphFlowError::RemoteProcessing {
                        service_id: body.service_id,
                        status: body.status,
                        message: body.message,
                    }),
                };
                if tx.send(env).is_err() {
                    break;
                }
            }
            Ok(other) => {
                warn!("server {} sent unexpected {:?} frame, ignoring", server_id, other);
            }
            Err(GraphFlowError::ConnectionClosed(reason)) => {
                debug!("server {} connection closed: {}", server_id, reason);
                let _ = tx.send(Envelope {
                    msg_seq: None,
                    result: Err(GraphFlowError::ConnectionClosed(reason)),
                });
                break;
            }
            Err(e) => {
                let _ = tx.send(Envelope {
                    msg_seq: None,
                    result: Err(e),
                });
                break;
            }
        }
    }
}
