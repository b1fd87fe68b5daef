//! Server side of the transport: bind, gather client registrations, then
//! serve requests until every client has said goodbye.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use crate::conf::IpConfig;
use crate::err::{GraphFlowError, Result};
use crate::rpc::codec::{self, ErrorBody, Frame, RegisterAckBody};
use crate::rpc::{Request, Response, RpcMessage, ServerState, ServiceRegistry};

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Bind the listen address for `server_id`, block until exactly
/// `num_clients` clients have registered, then serve requests. Returns once
/// every client has sent a shutdown frame or dropped its connection.
pub async fn start_server(
    server_id: usize,
    ip_config: &IpConfig,
    num_servers: usize,
    num_clients: usize,
    state: ServerState,
    registry: Arc<ServiceRegistry>,
) -> Result<()> {
    if num_servers != ip_config.num_servers() {
        return Err(GraphFlowError::config(format!(
            "expected {} servers but ip config lists {}",
            num_servers,
            ip_config.num_servers()
        )));
    }
    if num_clients == 0 {
        return Err(GraphFlowError::config("server needs at least one client"));
    }

    let port = ip_config.listen_port(server_id)?;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| GraphFlowError::Connection(format!("bind 0.0.0.0:{}: {}", port, e)))?;
    info!(
        "server {} listening on port {}, waiting for {} client(s)",
        server_id, port, num_clients
    );

    // Registration phase: no requests are served until the full client
    // population has arrived.
    let mut conns: Vec<(i64, OwnedReadHalf, SharedWriter)> = Vec::with_capacity(num_clients);
    let mut next_client_id: i64 = 0;
    while conns.len() < num_clients {
        let (stream, peer) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("set_nodelay on {}: {}", peer, e);
        }
        let (mut rd, mut wr) = stream.into_split();
        match codec::read_frame(&mut rd).await {
            Ok(Frame::Register(body)) => {
                let client_id = if body.client_id < 0 {
                    let assigned = next_client_id;
                    next_client_id += 1;
                    assigned
                } else {
                    body.client_id
                };
                codec::write_frame(&mut wr, &Frame::RegisterAck(RegisterAckBody { client_id }))
                    .await?;
                debug!("server {}: client {} registered from {}", server_id, client_id, peer);
                conns.push((client_id, rd, Arc::new(Mutex::new(wr))));
            }
            Ok(other) => {
                warn!(
                    "server {}: {} spoke before registering ({:?} frame), dropping",
                    server_id, peer, frame_name(&other)
                );
            }
            Err(e) => {
                warn!("server {}: registration from {} failed: {}", server_id, peer, e);
            }
        }
    }
    info!("server {}: all {} client(s) registered, serving", server_id, num_clients);

    let state = Arc::new(state);
    let (done_tx, mut done_rx) = mpsc::channel::<i64>(num_clients);
    for (client_id, rd, wr) in conns {
        tokio::spawn(serve_connection(
            server_id as i64,
            client_id,
            rd,
            wr,
            state.clone(),
            registry.clone(),
            done_tx.clone(),
        ));
    }
    drop(done_tx);

    let mut remaining = num_clients;
    while remaining > 0 {
        match done_rx.recv().await {
            Some(client_id) => {
                debug!("server {}: client {} left", server_id, client_id);
                remaining -= 1;
            }
            None => break,
        }
    }
    info!("server {} shutting down", server_id);
    Ok(())
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Request(_) => "request",
        Frame::Response(_) => "response",
        Frame::Error(_) => "error",
        Frame::Register(_) => "register",
        Frame::RegisterAck(_) => "register-ack",
        Frame::Shutdown(_) => "shutdown",
    }
}

async fn serve_connection(
    server_id: i64,
    client_id: i64,
    mut rd: OwnedReadHalf,
    wr: SharedWriter,
    state: Arc<ServerState>,
    registry: Arc<ServiceRegistry>,
    done_tx: mpsc::Sender<i64>,
) {
    loop {
        match codec::read_frame(&mut rd).await {
            Ok(Frame::Request(msg)) => {
                let header = (msg.service_id, msg.msg_seq, msg.client_id);
                // Decode on the read path so a malformed body can fault the
                // connection; an unknown service is only a failed request.
                match registry.decode_request(msg.service_id, &msg.data, msg.tensors) {
                    Ok(request) => {
                        // Requests on one connection may process
                        // concurrently; the shared writer serializes their
                        // responses.
                        tokio::spawn(handle_request(
                            server_id,
                            header,
                            request,
                            wr.clone(),
                            state.clone(),
                        ));
                    }
                    Err(e @ GraphFlowError::UnknownService(_)) => {
                        send_error(server_id, header, &e, &wr).await;
                    }
                    Err(e) => {
                        // Registered service, undecodable body: the peer's
                        // registry disagrees with ours. Fatal for this
                        // connection.
                        error!(
                            "server {}: malformed request from client {}: {}",
                            server_id, client_id, e
                        );
                        send_error(server_id, header, &e, &wr).await;
                        break;
                    }
                }
            }
            Ok(Frame::Shutdown(_)) => {
                debug!("server {}: shutdown from client {}", server_id, client_id);
                break;
            }
            Ok(other) => {
                // A peer sending anything else no longer speaks the
                // protocol; the connection is faulted, not retried.
                error!(
                    "server {}: protocol violation from client {}: {:?} frame",
                    server_id,
                    client_id,
                    frame_name(&other)
                );
                break;
            }
            Err(GraphFlowError::ConnectionClosed(reason)) => {
                warn!(
                    "server {}: client {} disconnected without shutdown: {}",
                    server_id, client_id, reason
                );
                break;
            }
            Err(e) => {
                error!("server {}: read from client {} failed: {}", server_id, client_id, e);
                break;
            }
        }
    }
    let _ = done_tx.send(client_id).await;
}

async fn send_error(server_id: i64, header: (u32, u64, i64), cause: &GraphFlowError, wr: &SharedWriter) {
    let (service_id, msg_seq, client_id) = header;
    warn!(
        "server {}: request seq={} service={} from client {} failed: {}",
        server_id, msg_seq, service_id, client_id, cause
    );
    let frame = Frame::Error(ErrorBody {
        service_id,
        msg_seq,
        status: cause.status_code(),
        message: cause.to_string(),
    });
    let mut writer = wr.lock().await;
    if let Err(e) = codec::write_frame(&mut *writer, &frame).await {
        error!(
            "server {}: failed to report seq={} failure to client {}: {}",
            server_id, msg_seq, client_id, e
        );
    }
}

async fn handle_request(
    server_id: i64,
    header: (u32, u64, i64),
    request: Box<dyn Request>,
    wr: SharedWriter,
    state: Arc<ServerState>,
) {
    let (service_id, msg_seq, client_id) = header;

    // Process on the blocking pool: sampling and feature gathers are
    // CPU-bound and must not stall the socket tasks.
    let outcome = tokio::task::spawn_blocking(move || {
        request.process(&state).and_then(|response| response.payload())
    })
    .await
    .map_err(|e| GraphFlowError::internal(format!("request worker panicked: {}", e)))
    .and_then(|r| r);

    match outcome {
        Ok((data, tensors)) => {
            let frame = Frame::Response(RpcMessage {
                service_id,
                msg_seq,
                client_id,
                server_id,
                data,
                tensors,
            });
            let mut writer = wr.lock().await;
            if let Err(e) = codec::write_frame(&mut *writer, &frame).await {
                error!(
                    "server {}: failed to reply seq={} to client {}: {}",
                    server_id, msg_seq, client_id, e
                );
            }
        }
        // Processing failures travel back to the caller; dropping them
        // would leave the client blocked on a response forever.
        Err(e) => send_error(server_id, header, &e, &wr).await,
    }
}
