//! Partition server: loads one graph partition and serves sampling and
//! feature requests until every client has disconnected.
//!
//! Configuration comes from the environment:
//!   GRAPHFLOW_MANIFEST     path to the partition manifest (required)
//!   GRAPHFLOW_IP_CONFIG    path to the ip config file (required)
//!   GRAPHFLOW_SERVER_ID    this server's global id (default 0)
//!   GRAPHFLOW_NUM_CLIENTS  clients to wait for before serving (required)

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;

use graphflow_commons::conf::IpConfig;
use graphflow_commons::partition::load_partition;
use graphflow_commons::rpc::server::start_server;
use graphflow_commons::rpc::{ServerState, ServiceRegistry};
use graphflow_commons::service::register_builtin_services;

fn env_var(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{} is not set", name))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let manifest = PathBuf::from(env_var("GRAPHFLOW_MANIFEST")?);
    let ip_config_path = env_var("GRAPHFLOW_IP_CONFIG")?;
    let server_id: usize = env::var("GRAPHFLOW_SERVER_ID")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .context("GRAPHFLOW_SERVER_ID must be an integer")?;
    let num_clients: usize = env_var("GRAPHFLOW_NUM_CLIENTS")?
        .parse()
        .context("GRAPHFLOW_NUM_CLIENTS must be an integer")?;

    let ip_config = IpConfig::load(&ip_config_path)?;
    let num_servers = ip_config.num_servers();
    if server_id >= num_servers {
        bail!("server id {} out of range, ip config lists {} servers", server_id, num_servers);
    }

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    info!("starting graphflow server {} on {}", server_id, host);

    // One partition per machine; colocated logical servers share it.
    let part_id = ip_config.machine_of(server_id)?;
    let partition = load_partition(&manifest, part_id)?;
    let state = ServerState::from_partition(partition);

    let mut registry = ServiceRegistry::new();
    register_builtin_services(&mut registry)?;

    start_server(
        server_id,
        &ip_config,
        num_servers,
        num_clients,
        state,
        Arc::new(registry),
    )
    .await?;
    info!("server {} exited cleanly", server_id);
    Ok(())
}
