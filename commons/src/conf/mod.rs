use std::env;
use std::fs;
use std::path::Path;

use log::debug;

use crate::err::{GraphFlowError, Result};

/// Base listen port. The server with global id `i` listens on
/// `base_port + i`, which keeps colocated test setups collision-free.
pub const DEFAULT_BASE_PORT: u16 = 30050;

const BASE_PORT_ENV: &str = "GRAPHFLOW_BASE_PORT";
const DIST_MODE_ENV: &str = "GRAPHFLOW_DIST_MODE";

/// One line of the ip config file: `"<ip> <num_servers_on_that_machine>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    pub ip: String,
    pub num_servers: usize,
}

/// Parsed ip config. Global server ids are assigned machine by machine in
/// file order, so machine 0 owns ids `[0, n0)`, machine 1 owns `[n0, n0+n1)`
/// and so on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpConfig {
    machines: Vec<MachineConfig>,
    base_port: u16,
}

impl IpConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let conf = Self::parse(&text)?;
        debug!(
            "loaded ip config from {}: {} machine(s), {} server(s)",
            path.as_ref().display(),
            conf.num_machines(),
            conf.num_servers()
        );
        Ok(conf)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut machines = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let ip = fields
                .next()
                .ok_or_else(|| GraphFlowError::config(format!("ip config line {}: empty", lineno + 1)))?;
            let num_servers = fields
                .next()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| {
                    GraphFlowError::config(format!(
                        "ip config line {}: expected \"<ip> <num_servers>\", got {:?}",
                        lineno + 1,
                        line
                    ))
                })?;
            if fields.next().is_some() {
                return Err(GraphFlowError::config(format!(
                    "ip config line {}: trailing fields in {:?}",
                    lineno + 1,
                    line
                )));
            }
            if num_servers == 0 {
                return Err(GraphFlowError::config(format!(
                    "ip config line {}: machine must host at least one server",
                    lineno + 1
                )));
            }
            machines.push(MachineConfig {
                ip: ip.to_string(),
                num_servers,
            });
        }
        if machines.is_empty() {
            return Err(GraphFlowError::config("ip config has no machines"));
        }
        let base_port = env::var(BASE_PORT_ENV)
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_BASE_PORT);
        Ok(IpConfig {
            machines,
            base_port,
        })
    }

    /// Override the base listen port, mainly for colocated test setups.
    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn num_machines(&self) -> usize {
        self.machines.len()
    }

    pub fn num_servers(&self) -> usize {
        self.machines.iter().map(|m| m.num_servers).sum()
    }

    pub fn machines(&self) -> &[MachineConfig] {
        &self.machines
    }

    /// Machine hosting a global server id.
    pub fn machine_of(&self, server_id: usize) -> Result<usize> {
        let mut offset = 0;
        for (machine_id, machine) in self.machines.iter().enumerate() {
            if server_id < offset + machine.num_servers {
                return Ok(machine_id);
            }
            offset += machine.num_servers;
        }
        Err(GraphFlowError::config(format!(
            "server id {} out of range, ip config has {} servers",
            server_id,
            self.num_servers()
        )))
    }

    /// First global server id hosted by a machine. Machine-level routing
    /// sends to this server when several logical servers colocate.
    pub fn first_server_of(&self, machine_id: usize) -> Result<usize> {
        if machine_id >= self.machines.len() {
            return Err(GraphFlowError::config(format!(
                "machine id {} out of range, ip config has {} machines",
                machine_id,
                self.machines.len()
            )));
        }
        Ok(self.machines[..machine_id].iter().map(|m| m.num_servers).sum())
    }

    /// `"<ip>:<port>"` a client should dial for a global server id.
    pub fn server_addr(&self, server_id: usize) -> Result<String> {
        let machine_id = self.machine_of(server_id)?;
        Ok(format!(
            "{}:{}",
            self.machines[machine_id].ip,
            self.base_port + server_id as u16
        ))
    }

    /// Port a server should bind locally for its global id.
    pub fn listen_port(&self, server_id: usize) -> Result<u16> {
        self.machine_of(server_id)?;
        Ok(self.base_port + server_id as u16)
    }
}

/// Process mode for the RPC runtime. `Distributed` opens sockets;
/// `Standalone` keeps everything in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistMode {
    Distributed,
    Standalone,
}

impl DistMode {
    pub fn from_env() -> Self {
        match env::var(DIST_MODE_ENV) {
            Ok(v) if v.eq_ignore_ascii_case("distributed") => DistMode::Distributed,
            _ => DistMode::Standalone,
        }
    }

    pub fn is_distributed(self) -> bool {
        matches!(self, DistMode::Distributed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_machines_and_assigns_server_ids() {
        let conf = IpConfig::parse("10.0.0.1 2\n10.0.0.2 1\n")
            .unwrap()
            .with_base_port(40000);
        assert_eq!(conf.num_machines(), 2);
        assert_eq!(conf.num_servers(), 3);
        assert_eq!(conf.machine_of(0).unwrap(), 0);
        assert_eq!(conf.machine_of(1).unwrap(), 0);
        assert_eq!(conf.machine_of(2).unwrap(), 1);
        assert_eq!(conf.first_server_of(1).unwrap(), 2);
        assert_eq!(conf.server_addr(1).unwrap(), "10.0.0.1:40001");
        assert_eq!(conf.server_addr(2).unwrap(), "10.0.0.2:40002");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            IpConfig::parse("10.0.0.1\n"),
            Err(GraphFlowError::Config(_))
        ));
        assert!(matches!(
            IpConfig::parse("10.0.0.1 zero\n"),
            Err(GraphFlowError::Config(_))
        ));
        assert!(matches!(
            IpConfig::parse(""),
            Err(GraphFlowError::Config(_))
        ));
    }

    #[test]
    fn out_of_range_server_id_is_config_error() {
        let conf = IpConfig::parse("127.0.0.1 1\n").unwrap();
        assert!(conf.server_addr(3).is_err());
    }
}
