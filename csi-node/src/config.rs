//! Command line of the CSI node plugin.
//!
//! Every flag can also be set from the environment, which is how the
//! plugin's DaemonSet configures it.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use libcsi::NodeServiceConfig;

#[derive(Parser, Debug)]
#[command(name = "csi-node", version, about = "CSI node plugin for replicated block volumes")]
pub struct CliArgs {
    /// Unix socket the container orchestrator talks to.
    #[arg(long, env = "CSI_SOCKET", default_value = "/var/tmp/csi.sock")]
    pub csi_socket: PathBuf,

    /// Name of this node, reported as the CSI node id.
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Address this node is reachable at, advertised in the node topology.
    #[arg(long, env = "CSI_GRPC_ENDPOINT")]
    pub grpc_endpoint: Option<String>,

    /// I/O queues requested per NVMe-oF connection.
    #[arg(long, env = "NVME_NR_IO_QUEUES")]
    pub nvme_nr_io_queues: Option<u32>,

    /// Bound on each attach, detach, mount and unmount, e.g. `30s`.
    #[arg(long, env = "CSI_OP_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    pub op_timeout: Duration,

    /// Volumes this node accepts, 0 for no limit.
    #[arg(long, env = "CSI_MAX_VOLUMES", default_value_t = 0)]
    pub max_volumes: u64,

    /// Log as JSON lines.
    #[arg(long, env = "CSI_JSON_LOGS")]
    pub json_logs: bool,

    /// Raise the log level (-v debug, -vv trace).  `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl CliArgs {
    pub fn service_config(&self) -> NodeServiceConfig {
        NodeServiceConfig {
            node_name: self.node_name.clone(),
            endpoint: self.grpc_endpoint.clone(),
            max_volumes: self.max_volumes,
            op_timeout: self.op_timeout,
        }
    }

    pub fn default_log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
