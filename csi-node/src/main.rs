use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use libcsi::backend::linux::LinuxBackend;
use libcsi::transport::CsiServer;
use libcsi::CsiNodeService;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;

use config::CliArgs;

fn init_logging(args: &CliArgs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.default_log_level()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(&args);

    let backend = Arc::new(LinuxBackend::new(args.nvme_nr_io_queues));
    let service = Arc::new(CsiNodeService::new(args.service_config(), backend.clone()));
    let server = CsiServer::bind(&args.csi_socket, service)
        .with_context(|| format!("binding {}", args.csi_socket.display()))?;

    // Probe stays false until the initiator subsystem is set up.
    tokio::spawn(async move { backend.init().await });

    info!(node = %args.node_name, socket = %args.csi_socket.display(), "CSI node plugin started");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    server.serve_until(shutdown).await?;
    Ok(())
}
