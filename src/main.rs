use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bulb_chat::{Console, LogErrors, Server, ServerConfig};
use clap::Parser;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(name = "bulb-server", about = "Chat server")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match args.config.as_deref().map(ServerConfig::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let server = Server::new(config, Arc::new(Console), Arc::new(LogErrors));
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {e}", server.config().addr());
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    server.disconnect_all().await;
}
