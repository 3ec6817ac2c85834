use std::path::PathBuf;
use std::sync::Arc;

use bulb_chat::{Client, ClientConfig, Console, LogErrors, ProtocolVersion, UserInfo};
use clap::Parser;
use log::error;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "bulb-client", about = "Chat client")]
struct Args {
    /// Name to join with
    #[arg(short, long)]
    name: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match args.config.as_deref().map(ClientConfig::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let client = match Client::connect(&config, Arc::new(Console), Arc::new(LogErrors)).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to connect to {}:{}: {e}", config.host, config.port);
            std::process::exit(1);
        }
    };
    if let Err(e) = client.authenticate(UserInfo::new(&args.name, ProtocolVersion::CURRENT)).await {
        error!("{e}");
        std::process::exit(1);
    }
    if client.wait_ready().await.is_err() {
        std::process::exit(1);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            () = client.closed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = client.send_message(&line).await {
                        error!("{e}");
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    client.disconnect().await;
                    break;
                }
            },
        }
    }
}
