//! IPC Courier - correlated request/reply messaging over named local channels.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ipc_courier::config::{ConfigLoader, EndpointConfig};
use ipc_courier::display;
use ipc_courier::endpoint::ChannelEndpoint;
use ipc_courier::transport::{MemoryHub, MemoryTransport};

#[derive(Parser)]
#[command(
    name = "ipc-courier",
    about = "Correlated request/reply messaging over named local channels",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to a config file; overrides the default search.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two in-process endpoints that exchange requests.
    Demo {
        /// Name of the responding endpoint.
        #[arg(long, default_value = "beta")]
        peer: String,
        /// Number of concurrent requests to send.
        #[arg(short = 'n', long, default_value_t = 3)]
        requests: usize,
        /// Content of each request.
        #[arg(short, long, default_value = "Hello")]
        message: String,
        /// Make the responder reject every request.
        #[arg(long)]
        reject: bool,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Option<EndpointConfig> {
    let loader = path.map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    match loader.load() {
        Ok(config) => Some(config),
        Err(e) => {
            display::print_error(&e.to_string());
            None
        }
    }
}

fn responder(
    config: EndpointConfig,
    transport: MemoryTransport,
    reject: bool,
) -> ChannelEndpoint<MemoryTransport> {
    let endpoint = ChannelEndpoint::new(config, transport);
    endpoint.on_start(display::print_started);
    endpoint.on_stop(display::print_stopped);
    endpoint.on_message(move |message| {
        display::print_inbound(message.id(), message.sent_by(), message.data());
        tokio::spawn(async move {
            let outcome = if reject {
                message.reply_with(json!({}), false).await
            } else {
                message.reply(json!({"response": "Hello world!"})).await
            };
            if let Err(e) = outcome {
                tracing::warn!(id = %message.id(), error = %e, "Failed to reply");
            }
        });
    });
    endpoint
}

async fn run_demo(
    config: EndpointConfig,
    peer: &str,
    requests: usize,
    content: &str,
    reject: bool,
) -> bool {
    let hub = MemoryHub::new();

    let server_config = EndpointConfig {
        name: peer.to_string(),
        id_prefix: None,
        ..config.clone()
    };
    let server = responder(server_config, hub.transport(), reject);
    if let Err(e) = server.start().await {
        display::print_failure(&e);
        return false;
    }

    let client = ChannelEndpoint::new(config, hub.transport());
    client.on_stop(display::print_stopped);
    client.on_peer(display::print_peer);

    let sends = (0..requests).map(|n| {
        let client = client.clone();
        let payload = json!({"content": content, "n": n});
        async move {
            display::print_request(client.name(), peer, &payload);
            client.send(peer, payload).await
        }
    });

    let mut ok = true;
    for outcome in join_all(sends).await {
        match outcome {
            Ok(reply) => display::print_reply(&reply),
            Err(e) => {
                ok = false;
                display::print_failure(&e);
            }
        }
    }

    client.destroy().await;
    server.destroy().await;
    ok
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let Some(config) = load_config(cli.config) else {
        return ExitCode::FAILURE;
    };

    match cli.command {
        Commands::Demo {
            peer,
            requests,
            message,
            reject,
        } => {
            tracing::info!(
                name = %config.name,
                peer = %peer,
                requests,
                reject,
                "Starting demo"
            );
            if run_demo(config, &peer, requests, &message, reject).await {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
