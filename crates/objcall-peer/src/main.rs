//! objcall peer - serve a demo object graph over TCP or call into one.
//!
//! `serve` prints `RPC_PORT=<port>` on stdout once listening, so a parent
//! process can discover an auto-assigned port.

mod client;
mod demo;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "objcall-peer")]
#[command(about = "Bidirectional object-call RPC peer")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo object graph
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Invoke one method on a running peer
    Call {
        /// Address of the peer
        #[arg(long)]
        addr: SocketAddr,

        /// Dotted method path, e.g. math.add
        #[arg(short, long)]
        method: String,

        /// JSON array of positional params, or a single JSON value
        #[arg(long)]
        params: Option<String>,

        /// Call timeout in milliseconds
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,

        /// JSON value returned instead of any failure
        #[arg(long)]
        default: Option<String>,

        /// Send as a notification and do not wait
        #[arg(long)]
        emit: bool,
    },
}

fn init_logging(debug: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact();

    // RUST_LOG wins over --debug when set
    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).init(),
        Err(_) => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    match args.command {
        Command::Serve { port, host } => {
            info!("Starting objcall peer");
            let handle = server::start_server(&host, port).await?;

            // Print port for the parent process to read (intentional stdout)
            println!("RPC_PORT={}", handle.port());

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
            handle.shutdown();
        }
        Command::Call {
            addr,
            method,
            params,
            timeout_ms,
            default,
            emit,
        } => {
            let default_result = default
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()?;
            let request = client::CallRequest {
                addr,
                method,
                params: client::parse_params(params.as_deref())?,
                timeout: Duration::from_millis(timeout_ms),
                default_result,
                emit,
            };
            if let Some(result) = client::run(request).await? {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        }
    }

    Ok(())
}
