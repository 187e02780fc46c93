//! Haberdasher: a demo Twirp service.
//!
//! `MakeHat` returns one hat of the requested size; `MakeHats` streams
//! `quantity` of them.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use twirp::config::ServerConfig;
use twirp::hooks::logging;
use twirp::{Context, Error, MethodDescriptor, ResponseStream, Server, ServiceDescriptor, stream};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Config {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Route prefix; overrides TWIRP_PATH_PREFIX
    #[arg(long)]
    prefix: Option<String>,

    /// Delay between streamed hats, in milliseconds
    #[arg(long, env = "HAT_DELAY_MS", default_value = "0")]
    hat_delay_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Size {
    #[prost(int32, tag = "1")]
    pub inches: i32,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Hat {
    #[prost(int32, tag = "1")]
    pub inches: i32,
    #[prost(string, tag = "2")]
    pub color: String,
    #[prost(string, tag = "3")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct MakeHatsReq {
    #[prost(int32, tag = "1")]
    pub inches: i32,
    #[prost(int32, tag = "2")]
    pub quantity: i32,
}

const COLORS: [&str; 4] = ["white", "black", "brown", "red"];
const NAMES: [&str; 4] = ["bowler", "baseball cap", "top hat", "derby"];

fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("twirp.example.haberdasher", "Haberdasher")
        .method(MethodDescriptor::unary("MakeHat", "Size", "Hat"))
        .method(MethodDescriptor::server_streaming("MakeHats", "MakeHatsReq", "Hat"))
}

fn hat(inches: i32, n: usize) -> Hat {
    Hat {
        inches,
        color: COLORS[n % COLORS.len()].to_string(),
        name: NAMES[n % NAMES.len()].to_string(),
    }
}

async fn make_hat(_ctx: Context, size: Size) -> Result<Hat, Error> {
    if size.inches <= 0 {
        return Err(Error::invalid_argument("Inches", "I can't make a hat that small!"));
    }
    Ok(hat(size.inches, size.inches as usize))
}

async fn make_hats(
    ctx: Context,
    req: MakeHatsReq,
    capacity: usize,
    delay: Duration,
) -> Result<ResponseStream<Hat>, Error> {
    if req.inches <= 0 {
        return Err(Error::invalid_argument("Inches", "I can't make hats that small!"));
    }
    if req.quantity < 0 {
        return Err(Error::invalid_argument("Quantity", "I can't make a negative quantity of hats!"));
    }

    let (tx, hats) = stream::channel(capacity);
    tokio::spawn(async move {
        for n in 0..req.quantity as usize {
            if ctx.err().is_some() {
                return;
            }
            if tx.send(hat(req.inches, n)).await.is_err() {
                return;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        tx.finish();
    });
    Ok(hats)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Config::parse();
    let mut server_config = ServerConfig::from_env();
    if let Some(prefix) = &cli.prefix {
        server_config = server_config.with_path_prefix(prefix);
    }
    let delay = Duration::from_millis(cli.hat_delay_ms);
    let capacity = server_config.stream_channel_capacity;

    let server = Server::builder(descriptor())
        .config(server_config)
        .hooks(logging::server_hooks())
        .unary("MakeHat", make_hat)
        .server_streaming("MakeHats", move |ctx: Context, req: MakeHatsReq| {
            make_hats(ctx, req, capacity, delay)
        })
        .build()?;

    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = TcpListener::bind(&addr).await?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                signal_shutdown.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        let sigterm_shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    sigterm_shutdown.cancel();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    twirp::serve(listener, server, shutdown).await?;
    info!("Haberdasher stopped");
    Ok(())
}
