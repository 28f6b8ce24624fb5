//! voxlink-relay: development signaling relay for voice channels.
//!
//! Authenticates clients by hello token, forwards offers, answers and ICE
//! candidates to their target user, and broadcasts join/leave/state updates
//! to everyone else. Media never passes through the relay.

mod auth;
mod connection;
mod roster;

use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;

use crate::auth::TokenMap;
use crate::connection::handle_connection;
use crate::roster::Hub;

#[derive(Parser)]
#[command(name = "voxlink-relay", about = "WebSocket signaling relay for voxlink voice channels")]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Accepted token as TOKEN=USER. Repeatable. Without any, the token is
    /// taken as the user id.
    #[arg(long = "token", value_name = "TOKEN=USER")]
    tokens: Vec<String>,

    /// Seconds a new client has to send its hello.
    #[arg(long, default_value_t = 10)]
    hello_timeout: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxlink_relay=info".into()),
        )
        .init();

    let args = Args::parse();
    let tokens = match TokenMap::from_args(&args.tokens) {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::error!(error = %e, "Invalid --token");
            std::process::exit(2);
        }
    };
    if tokens.is_dev_mode() {
        tracing::warn!("No tokens configured, accepting any token as its user id");
    }

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind TCP listener");
            std::process::exit(1);
        }
    };
    tracing::info!("voxlink-relay listening on {}", addr);

    let hub = Hub::new();
    let hello_timeout = Duration::from_secs(args.hello_timeout);

    // Accept loop.
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let hub = hub.clone();
                let tokens = tokens.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws) => handle_connection(ws, addr, hub, tokens, hello_timeout).await,
                        Err(e) => {
                            tracing::warn!(peer = %addr, error = %e, "WS handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
            }
        }
    }
}
