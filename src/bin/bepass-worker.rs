//! bepass worker binary
//!
//! Usage: bepass-worker [LISTEN_ADDR]
//!
//! Accepts WebSocket tunnels from bepass gateways and relays their
//! sub-streams to the real destinations. Defaults to 0.0.0.0:8080; put a TLS
//! terminating proxy in front of it for wss://.

use std::env;

use bepass::tunnel::connector::WsStream;
use bepass::tunnel::worker;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let addr = match env::args().nth(1) {
        Some(arg) if arg == "-h" || arg == "--help" => {
            println!("Usage: bepass-worker [LISTEN_ADDR]   (default 0.0.0.0:8080)");
            return Ok(());
        }
        Some(arg) => arg,
        None => "0.0.0.0:8080".to_string(),
    };

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("bepass worker listening on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(async move {
                        let _ = stream.set_nodelay(true);
                        let ws = match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => ws,
                            Err(e) => {
                                tracing::debug!("WebSocket handshake from {} failed: {}", peer_addr, e);
                                return;
                            }
                        };
                        tracing::debug!("Tunnel from {}", peer_addr);
                        if let Err(e) = worker::serve(WsStream::new(ws)).await {
                            tracing::debug!("Tunnel from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Accept error: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
