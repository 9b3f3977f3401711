//! Ping over an upgraded connection
//!
//! Starts an upgrade server on a loopback port, dials it, and exchanges a
//! ping/pong on a stream the server opens.
//! Run with: RUST_LOG=debug cargo run --example ping

use std::net::SocketAddr;
use std::time::Duration;

use http::HeaderMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use yamux_upgrade::{Config, Dialer, Result, Session, UpgradeServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr: SocketAddr = listener.local_addr()?;

    tokio::spawn(async move {
        let server = UpgradeServer::default();
        if let Err(e) = server.serve(listener, handle_session).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    let dialer = Dialer::new(
        Config::builder()
            .handshake_timeout(Duration::from_secs(5))
            .build(),
    );
    let (mut session, response) = dialer
        .dial(&format!("yamux://{addr}/ping"), &HeaderMap::new())
        .await?;
    tracing::info!(status = %response.status(), "upgraded");

    let mut stream = session.accept().await?;
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    tracing::info!(message = %String::from_utf8_lossy(&buf), "received");

    stream.write_all(b"pong").await?;
    stream.flush().await?;

    // Close drains the reply before sending GoAway.
    session.close().await;
    Ok(())
}

async fn handle_session(mut session: Session, request: http::Request<()>) {
    tracing::info!(uri = %request.uri(), "session opened");

    let result = async {
        let mut stream = session.open().await?;
        stream.write_all(b"ping").await?;
        stream.flush().await?;

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await?;
        tracing::info!(message = %String::from_utf8_lossy(&buf), "server received");
        Ok::<_, yamux_upgrade::Error>(())
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(error = %e, "session ended");
    }
    session.close().await;
}
