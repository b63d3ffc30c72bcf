//! Accept loop — one task per connection.
//!
//! A slow or stalled client only ever holds its own task. The loop returns
//! when the shutdown channel fires; sessions already running are left to
//! finish on their own.

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::session::{Session, SessionContext};

pub async fn serve(
    listener: TcpListener,
    ctx: SessionContext,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "accepting connections");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("accept loop shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(peer = %peer, error = %e, "set_nodelay failed");
                }
                tracing::info!(peer = %peer, "connection accepted");

                let ctx = ctx.clone();
                tokio::spawn(async move {
                    match Session::new(stream, ctx, peer.to_string()).run().await {
                        Ok(requests) => {
                            tracing::info!(peer = %peer, requests, "connection closed");
                        }
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "connection terminated");
                        }
                    }
                });
            }
        }
    }
}
