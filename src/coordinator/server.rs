use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::coordinator::session::{serve_node, SessionSettings};
use crate::error::Result;
use crate::scheduler::GridScheduler;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts node connections and hands each one to its own session task.
pub struct NodeListener {
    listener: TcpListener,
}

impl NodeListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub(crate) async fn run(
        self,
        scheduler: GridScheduler,
        settings: SessionSettings,
        shutdown: CancellationToken,
    ) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Accepting node connections");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Node listener stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        tokio::spawn(serve_node(
                            stream,
                            peer,
                            scheduler.clone(),
                            settings,
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept node connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }
}
