use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::{GridError, Result};
use crate::protocol::{Frame, GridCodec, Message, Outbox, OutboxReceiver};
use crate::scheduler::GridScheduler;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionSettings {
    pub handshake_timeout: Duration,
    pub max_frame_length: usize,
}

type NodeFramed = Framed<TcpStream, GridCodec>;

/// Serve one node connection from Hello until it closes.
///
/// Reads and writes are multiplexed on this single task, so messages to the
/// node leave in exactly the order the scheduler queued them.
pub(crate) async fn serve_node(
    stream: TcpStream,
    peer: SocketAddr,
    scheduler: GridScheduler,
    settings: SessionSettings,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, GridCodec::new(settings.max_frame_length));

    let (node_id, slots) = match handshake(&mut framed, settings.handshake_timeout).await {
        Ok(hello) => hello,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Node handshake failed");
            return;
        }
    };

    let (outbox, outbox_rx) = Outbox::channel();
    if let Err(e) = scheduler.register_node(&node_id, outbox) {
        tracing::warn!(peer = %peer, node_id = %node_id, error = %e, "Rejecting node connection");
        return;
    }
    tracing::info!(peer = %peer, node_id = %node_id, slots, "Node connected");

    if let Err(e) = run_session(&mut framed, outbox_rx, &node_id, &scheduler, &shutdown).await {
        tracing::warn!(node_id = %node_id, error = %e, "Dropping node connection");
    }

    scheduler.on_node_disconnected(&node_id);
}

async fn handshake(framed: &mut NodeFramed, timeout: Duration) -> Result<(String, u32)> {
    let first = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| GridError::HandshakeFailed("timed out waiting for Hello".to_string()))?;
    match first {
        Some(Ok(Frame::Message(Message::Hello { node_id, slots }))) => Ok((node_id, slots)),
        Some(Ok(Frame::Message(other))) => Err(GridError::HandshakeFailed(format!(
            "expected Hello, got {:?}",
            other.kind()
        ))),
        Some(Ok(Frame::Unknown { kind, .. })) => Err(GridError::HandshakeFailed(format!(
            "expected Hello, got unknown kind {}",
            kind
        ))),
        Some(Err(e)) => Err(e),
        None => Err(GridError::HandshakeFailed(
            "connection closed before Hello".to_string(),
        )),
    }
}

async fn run_session(
    framed: &mut NodeFramed,
    mut outbox_rx: OutboxReceiver,
    node_id: &str,
    scheduler: &GridScheduler,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(node_id, "Closing node connection for shutdown");
                return Ok(());
            }
            outbound = outbox_rx.next() => {
                let Some(message) = outbound else {
                    return Ok(());
                };
                tracing::trace!(node_id, kind = ?message.kind(), "Sending to node");
                framed.send(message).await?;
            }
            inbound = framed.next() => {
                match inbound {
                    None => {
                        tracing::debug!(node_id, "Node closed connection");
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e),
                    Some(Ok(Frame::Unknown { kind, schema_version })) => {
                        tracing::warn!(node_id, kind, schema_version, "Skipping unknown message from node");
                    }
                    Some(Ok(Frame::Message(message))) => {
                        handle_inbound(scheduler, node_id, message)?;
                    }
                }
            }
        }
    }
}

fn handle_inbound(scheduler: &GridScheduler, node_id: &str, message: Message) -> Result<()> {
    match message {
        Message::Ready { capacity } => scheduler.on_ready(node_id, i64::from(capacity)),
        Message::Scaling {
            invocation_cost_scale,
        } => scheduler.on_scaling(node_id, invocation_cost_scale),
        Message::DependentValueRequest {
            correlation_id,
            job,
        } => scheduler
            .on_dependent_value_request(node_id, correlation_id, job)
            .map(|_| ()),
        Message::JobAccepted { job } => {
            scheduler.on_job_accepted(node_id, &job);
            Ok(())
        }
        Message::JobResult { job, outcome } => {
            scheduler.on_job_result(node_id, &job, outcome);
            Ok(())
        }
        Message::Hello { .. } => Err(GridError::Protocol("repeated Hello".to_string())),
        other => Err(GridError::Protocol(format!(
            "{:?} is not sent by nodes",
            other.kind()
        ))),
    }
}
