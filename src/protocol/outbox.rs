use tokio::sync::mpsc;

use crate::protocol::message::Message;
use crate::scheduler::job::JobSpecification;

#[derive(Debug)]
enum Outbound {
    Message(Message),
    Cancel(JobSpecification),
}

/// Sending half of a node connection's ordered outbound queue.
///
/// Scheduler components push here without awaiting; the session task drains
/// the queue in order onto the socket.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Receiving half, owned by the session task.
#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::UnboundedReceiver<Outbound>,
    held: Option<Message>,
}

impl Outbox {
    pub fn channel() -> (Outbox, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Outbox { tx }, OutboxReceiver { rx, held: None })
    }

    /// Queue a message. Returns false if the session has gone away.
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    /// Queue a cancellation. Adjacent cancellations leave as one Cancel message.
    pub fn cancel(&self, job: JobSpecification) -> bool {
        self.tx.send(Outbound::Cancel(job)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl OutboxReceiver {
    /// Wait for the next message to write. Returns `None` once every sender
    /// has been dropped and the queue is empty.
    pub async fn next(&mut self) -> Option<Message> {
        if let Some(message) = self.held.take() {
            return Some(message);
        }
        let first = self.rx.recv().await?;
        Some(self.coalesce(first))
    }

    /// Non-waiting variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Option<Message> {
        if let Some(message) = self.held.take() {
            return Some(message);
        }
        let first = self.rx.try_recv().ok()?;
        Some(self.coalesce(first))
    }

    fn coalesce(&mut self, first: Outbound) -> Message {
        let mut jobs = match first {
            Outbound::Message(message) => return message,
            Outbound::Cancel(job) => vec![job],
        };
        // Only cancels already queued are merged, and only up to the next
        // ordinary message, so per-connection order is preserved.
        while let Ok(next) = self.rx.try_recv() {
            match next {
                Outbound::Cancel(job) => {
                    if !jobs.contains(&job) {
                        jobs.push(job);
                    }
                }
                Outbound::Message(message) => {
                    self.held = Some(message);
                    break;
                }
            }
        }
        Message::Cancel { jobs }
    }
}
