//! Coordinator/node wire protocol.
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             Message (sum type)           │  message
//! ├─────────────────────────────────────────┤
//! │        Envelope { kind, body: oneof }    │  wire (protobuf)
//! ├─────────────────────────────────────────┤
//! │               Framing                    │  codec (length-prefixed)
//! ├─────────────────────────────────────────┤
//! │            TCP Transport                 │  one connection per node
//! └─────────────────────────────────────────┘
//! ```
//!
//! Messages to a single node are delivered in send order; nothing is
//! promised across nodes. [`Outbox`] is the ordered, non-blocking queue
//! every scheduler component uses to talk to a node.

pub mod codec;
pub mod message;
pub mod outbox;
pub mod wire;

pub use codec::{GridCodec, DEFAULT_MAX_FRAME_LENGTH};
pub use message::{Frame, Message, SCHEMA_VERSION};
pub use outbox::{Outbox, OutboxReceiver};
pub use wire::MessageKind;
