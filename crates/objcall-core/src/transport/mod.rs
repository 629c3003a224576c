//! Transport contracts and adapters.
//!
//! The core consumes three primitives from a duplex channel:
//!
//! - [`Transport::send`]: fire-and-forget delivery.
//! - [`Transport::send_and_await_ack`]: delivery with one correlated
//!   acknowledgment, raced against a deadline.
//! - [`InboundHandler::on_message`]: inbound delivery, optionally carrying an
//!   [`Ack`] to answer the sender.
//!
//! [`StreamPeer`] implements all three over any byte stream using
//! length-prefixed JSON frames; [`tcp`] binds it to TCP sockets.

pub mod frame;
pub mod stream;
pub mod tcp;

pub use frame::{read_frame, write_frame, Frame};
pub use stream::StreamPeer;
pub use tcp::{connect, Connection, TcpServer, TcpServerHandle};

use crate::envelope::{CallEnvelope, CorrelationId, Reply, ResponseEnvelope};
use crate::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Outbound half of a duplex channel.
pub trait Transport: Send + Sync + 'static {
    /// A correlation id distinct from every other id this channel has
    /// handed out.
    ///
    /// The default draws from one process-wide counter.
    fn next_id(&self) -> CorrelationId {
        static LAST_ID: AtomicU64 = AtomicU64::new(0);
        CorrelationId::Number(LAST_ID.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Hand `envelope` to the channel without waiting for anything.
    fn send(&self, envelope: &CallEnvelope) -> Result<()>;

    /// Hand `envelope` to the channel and wait up to `deadline` for its
    /// acknowledgment.
    ///
    /// The envelope must be on its way before this returns; the returned
    /// future only waits. Calls issued in order therefore reach the channel
    /// in order even if their futures are polled out of order.
    fn send_and_await_ack(
        &self,
        envelope: CallEnvelope,
        deadline: Duration,
    ) -> BoxFuture<'static, Result<ResponseEnvelope>>;
}

/// One-shot reply path for an inbound message.
pub struct Ack(Box<dyn FnOnce(Reply) + Send>);

impl Ack {
    pub fn new(reply: impl FnOnce(Reply) + Send + 'static) -> Self {
        Self(Box::new(reply))
    }

    pub fn send(self, reply: Reply) {
        (self.0)(reply)
    }
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Ack")
    }
}

/// Inbound half of a duplex channel.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn on_message(&self, message: Value, ack: Option<Ack>);
}

/// Handler for a peer that exposes nothing; inbound messages are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

#[async_trait::async_trait]
impl InboundHandler for NoopHandler {
    async fn on_message(&self, message: Value, _ack: Option<Ack>) {
        tracing::debug!("Ignoring inbound message on a call-only peer: {}", message);
    }
}
