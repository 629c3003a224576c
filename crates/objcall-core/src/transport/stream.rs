//! Duplex peer over a byte stream.
//!
//! A [`StreamPeer`] owns two background tasks: a writer draining an
//! unbounded queue of frames, and a reader routing inbound frames. Calls
//! and notifications are handed to the [`InboundHandler`] on their own
//! tasks, so a slow method never blocks the connection. Acknowledgments go
//! to the [`PendingCalls`] table.

use super::frame::{read_frame, write_frame, Frame};
use super::{Ack, InboundHandler, Transport};
use crate::correlation::PendingCalls;
use crate::envelope::{CallEnvelope, CorrelationId, Reply, ResponseEnvelope};
use crate::{Result, RpcError};
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Writer queue that counts what it has accepted.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::UnboundedSender<Frame>,
    queued: Arc<AtomicU64>,
}

impl Outbound {
    fn push(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).map_err(|_| RpcError::ConnectionClosed)?;
        self.queued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct StreamPeer {
    outbound: Outbound,
    pending: Arc<PendingCalls>,
    closed_rx: watch::Receiver<bool>,
    written_rx: watch::Receiver<u64>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for StreamPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPeer")
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StreamPeer {
    /// Start a peer over `stream`, delivering inbound messages to `handler`.
    pub fn spawn<S>(stream: S, handler: Arc<dyn InboundHandler>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn_with(stream, move |_| handler)
    }

    /// Start a peer whose handler needs the peer itself, for example to
    /// call back into the remote while serving a request.
    pub fn spawn_with<S, F>(stream: S, make_handler: F) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: FnOnce(Arc<StreamPeer>) -> Arc<dyn InboundHandler>,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, outbound_rx) = mpsc::unbounded_channel();
        let outbound = Outbound {
            tx,
            queued: Arc::new(AtomicU64::new(0)),
        };
        let (closed_tx, closed_rx) = watch::channel(false);
        let (written_tx, written_rx) = watch::channel(0u64);
        let closed_tx = Arc::new(closed_tx);
        let pending = Arc::new(PendingCalls::new());

        let writer_task = tokio::spawn(Self::write_loop(
            writer,
            outbound_rx,
            written_tx,
            pending.clone(),
            closed_tx.clone(),
        ));

        // The reader starts once the handler exists; the handler may hold
        // its own reference to this peer.
        let (handler_tx, handler_rx) = tokio::sync::oneshot::channel::<Arc<dyn InboundHandler>>();
        let reader_task = tokio::spawn(Self::read_loop(
            reader,
            handler_rx,
            outbound.clone(),
            pending.clone(),
            closed_tx,
        ));

        let peer = Arc::new(Self {
            outbound,
            pending,
            closed_rx,
            written_rx,
            tasks: vec![writer_task, reader_task],
        });

        let handler = make_handler(peer.clone());
        if handler_tx.send(handler).is_err() {
            warn!("Stream reader exited before its handler was installed");
        }
        peer
    }

    async fn write_loop<W: AsyncWrite>(
        writer: W,
        mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
        written_tx: watch::Sender<u64>,
        pending: Arc<PendingCalls>,
        closed_tx: Arc<watch::Sender<bool>>,
    ) {
        tokio::pin!(writer);
        while let Some(frame) = outbound_rx.recv().await {
            let bytes = match serde_json::to_vec(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Dropping unserializable frame: {}", e);
                    written_tx.send_modify(|written| *written += 1);
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut writer, &bytes).await {
                debug!("Stream write failed: {}", e);
                break;
            }
            written_tx.send_modify(|written| *written += 1);
        }
        pending.close();
        let _ = closed_tx.send(true);
    }

    async fn read_loop<R: AsyncRead>(
        reader: R,
        handler_rx: tokio::sync::oneshot::Receiver<Arc<dyn InboundHandler>>,
        outbound: Outbound,
        pending: Arc<PendingCalls>,
        closed_tx: Arc<watch::Sender<bool>>,
    ) {
        tokio::pin!(reader);
        let Ok(handler) = handler_rx.await else {
            return;
        };

        loop {
            let bytes = match read_frame(&mut reader).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    debug!("Stream closed by peer");
                    break;
                }
                Err(e) => {
                    debug!("Stream read failed: {}", e);
                    break;
                }
            };

            let frame: Frame = match serde_json::from_slice(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Ignoring undecodable frame: {}", e);
                    continue;
                }
            };

            match frame {
                Frame::Emit { body } => {
                    let handler = handler.clone();
                    tokio::spawn(async move { handler.on_message(body, None).await });
                }
                Frame::Call { body } => {
                    let handler = handler.clone();
                    let replies = outbound.clone();
                    let ack = Ack::new(move |reply: Reply| match serde_json::to_value(&reply) {
                        Ok(body) => {
                            if replies.push(Frame::Reply { body }).is_err() {
                                debug!("Reply dropped: stream is closed");
                            }
                        }
                        Err(e) => warn!("Dropping unserializable reply: {}", e),
                    });
                    tokio::spawn(async move { handler.on_message(body, Some(ack)).await });
                }
                Frame::Reply { body } => match serde_json::from_value::<Reply>(body) {
                    Ok(reply) => {
                        for response in reply.into_responses() {
                            pending.complete(response);
                        }
                    }
                    Err(e) => warn!("Ignoring malformed reply: {}", e),
                },
            }
        }

        pending.close();
        let _ = closed_tx.send(true);
    }

    /// Resolves once either direction of the stream has shut down.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once every frame queued so far has been written, or the
    /// writer has stopped.
    pub async fn flush(&self) {
        let target = self.outbound.queued.load(Ordering::SeqCst);
        let mut rx = self.written_rx.clone();
        let _ = rx.wait_for(|written| *written >= target).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Number of call-mode requests still awaiting acknowledgment.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Stop both tasks and fail every pending call.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.pending.close();
    }
}

impl Drop for StreamPeer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for StreamPeer {
    fn next_id(&self) -> CorrelationId {
        self.pending.next_id()
    }

    fn send(&self, envelope: &CallEnvelope) -> Result<()> {
        let body = envelope.to_value()?;
        self.outbound.push(Frame::Emit { body })
    }

    fn send_and_await_ack(
        &self,
        envelope: CallEnvelope,
        deadline: Duration,
    ) -> BoxFuture<'static, Result<ResponseEnvelope>> {
        let Some(id) = envelope.id.clone() else {
            return futures::future::ready(Err(RpcError::InvalidRequest {
                message: "acknowledged send requires a correlation id".to_string(),
            }))
            .boxed();
        };

        let waiter = match self.pending.register(id, deadline) {
            Ok(waiter) => waiter,
            Err(e) => return futures::future::ready(Err(e)).boxed(),
        };

        let queued = envelope
            .to_value()
            .and_then(|body| self.outbound.push(Frame::Call { body }));
        if let Err(e) = queued {
            // Dropping the waiter removes its entry.
            return futures::future::ready(Err(e)).boxed();
        }

        waiter.wait().boxed()
    }
}
