//! TCP binding for [`StreamPeer`].
//!
//! [`TcpServer`] accepts connections and serves a [`Dispatcher`] on each of
//! them. Every connection is a full duplex peer: method bodies reach the
//! connected client through the [`Connection`] placed in their server
//! params.

use super::stream::StreamPeer;
use super::InboundHandler;
use crate::config::TransportConfig;
use crate::dispatcher::Dispatcher;
use crate::graph::ServerParams;
use crate::remote::Remote;
use crate::{Result, RpcError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Server params for methods served over TCP.
#[derive(Clone, Debug)]
pub struct Connection {
    pub peer_addr: SocketAddr,
    /// Stub factory over the same connection, for calling back the client.
    pub remote: Remote,
}

#[derive(Default)]
struct PeerTable {
    peers: HashMap<SocketAddr, Arc<StreamPeer>>,
    closed: bool,
}

/// Peers of the live connections of one server.
#[derive(Default)]
struct Connections {
    table: Mutex<PeerTable>,
}

impl Connections {
    fn lock(&self) -> std::sync::MutexGuard<'_, PeerTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn len(&self) -> usize {
        self.lock().peers.len()
    }

    /// Track `peer`; a server that already shut down closes it instead.
    fn track(&self, addr: SocketAddr, peer: Arc<StreamPeer>) -> bool {
        let mut table = self.lock();
        if table.closed {
            peer.shutdown();
            return false;
        }
        table.peers.insert(addr, peer);
        true
    }

    fn forget(&self, addr: &SocketAddr) {
        self.lock().peers.remove(addr);
    }

    fn close_all(&self) {
        let peers: Vec<_> = {
            let mut table = self.lock();
            table.closed = true;
            table.peers.drain().map(|(_, peer)| peer).collect()
        };
        for peer in peers {
            peer.shutdown();
        }
    }
}

/// Handle to a running server. Dropping shuts down the server.
pub struct TcpServerHandle {
    addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    connections: Arc<Connections>,
    accept_task: JoinHandle<()>,
}

impl TcpServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of clients currently connected.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting new connections and close the active ones.
    pub fn shutdown(&self) {
        if self.stop_tx.send_replace(true) {
            return;
        }
        info!("Object-call server on {} shutting down", self.addr);
        self.accept_task.abort();
        self.connections.close_all();
    }
}

impl Drop for TcpServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct TcpServer;

impl TcpServer {
    /// Bind `addr` and serve `dispatcher` on every accepted connection.
    pub async fn start(dispatcher: Arc<Dispatcher>, addr: SocketAddr) -> Result<TcpServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("Object-call server listening on {}", addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        let connections = Arc::new(Connections::default());
        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            dispatcher,
            stop_rx,
            connections.clone(),
        ));

        Ok(TcpServerHandle {
            addr,
            stop_tx,
            connections,
            accept_task,
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        dispatcher: Arc<Dispatcher>,
        mut stop_rx: watch::Receiver<bool>,
        connections: Arc<Connections>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = stop_rx.wait_for(|stopped| *stopped) => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };

            if connections.len() >= TransportConfig::MAX_CONNECTIONS {
                warn!(
                    "Rejecting connection from {}: at max capacity ({})",
                    peer_addr,
                    TransportConfig::MAX_CONNECTIONS
                );
                continue;
            }

            debug!("Connection from {}", peer_addr);
            let peer = Self::serve_connection(stream, peer_addr, dispatcher.clone());
            if !connections.track(peer_addr, peer.clone()) {
                break;
            }

            let connections = connections.clone();
            tokio::spawn(async move {
                peer.closed().await;
                peer.shutdown();
                connections.forget(&peer_addr);
                debug!("Connection {} ended", peer_addr);
            });
        }
    }

    /// Run `dispatcher` over `stream`, with a [`Connection`] back to the
    /// client in every call's server params.
    fn serve_connection(stream: TcpStream, peer_addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Arc<StreamPeer> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", peer_addr, e);
        }
        let registry = dispatcher.registry().clone();
        StreamPeer::spawn_with(stream, move |peer| {
            let remote = Remote::new(peer, registry);
            dispatcher.bind(ServerParams::new(Connection { peer_addr, remote }))
        })
    }
}

/// Connect to a server, serving `handler` for calls the server makes back.
pub async fn connect(addr: SocketAddr, handler: Arc<dyn InboundHandler>) -> Result<Arc<StreamPeer>> {
    let stream = tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| RpcError::transport(format!("connecting to {} timed out", addr)))?
        .map_err(|e| RpcError::transport(format!("failed to connect to {}: {}", addr, e)))?;
    stream.set_nodelay(true)?;

    debug!("Connected to {}", addr);
    Ok(StreamPeer::spawn(stream, handler))
}
