//! TCP server serving the demo graph.

use crate::demo;
use objcall_core::transport::{TcpServer, TcpServerHandle};
use objcall_core::Dispatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Start serving the demo graph.
///
/// Returns the handle of the running server; its address carries the
/// actual port when `port` is 0.
pub async fn start_server(host: &str, port: u16) -> anyhow::Result<TcpServerHandle> {
    let dispatcher = Arc::new(Dispatcher::new(demo::graph(), demo::registry()));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let handle = TcpServer::start(dispatcher, addr).await?;

    info!("Serving demo graph on {}", handle.addr());
    Ok(handle)
}
