//! One-shot caller used by `objcall-peer call`.

use crate::demo;
use objcall_core::transport::{connect, NoopHandler};
use objcall_core::{CallOptions, Remote};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What to invoke and how.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub addr: SocketAddr,
    pub method: String,
    pub params: Vec<Value>,
    pub timeout: Duration,
    pub default_result: Option<Value>,
    pub emit: bool,
}

/// Parse `--params`: a JSON array is the positional list, anything else is
/// the single argument.
pub fn parse_params(raw: Option<&str>) -> anyhow::Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<Value>(raw)? {
        Value::Array(items) => Ok(items),
        single => Ok(vec![single]),
    }
}

/// Connect, invoke once, and return the result.
///
/// Emit mode returns `None` after the notification has been written.
pub async fn run(request: CallRequest) -> anyhow::Result<Option<Value>> {
    let peer = connect(request.addr, Arc::new(NoopHandler)).await?;
    let remote = Remote::new(peer.clone(), demo::registry());

    let options = if request.emit {
        CallOptions::emit()
    } else {
        let options = CallOptions::call(request.timeout);
        match request.default_result {
            Some(default) => options.with_default(default),
            None => options,
        }
    };

    let invocation = remote
        .stub(options)
        .at(&request.method)
        .invoke(request.params)?;
    debug!("Sent {}", serde_json::to_string(invocation.envelope())?);

    let result = if request.emit {
        peer.flush().await;
        None
    } else {
        Some(invocation.value().await?)
    };

    peer.shutdown();
    Ok(result)
}
