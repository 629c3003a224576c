//! Path-accumulating stubs over a remote object graph.
//!
//! A [`Stub`] is a list of path segments plus the options that govern what
//! invoking it does. Extending a stub never touches the network; only
//! [`Stub::invoke`] does, and only in emit or call mode.
//!
//! ```rust,ignore
//! let add = remote.call(Duration::from_secs(1)).get("math").get("add");
//! let five = add.invoke(vec![json!(2), json!(3)])?.value().await?;
//! ```

use crate::config::TransportConfig;
use crate::correlation::settle;
use crate::envelope::CallEnvelope;
use crate::revival::RevivalRegistry;
use crate::transport::Transport;
use crate::{Result, RpcError};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, warn};

/// What invoking a stub does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnMode {
    /// Send without an id and return the envelope.
    Emit,
    /// Send with an id and wait for the response.
    Call,
    /// Build the envelope without sending it.
    Reserve,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallOptions {
    pub return_mode: ReturnMode,
    /// Required in call mode.
    pub timeout: Option<Duration>,
    /// Substituted for failures and absent results in call mode.
    pub default_result: Option<Value>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::call(TransportConfig::DEFAULT_CALL_TIMEOUT)
    }
}

impl CallOptions {
    pub fn emit() -> Self {
        Self {
            return_mode: ReturnMode::Emit,
            timeout: None,
            default_result: None,
        }
    }

    pub fn reserve() -> Self {
        Self {
            return_mode: ReturnMode::Reserve,
            timeout: None,
            default_result: None,
        }
    }

    pub fn call(timeout: Duration) -> Self {
        Self {
            return_mode: ReturnMode::Call,
            timeout: Some(timeout),
            default_result: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_result = Some(value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.return_mode == ReturnMode::Call && self.timeout.is_none() {
            return Err(RpcError::MissingTimeout);
        }
        Ok(())
    }
}

/// State shared by every stub built from one [`crate::Remote`].
pub(crate) struct StubBackend {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: Arc<RevivalRegistry>,
    pub(crate) delimiter: char,
}

impl StubBackend {
    pub(crate) fn new(transport: Arc<dyn Transport>, registry: Arc<RevivalRegistry>, delimiter: char) -> Self {
        Self {
            transport,
            registry,
            delimiter,
        }
    }

    /// Send `envelope` with an id from the transport and settle the outcome
    /// for the caller.
    pub(crate) fn call(
        &self,
        envelope: CallEnvelope,
        timeout: Duration,
        default: Option<Value>,
    ) -> PendingCall {
        let envelope = envelope.with_id(self.transport.next_id());
        debug!("Calling {} as {:?}", envelope.method, envelope.id);
        let ack = self.transport.send_and_await_ack(envelope.clone(), timeout);
        let registry = self.registry.clone();
        let method = envelope.method.clone();
        let response = async move {
            let settled = settle(ack.await, default.as_ref(), &method)?;
            settled.map(|value| registry.revive(value)).transpose()
        }
        .boxed();
        PendingCall { envelope, response }
    }
}

/// A call-mode invocation waiting for its response.
pub struct PendingCall {
    envelope: CallEnvelope,
    response: BoxFuture<'static, Result<Option<Value>>>,
}

impl PendingCall {
    pub fn envelope(&self) -> &CallEnvelope {
        &self.envelope
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

impl Future for PendingCall {
    type Output = Result<Option<Value>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.response.as_mut().poll(cx)
    }
}

/// Outcome of invoking a stub.
#[derive(Debug)]
pub enum Invocation {
    Emitted(CallEnvelope),
    Reserved(CallEnvelope),
    Pending(PendingCall),
}

impl Invocation {
    pub fn mode(&self) -> ReturnMode {
        match self {
            Invocation::Emitted(_) => ReturnMode::Emit,
            Invocation::Reserved(_) => ReturnMode::Reserve,
            Invocation::Pending(_) => ReturnMode::Call,
        }
    }

    pub fn envelope(&self) -> &CallEnvelope {
        match self {
            Invocation::Emitted(envelope) | Invocation::Reserved(envelope) => envelope,
            Invocation::Pending(pending) => pending.envelope(),
        }
    }

    pub fn into_envelope(self) -> CallEnvelope {
        match self {
            Invocation::Emitted(envelope) | Invocation::Reserved(envelope) => envelope,
            Invocation::Pending(pending) => pending.envelope,
        }
    }

    /// Await the response; `None` means the method returned nothing.
    pub async fn outcome(self) -> Result<Option<Value>> {
        match self {
            Invocation::Pending(pending) => pending.await,
            other => Err(RpcError::NotAwaitable(other.mode())),
        }
    }

    /// Await the response, reading an absent result as `null`.
    pub async fn value(self) -> Result<Value> {
        Ok(self.outcome().await?.unwrap_or(Value::Null))
    }

    pub async fn value_as<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.value().await?;
        serde_json::from_value(value).map_err(|e| RpcError::InvalidResponse {
            message: e.to_string(),
        })
    }
}

/// Callable facade over a remote method path.
#[derive(Clone)]
pub struct Stub {
    backend: Arc<StubBackend>,
    path: Vec<String>,
    options: CallOptions,
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish()
    }
}

impl Stub {
    pub(crate) fn new(backend: Arc<StubBackend>, options: CallOptions) -> Self {
        Self {
            backend,
            path: Vec::new(),
            options,
        }
    }

    /// Extend the path by one property name.
    pub fn get(&self, segment: impl AsRef<str>) -> Stub {
        let mut next = self.clone();
        let segment = segment.as_ref().trim();
        if !segment.is_empty() {
            next.path.push(segment.to_string());
        }
        next
    }

    /// Extend the path by a delimited path such as `"math.add"`.
    pub fn at(&self, path: &str) -> Stub {
        path.split(self.backend.delimiter)
            .fold(self.clone(), |stub, segment| stub.get(segment))
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<RevivalRegistry> {
        &self.backend.registry
    }

    /// Wire method name, e.g. `".math.add"`. `None` for an empty path.
    pub fn method_name(&self) -> Option<String> {
        if self.path.is_empty() {
            return None;
        }
        let d = self.backend.delimiter;
        Some(self.path.iter().fold(String::new(), |mut name, segment| {
            name.push(d);
            name.push_str(segment);
            name
        }))
    }

    /// Serialize an argument, keeping revival tags of registered types.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Value> {
        self.backend.registry.encode(value)
    }

    /// Invoke the method at this path with `params`.
    pub fn invoke(&self, params: Vec<Value>) -> Result<Invocation> {
        let method = self.method_name().ok_or(RpcError::EmptyPath)?;
        self.options.validate()?;
        let envelope = CallEnvelope::notification(method, self.backend.registry.tag_all(params));

        match self.options.return_mode {
            ReturnMode::Reserve => Ok(Invocation::Reserved(envelope)),
            ReturnMode::Emit => {
                if let Err(e) = self.backend.transport.send(&envelope) {
                    warn!("Failed to emit {}: {}", envelope.method, e);
                }
                Ok(Invocation::Emitted(envelope))
            }
            ReturnMode::Call => {
                let timeout = self.options.timeout.ok_or(RpcError::MissingTimeout)?;
                let pending =
                    self.backend
                        .call(envelope, timeout, self.options.default_result.clone());
                Ok(Invocation::Pending(pending))
            }
        }
    }
}
