//! Stub factory for one remote peer.

use crate::config::RpcConfig;
use crate::correlation::settle;
use crate::envelope::{CallEnvelope, ExecutionMode, ResponseEnvelope};
use crate::revival::{Instance, Revivable, RevivalRegistry};
use crate::stub::{CallOptions, Invocation, Stub, StubBackend};
use crate::transport::Transport;
use crate::{Result, RpcError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Entry point for calling into a remote graph.
///
/// Clones share the transport, the revival registry, and the id counter.
#[derive(Clone)]
pub struct Remote {
    backend: Arc<StubBackend>,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("delimiter", &self.backend.delimiter)
            .finish_non_exhaustive()
    }
}

impl Remote {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<RevivalRegistry>) -> Self {
        Self::with_delimiter(transport, registry, RpcConfig::DEFAULT_DELIMITER)
    }

    pub fn with_delimiter(
        transport: Arc<dyn Transport>,
        registry: Arc<RevivalRegistry>,
        delimiter: char,
    ) -> Self {
        Self {
            backend: Arc::new(StubBackend::new(transport, registry, delimiter)),
        }
    }

    /// Root stub (empty path) under `options`.
    pub fn stub(&self, options: CallOptions) -> Stub {
        Stub::new(self.backend.clone(), options)
    }

    pub fn emit(&self) -> Stub {
        self.stub(CallOptions::emit())
    }

    pub fn reserve(&self) -> Stub {
        self.stub(CallOptions::reserve())
    }

    pub fn call(&self, timeout: Duration) -> Stub {
        self.stub(CallOptions::call(timeout))
    }

    /// Call-mode stub that falls back to `default` on any failure.
    pub fn call_or(&self, timeout: Duration, default: impl Into<Value>) -> Stub {
        self.stub(CallOptions::call(timeout).with_default(default))
    }

    pub fn batch(&self, mode: ExecutionMode) -> BatchBuilder {
        BatchBuilder {
            remote: self.clone(),
            mode,
            subcalls: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<RevivalRegistry> {
        &self.backend.registry
    }

    pub fn instance<T: Revivable>(&self, value: T) -> Instance<T> {
        self.backend.registry.instance(value)
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Value> {
        self.backend.registry.encode(value)
    }
}

/// Collects reserved subcalls into one batch request.
///
/// `push` returns each subcall's index, which marks it for
/// [`BatchBuilder::call_one`].
#[derive(Debug)]
pub struct BatchBuilder {
    remote: Remote,
    mode: ExecutionMode,
    subcalls: Vec<CallEnvelope>,
}

impl BatchBuilder {
    /// Reserve-mode stub for building subcalls.
    pub fn stub(&self) -> Stub {
        self.remote.reserve()
    }

    pub fn push(&mut self, subcall: CallEnvelope) -> usize {
        self.subcalls.push(subcall);
        self.subcalls.len() - 1
    }

    /// Add the envelope of any invocation; only reserved ones are expected.
    pub fn add(&mut self, invocation: Invocation) -> usize {
        self.push(invocation.into_envelope())
    }

    /// Reserve `path(params)` and add it.
    pub fn add_call(&mut self, path: &str, params: Vec<Value>) -> Result<usize> {
        let invocation = self.stub().at(path).invoke(params)?;
        Ok(self.add(invocation))
    }

    pub fn len(&self) -> usize {
        self.subcalls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subcalls.is_empty()
    }

    pub fn subcalls(&self) -> &[CallEnvelope] {
        &self.subcalls
    }

    /// The batch as a notification envelope.
    pub fn envelope(&self) -> CallEnvelope {
        CallEnvelope::batch(self.mode, &self.subcalls, None)
    }

    /// Send the batch without waiting for results.
    pub fn emit(self) -> Result<CallEnvelope> {
        let envelope = self.envelope();
        if self.subcalls.is_empty() {
            debug!("Skipping empty batch");
            return Ok(envelope);
        }
        if let Err(e) = self.remote.backend.transport.send(&envelope) {
            warn!("Failed to emit batch: {}", e);
        }
        Ok(envelope)
    }

    async fn responses(self, timeout: Duration) -> Result<Vec<ResponseEnvelope>> {
        let expected = self.subcalls.len();
        let result = self
            .remote
            .backend
            .call(self.envelope(), timeout, None)
            .await?
            .unwrap_or(Value::Null);
        let responses: Vec<ResponseEnvelope> =
            serde_json::from_value(result).map_err(|e| RpcError::InvalidResponse {
                message: format!("batch result is not a response list: {}", e),
            })?;
        if responses.len() != expected {
            return Err(RpcError::InvalidResponse {
                message: format!("batch returned {} responses for {} subcalls", responses.len(), expected),
            });
        }
        Ok(responses)
    }

    /// Run the batch and return every subcall's outcome, in request order.
    ///
    /// An absent result reads as `null`. An empty batch is not sent.
    pub async fn call_all(self, timeout: Duration) -> Result<Vec<Result<Value>>> {
        if self.subcalls.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .responses(timeout)
            .await?
            .into_iter()
            .map(|response| response.into_outcome().map(|v| v.unwrap_or(Value::Null)))
            .collect())
    }

    /// Run the batch and return only the subcall at `index`.
    ///
    /// `default` applies to that subcall the same way it applies to a single
    /// call, and also covers failure of the batch as a whole.
    pub async fn call_one(self, index: usize, timeout: Duration, default: Option<Value>) -> Result<Value> {
        if index >= self.subcalls.len() {
            return Err(RpcError::InvalidRequest {
                message: format!("batch has no subcall {}", index),
            });
        }
        let method = self.subcalls[index].method.clone();
        let selected = self.responses(timeout).await.map(|mut responses| responses.swap_remove(index));
        let value = settle(selected, default.as_ref(), &method)?;
        Ok(value.unwrap_or(Value::Null))
    }
}
