//! Inbound dispatch.
//!
//! The [`Dispatcher`] turns inbound envelopes into method invocations on the
//! exposed graph and produces response envelopes. Notifications never get a
//! response: shape errors, resolution failures and method errors on a
//! notification are logged and dropped.

use crate::batch::BatchExecutor;
use crate::config::{ResolverOptions, RpcConfig};
use crate::envelope::{parse_call, CallEnvelope, CorrelationId, Reply, ResponseEnvelope};
use crate::error::ErrorCode;
use crate::graph::{CallContext, ObjectNode, Params, ServerParams};
use crate::resolver::MethodResolver;
use crate::revival::RevivalRegistry;
use crate::transport::{Ack, InboundHandler};
use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct Dispatcher {
    root: Arc<ObjectNode>,
    resolver: MethodResolver,
    registry: Arc<RevivalRegistry>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("root", &self.root)
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(root: Arc<ObjectNode>, registry: Arc<RevivalRegistry>) -> Self {
        Self::with_options(root, registry, &ResolverOptions::default())
    }

    pub fn with_options(
        root: Arc<ObjectNode>,
        registry: Arc<RevivalRegistry>,
        options: &ResolverOptions,
    ) -> Self {
        Self {
            root,
            resolver: MethodResolver::new(options),
            registry,
        }
    }

    pub fn root(&self) -> &Arc<ObjectNode> {
        &self.root
    }

    pub fn registry(&self) -> &Arc<RevivalRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &MethodResolver {
        &self.resolver
    }

    /// Handle one inbound message: an envelope or a list of envelopes.
    ///
    /// A list is processed concurrently and answered with the responses of
    /// its requests, in order; notifications contribute nothing. Returns
    /// `None` when nothing needs answering.
    pub async fn receive(&self, message: Value, server: &ServerParams) -> Option<Reply> {
        match message {
            Value::Array(messages) => {
                let responses: Vec<ResponseEnvelope> =
                    join_all(messages.into_iter().map(|m| self.dispatch_one(m, server)))
                        .await
                        .into_iter()
                        .flatten()
                        .collect();
                if responses.is_empty() {
                    None
                } else {
                    Some(Reply::Many(responses))
                }
            }
            single => self.dispatch_one(single, server).await.map(Reply::Single),
        }
    }

    /// Handle a single envelope.
    pub fn dispatch_one<'a>(
        &'a self,
        message: Value,
        server: &'a ServerParams,
    ) -> BoxFuture<'a, Option<ResponseEnvelope>> {
        async move {
            let call = match parse_call(message) {
                Ok(call) => call,
                Err(malformed) => {
                    return match malformed.id {
                        Some(id) => Some(ResponseEnvelope::failure(
                            id,
                            ErrorCode::InvalidRequest,
                            malformed.reason,
                        )),
                        None => {
                            warn!("Dropping malformed notification: {}", malformed.reason);
                            None
                        }
                    };
                }
            };

            if call.method == RpcConfig::BATCH_METHOD_NAME {
                return self.dispatch_batch(call, server).await;
            }
            self.invoke(call, server).await
        }
        .boxed()
    }

    async fn dispatch_batch(&self, call: CallEnvelope, server: &ServerParams) -> Option<ResponseEnvelope> {
        let CallEnvelope { params, id, .. } = call;
        let executor = BatchExecutor::new(self);
        match BatchExecutor::parse(params) {
            Ok((mode, subcalls)) => {
                let responses = executor.execute(mode, subcalls, server).await;
                let id = id?;
                match serde_json::to_value(&responses) {
                    Ok(list) => Some(ResponseEnvelope::success(id, Some(self.registry.tag(list)))),
                    Err(e) => {
                        error!("Failed to encode batch responses: {}", e);
                        Some(ResponseEnvelope::failure(
                            id,
                            ErrorCode::InternalError,
                            ErrorCode::InternalError.default_message(),
                        ))
                    }
                }
            }
            Err(e) => match id {
                Some(id) => Some(ResponseEnvelope::failure(id, ErrorCode::InvalidRequest, e.to_string())),
                None => {
                    warn!("Dropping malformed batch notification: {}", e);
                    None
                }
            },
        }
    }

    async fn invoke(&self, call: CallEnvelope, server: &ServerParams) -> Option<ResponseEnvelope> {
        let CallEnvelope { method, params, id } = call;

        let Some(resolved) = self.resolver.resolve(&self.root, &method) else {
            match &id {
                Some(_) => debug!("Method not found: {}", method),
                None => debug!("Dropping notification for unknown method {}", method),
            }
            return id.map(|id| {
                ResponseEnvelope::failure(
                    id,
                    ErrorCode::MethodNotFound,
                    ErrorCode::MethodNotFound.default_message(),
                )
            });
        };

        let params = match self.registry.revive_all(params) {
            Ok(params) => params,
            Err(e) => {
                warn!("Rejecting params of {}: {}", method, e);
                return id.map(|id| ResponseEnvelope::failure(id, ErrorCode::InvalidRequest, e.to_string()));
            }
        };

        debug!("Dispatching {} ({} params)", method, params.len());
        let ctx = CallContext {
            method: method.clone(),
            owner: resolved.owner,
            server: server.clone(),
            registry: self.registry.clone(),
        };
        let outcome = AssertUnwindSafe(resolved.method.call(ctx, Params::new(params)))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => {
                let id = id?;
                Some(ResponseEnvelope::success(id, result.map(|v| self.registry.tag(v))))
            }
            Ok(Err(e)) => {
                warn!("Method {} failed: {}", method, e);
                id.map(|id| ResponseEnvelope::failure(id, ErrorCode::ServiceError, e.to_string()))
            }
            Err(_) => {
                error!("Method {} panicked", method);
                id.map(|id| {
                    ResponseEnvelope::failure(
                        id,
                        ErrorCode::InternalError,
                        ErrorCode::InternalError.default_message(),
                    )
                })
            }
        }
    }

    /// Inbound handler serving this dispatcher with fixed server params.
    pub fn bind(self: &Arc<Self>, server: ServerParams) -> Arc<dyn InboundHandler> {
        Arc::new(BoundDispatcher {
            dispatcher: self.clone(),
            server,
        })
    }
}

struct BoundDispatcher {
    dispatcher: Arc<Dispatcher>,
    server: ServerParams,
}

#[async_trait::async_trait]
impl InboundHandler for BoundDispatcher {
    async fn on_message(&self, message: Value, ack: Option<Ack>) {
        let reply = self.dispatcher.receive(message, &self.server).await;
        match (reply, ack) {
            (Some(reply), Some(ack)) => ack.send(reply),
            (Some(_), None) => debug!("Discarding reply to a message sent without acknowledgment"),
            (None, _) => {}
        }
    }
}

/// Id given to the subcall at `index` of a batch.
pub(crate) fn subcall_id(index: usize) -> CorrelationId {
    CorrelationId::Text(format!("{}{}", RpcConfig::BATCH_SUBCALL_ID_PREFIX, index + 1))
}
