//! objcall - bidirectional object-call RPC.
//!
//! Two peers connected by a duplex channel each expose an object graph of
//! methods and call into the other's graph by dotted path. On top of plain
//! calls the crate provides batching, per-call timeouts with default-result
//! fallback, and revivable values that keep their type across the wire.
//!
//! # Example
//!
//! ```rust,ignore
//! use objcall_core::{Dispatcher, ObjectNode, Remote, RevivalRegistry, StreamPeer};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let registry = Arc::new(RevivalRegistry::new());
//! let root = ObjectNode::builder()
//!     .object("math", ObjectNode::builder().func("add", |_, p| {
//!         Ok(p.arg::<i64>(0)? + p.arg::<i64>(1)?)
//!     }))
//!     .build();
//! let dispatcher = Arc::new(Dispatcher::new(root, registry.clone()));
//!
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let _server = StreamPeer::spawn(a, dispatcher.bind(Default::default()));
//! let client = StreamPeer::spawn(b, Arc::new(objcall_core::transport::NoopHandler));
//!
//! let remote = Remote::new(client, registry);
//! let sum = remote
//!     .call(Duration::from_secs(1))
//!     .at("math.add")
//!     .invoke(vec![2.into(), 3.into()])?
//!     .value()
//!     .await?;
//! assert_eq!(sum, 5);
//! ```

pub mod batch;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod graph;
pub mod interface;
pub mod remote;
pub mod resolver;
pub mod revival;
pub mod stub;
pub mod transport;

// Re-export commonly used types
pub use config::{ResolverOptions, RpcConfig, TransportConfig};
pub use dispatcher::Dispatcher;
pub use envelope::{
    CallEnvelope, CorrelationId, ErrorObject, ExecutionMode, Reply, ResponseEnvelope,
};
pub use error::{ErrorCode, Result, RpcError};
pub use graph::{CallContext, Method, Node, ObjectNode, Params, ServerParams};
pub use remote::{BatchBuilder, Remote};
pub use resolver::{MethodResolver, ResolvedMethod};
pub use revival::{Instance, Revivable, RevivalRegistry};
pub use stub::{CallOptions, Invocation, PendingCall, ReturnMode, Stub};
pub use transport::{InboundHandler, StreamPeer, Transport};

#[doc(hidden)]
pub use serde_json;
