//! The object graph a peer exposes to its remote.
//!
//! A graph is a tree of [`ObjectNode`]s whose properties are nested objects,
//! callable [`Method`]s, or plain JSON values. Each node may share a
//! `prototype` node: its properties are reachable from method bodies through
//! [`ObjectNode::lookup`], but the resolver only ever follows own properties.

use crate::error::RpcError;
use crate::revival::{Instance, Revivable, RevivalRegistry};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Opaque per-connection context handed to every method body.
#[derive(Clone, Default)]
pub struct ServerParams(Option<Arc<dyn Any + Send + Sync>>);

impl ServerParams {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|v| v.downcast_ref::<T>())
    }
}

impl fmt::Debug for ServerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServerParams")
            .field(&self.0.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Normalized positional parameters of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Deserialize the argument at `index`.
    ///
    /// A missing argument deserializes from `null`, so `Option<T>` reads as
    /// `None` and required types fail with `InvalidParams`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> crate::Result<T> {
        let value = self.0.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| RpcError::InvalidParams {
            message: format!("argument {}: {}", index, e),
        })
    }

    /// Like [`Params::arg`], but a missing or `null` argument is `None`.
    pub fn opt_arg<T: DeserializeOwned>(&self, index: usize) -> crate::Result<Option<T>> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.arg(index).map(Some),
        }
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Everything a method body knows about the call it serves.
#[derive(Clone)]
pub struct CallContext {
    /// The dotted path the caller used.
    pub method: String,
    /// The object the method was found on.
    pub owner: Arc<ObjectNode>,
    pub server: ServerParams,
    pub registry: Arc<RevivalRegistry>,
}

impl CallContext {
    pub fn server<T: Any>(&self) -> Option<&T> {
        self.server.get::<T>()
    }

    /// Wrap a return value so it is revived on the caller's side.
    pub fn instance<T: Revivable>(&self, value: T) -> Instance<T> {
        self.registry.instance(value)
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("method", &self.method)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

/// A callable graph member.
///
/// `Ok(None)` means the method produced no value; the caller receives the
/// absence-of-value response.
#[async_trait]
pub trait Method: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext, params: Params) -> anyhow::Result<Option<Value>>;
}

struct SyncFn<F>(F);

#[async_trait]
impl<F, R> Method for SyncFn<F>
where
    F: Fn(&CallContext, Params) -> anyhow::Result<R> + Send + Sync + 'static,
    R: Serialize + Send + 'static,
{
    async fn call(&self, ctx: CallContext, params: Params) -> anyhow::Result<Option<Value>> {
        let out = (self.0)(&ctx, params)?;
        Ok(Some(serde_json::to_value(out)?))
    }
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut, R> Method for AsyncFn<F>
where
    F: Fn(CallContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn call(&self, ctx: CallContext, params: Params) -> anyhow::Result<Option<Value>> {
        let out = (self.0)(ctx, params).await?;
        Ok(Some(serde_json::to_value(out)?))
    }
}

struct Procedure<F>(F);

#[async_trait]
impl<F, Fut> Method for Procedure<F>
where
    F: Fn(CallContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, params: Params) -> anyhow::Result<Option<Value>> {
        (self.0)(ctx, params).await?;
        Ok(None)
    }
}

/// A property value in the graph.
#[derive(Clone)]
pub enum Node {
    Object(Arc<ObjectNode>),
    Method(Arc<dyn Method>),
    Value(Value),
}

impl Node {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Node::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Object(object) => object.fmt(f),
            Node::Method(_) => f.write_str("<method>"),
            Node::Value(value) => write!(f, "{}", value),
        }
    }
}

/// An object in the exposed graph.
#[derive(Default)]
pub struct ObjectNode {
    props: BTreeMap<String, Node>,
    prototype: Option<Arc<ObjectNode>>,
}

impl fmt::Debug for ObjectNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.props.iter()).finish()
    }
}

impl ObjectNode {
    pub fn builder() -> ObjectBuilder {
        ObjectBuilder::default()
    }

    /// An own property; prototype properties are not consulted.
    pub fn own(&self, name: &str) -> Option<&Node> {
        self.props.get(name)
    }

    /// A property found on this object or along its prototype chain.
    pub fn lookup(&self, name: &str) -> Option<&Node> {
        let mut cursor = Some(self);
        while let Some(object) = cursor {
            if let Some(node) = object.props.get(name) {
                return Some(node);
            }
            cursor = object.prototype.as_deref();
        }
        None
    }

    pub fn prototype(&self) -> Option<&Arc<ObjectNode>> {
        self.prototype.as_ref()
    }
}

/// Builder for [`ObjectNode`].
#[derive(Default)]
pub struct ObjectBuilder {
    node: ObjectNode,
}

impl ObjectBuilder {
    fn insert(mut self, name: impl Into<String>, node: Node) -> Self {
        self.node.props.insert(name.into(), node);
        self
    }

    pub fn object(self, name: impl Into<String>, object: impl Into<Arc<ObjectNode>>) -> Self {
        self.insert(name, Node::Object(object.into()))
    }

    pub fn value(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, Node::Value(value.into()))
    }

    pub fn method(self, name: impl Into<String>, method: Arc<dyn Method>) -> Self {
        self.insert(name, Node::Method(method))
    }

    /// A synchronous method.
    pub fn func<F, R>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallContext, Params) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize + Send + 'static,
    {
        self.method(name, Arc::new(SyncFn(f)))
    }

    /// An asynchronous method returning a value.
    pub fn handler<F, Fut, R>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.method(name, Arc::new(AsyncFn(f)))
    }

    /// An asynchronous method that returns nothing.
    pub fn procedure<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.method(name, Arc::new(Procedure(f)))
    }

    pub fn prototype(mut self, prototype: Arc<ObjectNode>) -> Self {
        self.node.prototype = Some(prototype);
        self
    }

    pub fn build(self) -> Arc<ObjectNode> {
        Arc::new(self.node)
    }
}

impl From<ObjectBuilder> for Arc<ObjectNode> {
    fn from(builder: ObjectBuilder) -> Self {
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(owner: Arc<ObjectNode>) -> CallContext {
        CallContext {
            method: ".test".to_string(),
            owner,
            server: ServerParams::none(),
            registry: Arc::new(RevivalRegistry::new()),
        }
    }

    #[test]
    fn test_own_ignores_prototype() {
        let proto = ObjectNode::builder().value("shared", 1).build();
        let object = ObjectNode::builder().value("mine", 2).prototype(proto).build();

        assert!(object.own("mine").is_some());
        assert!(object.own("shared").is_none());
        assert_eq!(object.lookup("shared").and_then(Node::as_value), Some(&json!(1)));
    }

    #[test]
    fn test_params_arg_extraction() {
        let params = Params::new(vec![json!(2), json!("x")]);
        assert_eq!(params.arg::<i64>(0).unwrap(), 2);
        assert_eq!(params.arg::<String>(1).unwrap(), "x");
        assert_eq!(params.arg::<Option<i64>>(5).unwrap(), None);
        assert!(matches!(params.arg::<i64>(1), Err(RpcError::InvalidParams { .. })));
        assert_eq!(params.opt_arg::<i64>(0).unwrap(), Some(2));
        assert_eq!(params.opt_arg::<i64>(9).unwrap(), None);
        assert!(params.opt_arg::<i64>(1).is_err());
    }

    #[test]
    fn test_server_params_downcast() {
        let params = ServerParams::new(42u32);
        assert_eq!(params.get::<u32>(), Some(&42));
        assert_eq!(params.get::<String>(), None);
        assert_eq!(ServerParams::none().get::<u32>(), None);
    }

    #[tokio::test]
    async fn test_method_kinds() {
        let root = ObjectNode::builder()
            .func("sync", |_, p| Ok(p.arg::<i64>(0)? * 2))
            .handler("async", |_, p| async move { Ok(p.len()) })
            .procedure("nothing", |_, _| async { Ok(()) })
            .build();

        let call = |name: &str| match root.own(name) {
            Some(Node::Method(m)) => m.clone(),
            _ => panic!("{name} is not a method"),
        };

        let out = call("sync").call(context(root.clone()), vec![json!(4)].into()).await.unwrap();
        assert_eq!(out, Some(json!(8)));

        let out = call("async").call(context(root.clone()), vec![json!(1), json!(2)].into()).await.unwrap();
        assert_eq!(out, Some(json!(2)));

        let out = call("nothing").call(context(root.clone()), Params::default()).await.unwrap();
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn test_method_sees_owner_prototype() {
        let proto = ObjectNode::builder().value("greeting", "hello").build();
        let owner = ObjectNode::builder()
            .func("greet", |ctx, _| {
                let greeting = ctx.owner.lookup("greeting").and_then(Node::as_value).cloned();
                Ok(greeting.unwrap_or(Value::Null))
            })
            .prototype(proto)
            .build();

        let Some(Node::Method(greet)) = owner.own("greet") else {
            panic!("greet missing");
        };
        let out = greet.call(context(owner.clone()), Params::default()).await.unwrap();
        assert_eq!(out, Some(json!("hello")));
    }
}
