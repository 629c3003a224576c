//! Batch execution.
//!
//! A batch call carries `[mode, subcalls]`. Each subcall re-enters the
//! dispatcher under a synthesized id, so every subcall gets its own response
//! and a failing subcall never affects the others. Responses come back in
//! request order in both modes.

use crate::dispatcher::{subcall_id, Dispatcher};
use crate::envelope::{ExecutionMode, ResponseEnvelope};
use crate::graph::ServerParams;
use crate::{Result, RpcError};
use futures::future::join_all;
use serde_json::Value;
use tracing::debug;

pub struct BatchExecutor<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Split normalized batch params into the mode and the subcall list.
    pub fn parse(params: Vec<Value>) -> Result<(ExecutionMode, Vec<Value>)> {
        let mut params = params.into_iter();
        let mode = match params.next() {
            Some(Value::String(mode)) => mode.parse::<ExecutionMode>()?,
            _ => {
                return Err(RpcError::InvalidRequest {
                    message: "batch mode must be \"sequential\" or \"parallel\"".to_string(),
                })
            }
        };
        match params.next() {
            Some(Value::Array(subcalls)) => Ok((mode, subcalls)),
            _ => Err(RpcError::InvalidRequest {
                message: "batch subcalls must be a list".to_string(),
            }),
        }
    }

    /// Run every subcall and collect one response per subcall, in order.
    pub async fn execute(
        &self,
        mode: ExecutionMode,
        subcalls: Vec<Value>,
        server: &ServerParams,
    ) -> Vec<ResponseEnvelope> {
        debug!("Executing {} batch of {} subcalls", mode.as_str(), subcalls.len());
        let subcalls: Vec<Value> = subcalls
            .into_iter()
            .enumerate()
            .map(|(index, subcall)| with_id(subcall, index))
            .collect();

        match mode {
            ExecutionMode::Sequential => {
                let mut responses = Vec::with_capacity(subcalls.len());
                for (index, subcall) in subcalls.into_iter().enumerate() {
                    responses.push(self.run(index, subcall, server).await);
                }
                responses
            }
            ExecutionMode::Parallel => {
                join_all(
                    subcalls
                        .into_iter()
                        .enumerate()
                        .map(|(index, subcall)| self.run(index, subcall, server)),
                )
                .await
            }
        }
    }

    async fn run(&self, index: usize, subcall: Value, server: &ServerParams) -> ResponseEnvelope {
        self.dispatcher
            .dispatch_one(subcall, server)
            .await
            .unwrap_or_else(|| ResponseEnvelope::success(subcall_id(index), None))
    }
}

/// Replace the subcall's id with the synthesized one.
///
/// Entries that are not objects become an object carrying only the id, which
/// the dispatcher answers with `InvalidRequest`.
fn with_id(subcall: Value, index: usize) -> Value {
    let id = Value::String(subcall_id(index).to_string());
    match subcall {
        Value::Object(mut map) => {
            map.insert("id".to_string(), id);
            Value::Object(map)
        }
        _ => {
            let mut map = serde_json::Map::new();
            map.insert("id".to_string(), id);
            Value::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Reply;
    use crate::error::ErrorCode;
    use crate::graph::ObjectNode;
    use crate::revival::RevivalRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn dispatcher(log: Arc<std::sync::Mutex<Vec<String>>>) -> Dispatcher {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seq_log = log.clone();
        let root = ObjectNode::builder()
            .func("a", move |_, _| {
                seq_log.lock().unwrap().push("a".into());
                Ok("A")
            })
            .func("b", move |_, _| {
                log.lock().unwrap().push("b".into());
                Ok("B")
            })
            .func("boom", |_, _| -> anyhow::Result<Value> { anyhow::bail!("boom") })
            .handler("slow", |_, p| async move {
                let ms: u64 = p.arg(0)?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, anyhow::Error>(ms)
            })
            .func("tick", move |_, _| Ok(ticks.fetch_add(1, Ordering::SeqCst)))
            .build();
        Dispatcher::new(root, Arc::new(RevivalRegistry::new()))
    }

    async fn batch(d: &Dispatcher, params: Value) -> ResponseEnvelope {
        let message = json!({"method": "rpc-batch", "params": params, "id": "b1"});
        match d.receive(message, &ServerParams::none()).await {
            Some(Reply::Single(response)) => response,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    fn subresponses(response: ResponseEnvelope) -> Vec<ResponseEnvelope> {
        serde_json::from_value(response.result.expect("batch result")).unwrap()
    }

    #[tokio::test]
    async fn test_sequential_failure_does_not_short_circuit() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let d = dispatcher(log.clone());
        let response = batch(
            &d,
            json!(["sequential", [{"method": ".a"}, {"method": ".missing"}, {"method": ".b"}]]),
        )
        .await;
        let subs = subresponses(response);

        assert_eq!(subs.len(), 3);
        assert_eq!(subs[0].result, Some(json!("A")));
        assert_eq!(subs[1].error.as_ref().unwrap().error_code(), ErrorCode::MethodNotFound);
        assert_eq!(subs[2].result, Some(json!("B")));
        assert_eq!(*log.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_parallel_results_keep_request_order() {
        let d = dispatcher(Default::default());
        let response = batch(
            &d,
            json!(["parallel", [
                {"method": ".slow", "params": [60]},
                {"method": ".slow", "params": [1]},
                {"method": ".boom"},
                {"method": ".slow", "params": [30]}
            ]]),
        )
        .await;
        let subs = subresponses(response);

        assert_eq!(subs.len(), 4);
        assert_eq!(subs[0].result, Some(json!(60)));
        assert_eq!(subs[1].result, Some(json!(1)));
        assert_eq!(subs[2].error.as_ref().unwrap().error_code(), ErrorCode::ServiceError);
        assert_eq!(subs[3].result, Some(json!(30)));
    }

    #[tokio::test]
    async fn test_subresponses_carry_synthesized_ids() {
        let d = dispatcher(Default::default());
        let response = batch(&d, json!(["sequential", [{"method": ".tick", "id": 99}, {"method": ".tick"}]])).await;
        let subs = subresponses(response);
        assert_eq!(subs[0].id, Some("rpc-batch-1".into()));
        assert_eq!(subs[1].id, Some("rpc-batch-2".into()));
        assert_eq!(subs[1].result, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_malformed_entries_fail_in_place() {
        let d = dispatcher(Default::default());
        let response = batch(&d, json!(["parallel", [{"params": [1]}, 42, {"method": ".a"}]])).await;
        let subs = subresponses(response);

        assert_eq!(subs.len(), 3);
        assert_eq!(subs[0].error.as_ref().unwrap().error_code(), ErrorCode::InvalidRequest);
        assert_eq!(subs[1].error.as_ref().unwrap().error_code(), ErrorCode::InvalidRequest);
        assert_eq!(subs[2].result, Some(json!("A")));
    }

    #[tokio::test]
    async fn test_malformed_batch_params_fail_the_envelope() {
        let d = dispatcher(Default::default());
        for params in [json!(["eventually", []]), json!(["parallel", "nope"]), json!([])] {
            let response = batch(&d, params).await;
            assert_eq!(response.error.unwrap().error_code(), ErrorCode::InvalidRequest);
        }
    }

    #[tokio::test]
    async fn test_nested_batch() {
        let d = dispatcher(Default::default());
        let response = batch(
            &d,
            json!(["sequential", [
                {"method": "rpc-batch", "params": ["parallel", [{"method": ".a"}, {"method": ".b"}]]},
                {"method": ".a"}
            ]]),
        )
        .await;
        let subs = subresponses(response);
        let inner = subresponses(subs[0].clone());
        assert_eq!(inner.len(), 2);
        assert_eq!(inner[1].result, Some(json!("B")));
        assert_eq!(subs[1].result, Some(json!("A")));
    }

    #[tokio::test]
    async fn test_batch_notification_still_runs_subcalls() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let d = dispatcher(log.clone());
        let reply = d
            .receive(
                json!({"method": "rpc-batch", "params": ["sequential", [{"method": ".a"}, {"method": ".b"}]]}),
                &ServerParams::none(),
            )
            .await;
        assert!(reply.is_none());
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_rejects_missing_subcalls() {
        assert!(BatchExecutor::parse(vec![json!("sequential")]).is_err());
        let (mode, subcalls) = BatchExecutor::parse(vec![json!("parallel"), json!([{}])]).unwrap();
        assert_eq!(mode, ExecutionMode::Parallel);
        assert_eq!(subcalls.len(), 1);
    }
}
