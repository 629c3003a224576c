//! Pending-call table and default-result policy.
//!
//! Each outstanding call-mode request owns one entry keyed by its
//! correlation id, plus a timer armed when the entry is registered. The
//! first of {response, timer, channel close} settles it; anything arriving
//! afterwards for the same id is ignored.

use crate::envelope::{CorrelationId, ResponseEnvelope};
use crate::{Result, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug)]
struct Entry {
    tx: oneshot::Sender<Result<ResponseEnvelope>>,
    timer: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Table {
    waiting: HashMap<CorrelationId, Entry>,
    closed: bool,
}

/// Calls awaiting their acknowledgment.
///
/// The table also hands out correlation ids, so every call sharing one
/// channel gets a distinct id no matter which stub issued it.
#[derive(Debug, Default)]
pub struct PendingCalls {
    table: Mutex<Table>,
    last_id: AtomicU64,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A correlation id never handed out before by this table.
    pub fn next_id(&self) -> CorrelationId {
        CorrelationId::Number(self.last_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Add an entry for `id` that expires after `timeout`.
    ///
    /// Must be called within a tokio runtime.
    pub fn register(self: &Arc<Self>, id: CorrelationId, timeout: Duration) -> Result<Waiter> {
        let mut table = self.lock();
        if table.closed {
            return Err(RpcError::ConnectionClosed);
        }
        if table.waiting.contains_key(&id) {
            return Err(RpcError::InvalidRequest {
                message: format!("correlation id {} is already pending", id),
            });
        }
        let (tx, rx) = oneshot::channel();
        let timer = tokio::spawn(Self::expire_after(Arc::downgrade(self), id.clone(), timeout));
        table.waiting.insert(id.clone(), Entry { tx, timer });
        Ok(Waiter {
            id,
            rx,
            table: Arc::downgrade(self),
        })
    }

    async fn expire_after(table: Weak<PendingCalls>, id: CorrelationId, timeout: Duration) {
        tokio::time::sleep(timeout).await;
        let Some(table) = table.upgrade() else {
            return;
        };
        let entry = table.lock().waiting.remove(&id);
        if let Some(entry) = entry {
            debug!("Call {} expired after {:?}", id, timeout);
            let _ = entry.tx.send(Err(RpcError::Timeout(timeout)));
        }
    }

    /// Deliver a response to its waiting call.
    ///
    /// Returns false when nothing is waiting on the id, e.g. for a response
    /// that arrives after its call timed out.
    pub fn complete(&self, response: ResponseEnvelope) -> bool {
        let Some(id) = response.id.clone() else {
            debug!("Discarding response without id");
            return false;
        };
        let entry = self.lock().waiting.remove(&id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                entry.tx.send(Ok(response)).is_ok()
            }
            None => {
                debug!("Discarding response for unknown or expired call {}", id);
                false
            }
        }
    }

    pub fn cancel(&self, id: &CorrelationId) {
        if let Some(entry) = self.lock().waiting.remove(id) {
            entry.timer.abort();
        }
    }

    /// Fail every waiting call and refuse new ones.
    pub fn close(&self) {
        let mut table = self.lock();
        table.closed = true;
        let dropped = table.waiting.len();
        for (_, entry) in table.waiting.drain() {
            entry.timer.abort();
        }
        if dropped > 0 {
            debug!("Closed pending table with {} outstanding calls", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle on one pending entry. Dropping it before the call settles
/// removes the entry.
#[derive(Debug)]
pub struct Waiter {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<ResponseEnvelope>>,
    table: Weak<PendingCalls>,
}

impl Waiter {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait for the response, the entry's timer, or the channel closing.
    pub async fn wait(mut self) -> Result<ResponseEnvelope> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.cancel(&self.id);
        }
    }
}

/// Turn the outcome of a call into the value its caller sees.
///
/// Remote errors, timeouts and transport failures become `default` when one
/// was supplied; otherwise they are returned as errors. A response without a
/// value yields `default` if present, else `None`.
pub fn settle(
    outcome: Result<ResponseEnvelope>,
    default: Option<&Value>,
    method: &str,
) -> Result<Option<Value>> {
    let failure = match outcome {
        Ok(response) => match response.into_outcome() {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => return Ok(default.cloned()),
            Err(err) => err,
        },
        Err(err) => err,
    };

    let Some(default) = default else {
        return Err(failure);
    };
    match &failure {
        RpcError::Timeout(after) => {
            info!("Call {} timed out after {:?}; using default result", method, after)
        }
        RpcError::Remote { code, message, .. } => info!(
            "Call {} failed with remote error {} ({}); using default result",
            method, code, message
        ),
        other if other.is_transport() => info!(
            "Call {} failed with transport error ({}); using default result",
            method, other
        ),
        other => info!(
            "Call {} failed locally ({}); using default result",
            method, other
        ),
    }
    Ok(Some(default.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_wakes_waiter() {
        let pending = Arc::new(PendingCalls::new());
        let waiter = pending.register(1.into(), Duration::from_secs(1)).unwrap();
        assert_eq!(pending.len(), 1);

        assert!(pending.complete(ResponseEnvelope::success(1.into(), Some(json!("ok")))));
        let response = waiter.wait().await.unwrap();
        assert_eq!(response.result, Some(json!("ok")));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let pending = Arc::new(PendingCalls::new());
        let first = pending.register(1.into(), Duration::from_secs(1)).unwrap();
        let second = pending.register(2.into(), Duration::from_secs(1)).unwrap();

        pending.complete(ResponseEnvelope::success(2.into(), Some(json!("two"))));
        pending.complete(ResponseEnvelope::success(1.into(), Some(json!("one"))));

        assert_eq!(first.wait().await.unwrap().result, Some(json!("one")));
        assert_eq!(second.wait().await.unwrap().result, Some(json!("two")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry_and_late_response_is_ignored() {
        let pending = Arc::new(PendingCalls::new());
        let waiter = pending.register(7.into(), Duration::from_millis(10)).unwrap();

        let err = waiter.wait().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(pending.is_empty());

        assert!(!pending.complete(ResponseEnvelope::success(7.into(), Some(json!(1)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expires_entry_nobody_polls() {
        let pending = Arc::new(PendingCalls::new());
        let waiter = pending.register(1.into(), Duration::from_millis(10)).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pending.is_empty());
        assert!(waiter.wait().await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_dropped_waiter_removes_entry() {
        let pending = Arc::new(PendingCalls::new());
        let waiter = pending.register(1.into(), Duration::from_secs(60)).unwrap();
        assert_eq!(pending.len(), 1);

        drop(waiter);
        assert!(pending.is_empty());
        assert!(!pending.complete(ResponseEnvelope::success(1.into(), Some(json!(1)))));
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_new_registrations() {
        let pending = Arc::new(PendingCalls::new());
        let waiter = pending.register("a".into(), Duration::from_secs(1)).unwrap();
        pending.close();

        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        assert!(matches!(
            pending.register("b".into(), Duration::from_secs(1)),
            Err(RpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let pending = Arc::new(PendingCalls::new());
        let _waiter = pending.register(3.into(), Duration::from_secs(1)).unwrap();
        assert!(pending.register(3.into(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_next_id_is_fresh() {
        let pending = PendingCalls::new();
        let first = pending.next_id();
        let second = pending.next_id();
        assert_eq!(first, CorrelationId::Number(1));
        assert_ne!(first, second);
    }

    #[test]
    fn test_settle_success_ignores_default() {
        let response = ResponseEnvelope::success(1.into(), Some(json!(5)));
        let fallback = json!("fallback");
        assert_eq!(settle(Ok(response), Some(&fallback), ".a").unwrap(), Some(json!(5)));
    }

    #[test]
    fn test_settle_absent_result() {
        let fallback = json!("fallback");
        let absent = ResponseEnvelope::success(1.into(), None);
        assert_eq!(settle(Ok(absent.clone()), None, ".a").unwrap(), None);
        assert_eq!(settle(Ok(absent), Some(&fallback), ".a").unwrap(), Some(fallback));
    }

    #[test]
    fn test_settle_failures_use_default() {
        let fallback = json!("fallback");
        let remote = ResponseEnvelope::failure(1.into(), ErrorCode::ServiceError, "boom");
        assert_eq!(
            settle(Ok(remote), Some(&fallback), ".a").unwrap(),
            Some(fallback.clone())
        );
        assert_eq!(
            settle(Err(RpcError::Timeout(Duration::from_millis(10))), Some(&fallback), ".a").unwrap(),
            Some(fallback.clone())
        );
        assert_eq!(
            settle(Err(RpcError::ConnectionClosed), Some(&fallback), ".a").unwrap(),
            Some(fallback)
        );
    }

    #[test]
    fn test_settle_failures_without_default_propagate() {
        let remote = ResponseEnvelope::failure(1.into(), ErrorCode::MethodNotFound, "Method not found");
        match settle(Ok(remote), None, ".a") {
            Err(RpcError::Remote { code, .. }) => assert_eq!(code, 0),
            other => panic!("expected remote error, got {:?}", other),
        }
        assert!(settle(Err(RpcError::Timeout(Duration::from_millis(1))), None, ".a")
            .unwrap_err()
            .is_timeout());
    }
}
