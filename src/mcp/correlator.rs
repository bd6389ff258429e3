//! Request/reply correlation for one Session
//!
//! Every outgoing request gets a fresh numeric id and a pending waiter. Replies
//! are matched by id, never by arrival order, so any number of calls can be in
//! flight on the same transport. A waiter settles exactly once: on its reply,
//! on its own timeout, or when the transport terminates.

use crate::mcp::error::MCPOperationError;
use crate::mcp::types::{MCPMessage, MCPNotification, MCPRequest, MCPResponse, MCPResponsePayload};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

type Waiter = oneshot::Sender<Result<Value, MCPOperationError>>;

struct PendingRequest {
    sender: Waiter,
    method: String,
    started: Instant,
}

#[derive(Default)]
struct CorrelatorState {
    pending: HashMap<u64, PendingRequest>,
    terminated: Option<MCPOperationError>,
}

/// Pending-request map plus the outgoing half of a transport
pub struct Correlator {
    next_id: AtomicU64,
    state: Mutex<CorrelatorState>,
    outgoing: mpsc::UnboundedSender<MCPMessage>,
}

impl Correlator {
    /// Create a correlator writing into `outgoing`
    pub fn new(outgoing: mpsc::UnboundedSender<MCPMessage>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(CorrelatorState::default()),
            outgoing,
        }
    }

    /// Send a request and wait for its reply
    ///
    /// On timeout the waiter is removed and the request abandoned; a late reply
    /// for it is then dropped as unmatched.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, MCPOperationError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.lock().await;
            if let Some(reason) = &state.terminated {
                return Err(reason.clone());
            }
            state.pending.insert(
                id,
                PendingRequest {
                    sender: tx,
                    method: method.to_string(),
                    started: Instant::now(),
                },
            );
        }

        trace!(request_id = id, method = %method, "Sending request");
        let request = MCPMessage::Request(MCPRequest::new(json!(id), method, params));
        if self.outgoing.send(request).is_err() {
            self.state.lock().await.pending.remove(&id);
            return Err(MCPOperationError::connection_lost("Transport writer is closed"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MCPOperationError::connection_lost(
                "Request was dropped before a reply arrived",
            )),
            Err(_) => {
                self.state.lock().await.pending.remove(&id);
                debug!(request_id = id, method = %method, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(MCPOperationError::timeout(timeout))
            }
        }
    }

    /// Send a notification; no reply is expected
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), MCPOperationError> {
        let notification = MCPMessage::Notification(MCPNotification::new(method, params));
        self.outgoing
            .send(notification)
            .map_err(|_| MCPOperationError::connection_lost("Transport writer is closed"))
    }

    /// Send a message that is not tracked, such as a reply to the server
    pub fn send_raw(&self, message: MCPMessage) -> Result<(), MCPOperationError> {
        self.outgoing
            .send(message)
            .map_err(|_| MCPOperationError::connection_lost("Transport writer is closed"))
    }

    /// Settle the waiter matching this reply; returns whether one matched
    pub async fn resolve(&self, response: MCPResponse) -> bool {
        let Some(id) = response.numeric_id() else {
            debug!(id = %response.id, "Dropping reply with non-numeric id");
            return false;
        };

        let pending = self.state.lock().await.pending.remove(&id);
        let Some(pending) = pending else {
            debug!(request_id = id, "Dropping reply with no pending request");
            return false;
        };

        trace!(
            request_id = id,
            method = %pending.method,
            elapsed_ms = pending.started.elapsed().as_millis() as u64,
            "Reply received"
        );

        let outcome = match response.payload {
            MCPResponsePayload::Success { result } => Ok(result),
            MCPResponsePayload::Error { error } => {
                Err(MCPOperationError::server(error.code, error.message))
            }
        };
        // The caller may have given up already
        let _ = pending.sender.send(outcome);
        true
    }

    /// Reject every pending waiter and refuse new calls
    ///
    /// Returns how many waiters were rejected. Only the first call has effect.
    pub async fn terminate(&self, reason: MCPOperationError) -> usize {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut state = self.state.lock().await;
            if state.terminated.is_some() {
                return 0;
            }
            state.terminated = Some(reason.clone());
            state.pending.drain().collect()
        };

        if !drained.is_empty() {
            warn!(pending = drained.len(), reason = %reason, "Rejecting pending requests");
        }
        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.sender.send(Err(reason.clone()));
        }
        count
    }

    /// Whether `terminate` has run
    pub async fn is_terminated(&self) -> bool {
        self.state.lock().await.terminated.is_some()
    }

    /// Number of requests still waiting for a reply
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::MCPError;
    use std::sync::Arc;

    fn request_id(message: &MCPMessage) -> u64 {
        match message {
            MCPMessage::Request(r) => r.id.as_u64().unwrap(),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replies_matched_by_id_under_reordering() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let correlator = Arc::new(Correlator::new(tx));

        let mut calls = Vec::new();
        for i in 0..5 {
            let c = correlator.clone();
            calls.push(tokio::spawn(async move {
                c.call("tools/call", Some(json!({"n": i})), Duration::from_secs(5))
                    .await
            }));
        }

        let mut sent = Vec::new();
        for _ in 0..5 {
            let message = rx.recv().await.unwrap();
            let n = match &message {
                MCPMessage::Request(r) => r.params.as_ref().unwrap()["n"].as_i64().unwrap(),
                _ => unreachable!(),
            };
            sent.push((request_id(&message), n));
        }

        // Reply in reverse order, echoing each request's own payload
        for (id, n) in sent.iter().rev() {
            assert!(correlator.resolve(MCPResponse::success(json!(id), json!({"n": n}))).await);
        }

        for (i, call) in calls.into_iter().enumerate() {
            let result = call.await.unwrap().unwrap();
            assert_eq!(result["n"], json!(i));
        }
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let correlator = Correlator::new(tx);
        let _ = correlator.call("a", None, Duration::from_millis(1)).await;
        let _ = correlator.call("b", None, Duration::from_millis(1)).await;
        let first = request_id(&rx.recv().await.unwrap());
        let second = request_id(&rx.recv().await.unwrap());
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_once_and_late_reply_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let correlator = Correlator::new(tx);

        let err = correlator
            .call("slow", None, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err, MCPOperationError::timeout(Duration::from_secs(30)));
        assert_eq!(correlator.pending_count().await, 0);

        let id = request_id(&rx.recv().await.unwrap());
        assert!(!correlator.resolve(MCPResponse::success(json!(id), json!({}))).await);
        assert!(!correlator.is_terminated().await);
    }

    #[tokio::test]
    async fn test_error_reply_becomes_server_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let correlator = Arc::new(Correlator::new(tx));

        let c = correlator.clone();
        let call = tokio::spawn(async move { c.call("tools/call", None, Duration::from_secs(5)).await });

        let id = request_id(&rx.recv().await.unwrap());
        // Numeric-string ids are accepted
        let reply = MCPResponse::error(json!(id.to_string()), MCPError::new(-32602, "bad args"));
        assert!(correlator.resolve(reply).await);

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, MCPOperationError::server(-32602, "bad args"));
    }

    #[tokio::test]
    async fn test_terminate_rejects_every_pending_call() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let correlator = Arc::new(Correlator::new(tx));

        let mut calls = Vec::new();
        for _ in 0..3 {
            let c = correlator.clone();
            calls.push(tokio::spawn(async move {
                c.call("tools/call", None, Duration::from_secs(60)).await
            }));
        }
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        let reason = MCPOperationError::process_exited(Some(1));
        assert_eq!(correlator.terminate(reason.clone()).await, 3);
        assert_eq!(correlator.terminate(reason.clone()).await, 0);

        for call in calls {
            assert_eq!(call.await.unwrap().unwrap_err(), reason);
        }

        let late = correlator.call("tools/list", None, Duration::from_secs(1)).await;
        assert_eq!(late.unwrap_err(), reason);
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let correlator = Correlator::new(tx);
        assert!(!correlator.resolve(MCPResponse::success(json!(999), json!({}))).await);
        assert!(!correlator.resolve(MCPResponse::success(json!("x"), json!({}))).await);
    }
}
