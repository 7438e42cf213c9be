//! Requests and notifications the daemon originates.
//!
//! Workers receive `stop` / `restart`, control sessions receive `ping_client`
//! and the broadcast notifications. Request ids come from one counter so a
//! response can be matched against the sender's pending table.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use streamd_rpc::{Message, Notification, Request, RequestId};
use tokio::sync::mpsc;
use tracing::{trace, warn};

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> RequestId {
    RequestId::Number(REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst))
}

/// Send a request over `sender` and return its id for the pending table.
///
/// # Errors
///
/// Returns an error if the peer's channel is closed.
pub fn send_request(
    sender: &mpsc::UnboundedSender<Message>,
    peer: &str,
    method: &str,
    params: Option<Value>,
) -> Result<RequestId, String> {
    let id = next_request_id();
    let request = Request::new(method, params, id.clone());

    trace!("[{}] Sending request: method={}, id={}", peer, method, id);

    sender
        .send(Message::Request(request))
        .map(|()| id)
        .map_err(|e| {
            warn!("[{}] Failed to send {} request: {}", peer, method, e);
            format!("Failed to send {method} request: {e}")
        })
}

/// Send a notification over `sender`.
///
/// # Errors
///
/// Returns an error if the peer's channel is closed.
pub fn send_notification(
    sender: &mpsc::UnboundedSender<Message>,
    peer: &str,
    method: &str,
    params: Option<Value>,
) -> Result<(), String> {
    trace!("[{}] Sending notification: method={}", peer, method);

    sender
        .send(Message::Notification(Notification::new(method, params)))
        .map_err(|e| format!("Failed to send {method} notification: {e}"))
}
