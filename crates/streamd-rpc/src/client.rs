//! Async client for the daemon's control port.
//!
//! Used by `streamd --stop` and by tests that drive a live daemon.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::protocol::{Message, Request, RequestId, Response, RpcError};
use crate::transport::{CodecError, JsonRpcCodec};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error: {0}")]
    Rpc(RpcError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,

    #[error("Unexpected response type")]
    UnexpectedResponse,
}

impl From<RpcError> for ClientError {
    fn from(e: RpcError) -> Self {
        ClientError::Rpc(e)
    }
}

type PendingRequest = oneshot::Sender<Result<Response, ClientError>>;
type FramedSink = SplitSink<Framed<TcpStream, JsonRpcCodec>, Message>;

/// Control-port client. Responses are matched to requests by id; anything
/// else the daemon sends (broadcasts, `ping_client`) is queued for [`recv`].
///
/// [`recv`]: RpcClient::recv
pub struct RpcClient {
    sender: Arc<Mutex<FramedSink>>,
    incoming_rx: mpsc::Receiver<Message>,
    pending: Arc<Mutex<HashMap<RequestId, PendingRequest>>>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Connect to a daemon control port.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Io` if the TCP connection fails.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (sink, mut stream) = Framed::new(stream, JsonRpcCodec::new()).split();

        let pending: Arc<Mutex<HashMap<RequestId, PendingRequest>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pending_reader = pending.clone();
        let (incoming_tx, incoming_rx) = mpsc::channel(64);

        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(Message::Response(resp)) => {
                        let waiter = pending_reader.lock().await.remove(&resp.id);
                        if let Some(tx) = waiter {
                            let _ = tx.send(Ok(resp));
                        }
                    }
                    Ok(msg) => {
                        if incoming_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        for (_, tx) in pending_reader.lock().await.drain() {
                            let _ = tx.send(Err(ClientError::Io(std::io::Error::other(
                                e.to_string(),
                            ))));
                        }
                        break;
                    }
                }
            }
        });

        Ok(Self {
            sender: Arc::new(Mutex::new(sink)),
            incoming_rx,
            pending,
            next_id: AtomicU64::new(1),
        })
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Rpc` when the daemon answers with an error
    /// object, or a transport error if the exchange fails.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        self.sender
            .lock()
            .await
            .send(Message::Request(Request::new(method, params, id)))
            .await?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::ConnectionClosed)??;

        if let Some(error) = response.error {
            return Err(error.into());
        }
        response.result.ok_or(ClientError::UnexpectedResponse)
    }

    /// Send a frame without waiting for anything back.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Codec` if the frame cannot be written.
    pub async fn send(&self, message: Message) -> Result<(), ClientError> {
        self.sender.lock().await.send(message).await?;
        Ok(())
    }

    /// Next daemon-originated request or notification.
    pub async fn recv(&mut self) -> Option<Message> {
        self.incoming_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NOT_ACTIVATED, errno};
    use tokio::net::TcpListener;

    #[test]
    fn test_client_error_from_rpc_error() {
        let client_err: ClientError = RpcError::not_activated().into();
        match client_err {
            ClientError::Rpc(err) => {
                assert_eq!(err.code, NOT_ACTIVATED);
                assert_eq!(err.errno(), Some(errno::EINVAL));
            }
            other => panic!("Expected Rpc error, got {other:?}"),
        }
    }

    #[test]
    fn test_client_error_display() {
        assert_eq!(
            ClientError::ConnectionClosed.to_string(),
            "Connection closed",
        );
        assert_eq!(ClientError::Timeout.to_string(), "Request timeout");
        let err = ClientError::Rpc(RpcError::new(-32002, "exists"));
        assert!(err.to_string().contains("-32002"));
    }

    #[tokio::test]
    async fn test_request_against_echo_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, JsonRpcCodec::new());
            framed
                .send(Message::notification("statistic_service", None))
                .await
                .unwrap();
            while let Some(Ok(Message::Request(req))) = framed.next().await {
                let id = req.id.unwrap();
                let reply = if req.method == "fail" {
                    Response::error(id, RpcError::permission_denied())
                } else {
                    Response::success(id, serde_json::json!({"method": req.method}))
                };
                framed.send(Message::Response(reply)).await.unwrap();
            }
        });

        let mut client = RpcClient::connect(addr).await.unwrap();
        let result = client.request("ping_service", None).await.unwrap();
        assert_eq!(result["method"], "ping_service");

        let err = client.request("fail", None).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Rpc(e) if e.message == "Don't have permissions"
        ));

        let broadcast = client.recv().await.unwrap();
        assert_eq!(broadcast.method(), Some("statistic_service"));
    }
}
