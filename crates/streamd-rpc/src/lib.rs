//! Wire protocol for the streamd node daemon.
//!
//! Control sessions (TCP) and worker links (child stdin/stdout) speak the same
//! envelope: JSON-RPC 2.0 shaped messages framed with a 4-byte big-endian
//! length prefix.
//!
//! - [`protocol`]: message envelope, error object and error codes
//! - [`transport`]: length-prefixed codec
//! - [`client`]: control-port client
//! - [`error`]: crate error and `Result` alias
//!
//! ```no_run
//! use streamd_rpc::RpcClient;
//!
//! # async fn example() -> Result<(), streamd_rpc::ClientError> {
//! let client = RpcClient::connect("127.0.0.1:6317").await?;
//! client.request("stop_service", None).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{ClientError, RpcClient};
pub use error::{Error, Result};
pub use protocol::{
    ACTIVATION_FAILED, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION,
    METHOD_NOT_FOUND, Message, NOT_ACTIVATED, Notification, OPERATION_FAILED, PARSE_ERROR,
    PERMISSION_DENIED, Request, RequestId, Response, RpcError, SHUTDOWN_IN_PROGRESS,
    STREAM_EXISTS, STREAM_NOT_FOUND, VALIDATION_FAILED, errno,
};
pub use transport::{CodecError, JsonRpcCodec, MalformedPolicy};
