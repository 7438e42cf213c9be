//! Unified error type for the streamd-rpc crate.

use crate::client::ClientError;
use crate::protocol::RpcError;
use crate::transport::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Rpc(RpcError),

    #[error("Connection closed")]
    Disconnected,

    #[error("Request timeout")]
    Timeout,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Unexpected response")]
    UnexpectedResponse,
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}

impl From<ClientError> for Error {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Io(e) => Self::Io(e),
            ClientError::Codec(e) => Self::Codec(e),
            ClientError::Json(e) => Self::Json(e),
            ClientError::Rpc(e) => Self::Rpc(e),
            ClientError::ConnectionClosed => Self::Disconnected,
            ClientError::Timeout => Self::Timeout,
            ClientError::UnexpectedResponse => Self::UnexpectedResponse,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::STREAM_NOT_FOUND;

    #[test]
    fn test_error_from_rpc_error() {
        let err: Error = RpcError::new(STREAM_NOT_FOUND, "Stream not found").into();
        assert_eq!(err.to_string(), "RPC error -32003: Stream not found");
    }

    #[test]
    fn test_error_from_client_error() {
        assert!(matches!(
            Error::from(ClientError::ConnectionClosed),
            Error::Disconnected
        ));
        assert!(matches!(Error::from(ClientError::Timeout), Error::Timeout));

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let err: Error = ClientError::Io(io).into();
        assert!(err.to_string().contains("pipe broken"));
    }

    #[test]
    fn test_error_from_codec_error() {
        let err: Error = CodecError::MessageTooLarge { max: 42 }.into();
        assert!(matches!(err, Error::Codec(_)));
        assert!(err.to_string().contains("42"));
    }
}
