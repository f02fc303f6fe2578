//! Daemon Wire Protocol
//!
//! Request/response messages exchanged with `switchboard-daemon` over its
//! Unix socket, one [`DaemonResponse`] per [`DaemonRequest`], each carried
//! in a CRC32-checked frame (see [`frame`]).

pub mod frame;

use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::alerts::{Alert, AlertEvent};
use crate::config::ConfigUpdate;
use crate::error::{ErrorClass, RouterError};
use crate::provider::{ProviderId, ProviderOverride, ProviderProfile};
use crate::request::ChatRequest;
use crate::routing::router::DispatchResponse;
use crate::service::ServiceStatistics;

pub use frame::{encode, FrameDecoder, MAX_FRAME_SIZE};

/// Failures reading or writing frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket read or write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload was not valid JSON for the expected type
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Declared length exceeds [`MAX_FRAME_SIZE`]
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared payload length
        size: usize,
        /// Largest accepted payload
        max: usize,
    },

    /// Payload does not match its CRC32
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame
        expected: u32,
        /// Checksum of the received payload
        actual: u32,
    },

    /// Peer closed the stream mid-exchange
    #[error("Connection closed before a response arrived")]
    ConnectionClosed,
}

/// Requests accepted by the daemon
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Route a chat request
    Dispatch {
        /// The request to route
        request: ChatRequest,
    },
    /// Service-wide statistics
    Statistics,
    /// Currently active alerts
    ActiveAlerts,
    /// Dismiss one alert
    DismissAlert {
        /// Alert to dismiss
        id: Uuid,
    },
    /// Apply a partial configuration update
    UpdateConfig {
        /// Fields to change
        update: ConfigUpdate,
    },
    /// Run an alert check immediately
    CheckAlerts,
    /// Change one provider's profile
    OverrideProvider {
        /// Provider to change
        provider: ProviderId,
        /// Fields to change
        patch: ProviderOverride,
    },
    /// Router counters in Prometheus text format
    Metrics,
    /// Liveness check
    Ping,
}

/// Answers sent by the daemon
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    /// A dispatch succeeded
    Dispatched {
        /// The routed answer
        response: DispatchResponse,
    },
    /// A dispatch failed
    DispatchFailed {
        /// Class of the terminal error
        class: ErrorClass,
        /// Whether the caller may retry later
        retryable: bool,
        /// Error detail
        message: String,
    },
    /// Answer to [`DaemonRequest::Statistics`]
    Statistics {
        /// Service snapshot
        statistics: ServiceStatistics,
    },
    /// Answer to [`DaemonRequest::ActiveAlerts`]
    Alerts {
        /// Active alerts
        alerts: Vec<Alert>,
    },
    /// Answer to [`DaemonRequest::CheckAlerts`]
    AlertChanges {
        /// Changes made by the check
        changes: Vec<AlertEvent>,
    },
    /// Answer to [`DaemonRequest::DismissAlert`]
    Dismissed {
        /// Whether the alert existed
        found: bool,
    },
    /// Answer to [`DaemonRequest::OverrideProvider`]
    Profile {
        /// Profile after the override
        profile: ProviderProfile,
    },
    /// Answer to [`DaemonRequest::Metrics`]
    Metrics {
        /// Prometheus exposition text
        text: String,
    },
    /// Request applied
    Ok,
    /// Answer to [`DaemonRequest::Ping`]
    Pong,
    /// Request rejected
    Error {
        /// Why it was rejected
        message: String,
    },
}

impl From<&RouterError> for DaemonResponse {
    fn from(e: &RouterError) -> Self {
        Self::DispatchFailed {
            class: e.class(),
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

/// Write one framed message
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next framed message; `None` on a clean end of stream
pub async fn read_message<R, T>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = [0u8; 8192];
    loop {
        if let Some(msg) = decoder.decode()? {
            return Ok(Some(msg));
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        decoder.push(&buf[..n]);
    }
}

/// Send one request to a daemon socket and wait for its answer
pub async fn call(socket_path: &Path, request: &DaemonRequest) -> Result<DaemonResponse, ProtocolError> {
    let mut stream = tokio::net::UnixStream::connect(socket_path).await?;
    write_message(&mut stream, request).await?;
    let mut decoder = FrameDecoder::new();
    read_message(&mut stream, &mut decoder)
        .await?
        .ok_or(ProtocolError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_names() {
        let json = serde_json::to_value(DaemonRequest::DismissAlert { id: Uuid::nil() }).unwrap();
        assert_eq!(json["type"], "dismiss_alert");

        let parsed: DaemonRequest = serde_json::from_str(
            r#"{"type":"dispatch","request":{"messages":[{"role":"user","content":"hi"}],"provider":"groq"}}"#,
        )
        .unwrap();
        match parsed {
            DaemonRequest::Dispatch { request } => {
                assert_eq!(request.provider, Some(ProviderId::Groq));
                assert!(request.use_cache);
                assert!(!request.request_id.is_empty());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_router_error_maps_to_failure() {
        let err = RouterError::Timeout { after_ms: 1500 };
        match DaemonResponse::from(&err) {
            DaemonResponse::DispatchFailed { class, retryable, .. } => {
                assert_eq!(class, ErrorClass::Timeout);
                assert!(retryable);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplex_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_message(&mut client, &DaemonRequest::Metrics).await.unwrap();
        });

        let mut decoder = FrameDecoder::new();
        let got: Option<DaemonRequest> = read_message(&mut server, &mut decoder).await.unwrap();
        assert_eq!(got, Some(DaemonRequest::Metrics));
        writer.await.unwrap();

        let eof: Option<DaemonRequest> = read_message(&mut server, &mut decoder).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn test_reads_frame_split_across_reads() {
        let bytes = encode(&DaemonRequest::CheckAlerts).unwrap();
        let mut mock = tokio_test::io::Builder::new()
            .read(&bytes[..5])
            .read(&bytes[5..])
            .build();

        let mut decoder = FrameDecoder::new();
        let got: Option<DaemonRequest> = read_message(&mut mock, &mut decoder).await.unwrap();
        assert_eq!(got, Some(DaemonRequest::CheckAlerts));
    }

    #[tokio::test]
    async fn test_writes_exact_frame() {
        let expected = encode(&DaemonResponse::Pong).unwrap();
        let mut mock = tokio_test::io::Builder::new().write(&expected).build();
        write_message(&mut mock, &DaemonResponse::Pong).await.unwrap();
    }
}
