use super::protocol::GRAPHQL_WS_PROTOCOL;
use futures::future::BoxFuture;
use futures::{FutureExt, Sink, Stream, StreamExt};
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// WebSocket-level failures. Reported through bridge events, never returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SubscriptionTransportError {
    /// Handshake or TCP/TLS connect to the downstream endpoint failed.
    #[error("websocket connect to {url} failed: {detail}")]
    Connect { url: String, detail: String },

    /// The connect attempt did not finish in time.
    #[error("websocket connect timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    /// Read or write failure on an open socket.
    #[error("websocket error: {detail}")]
    Socket { detail: String },
}

/// Where one bridge connection goes.
#[derive(Clone, PartialEq, Eq)]
pub struct SubscriptionTarget {
    pub url: String,
    pub api_key: Option<String>,
}

impl fmt::Debug for SubscriptionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionTarget")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        target: &SubscriptionTarget,
    ) -> BoxFuture<'static, Result<Transport, SubscriptionTransportError>>;
}

/// Real connector over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(
        &self,
        target: &SubscriptionTarget,
    ) -> BoxFuture<'static, Result<Transport, SubscriptionTransportError>> {
        let target = target.clone();
        async move {
            let connect_error = |detail: String| SubscriptionTransportError::Connect {
                url: target.url.clone(),
                detail,
            };

            let mut request = target
                .url
                .as_str()
                .into_client_request()
                .map_err(|err| connect_error(err.to_string()))?;
            let headers = request.headers_mut();
            if let Some(api_key) = &target.api_key {
                let mut value = HeaderValue::from_str(api_key)
                    .map_err(|_| connect_error("api key is not a valid header value".to_string()))?;
                value.set_sensitive(true);
                headers.insert("x-api-key", value);
            }
            headers.insert(
                SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(GRAPHQL_WS_PROTOCOL),
            );

            let (ws, _response) = connect_async(request)
                .await
                .map_err(|err| connect_error(err.to_string()))?;
            let (sink, stream) = ws.split();
            Ok(Transport {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_serialize_with_reason_tag() {
        let err = SubscriptionTransportError::ConnectTimeout { timeout_ms: 500 };
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({"reason": "connect_timeout", "timeout_ms": 500})
        );
    }

    #[test]
    fn target_debug_hides_api_key() {
        let target = SubscriptionTarget {
            url: "ws://tower.lan/graphql".to_string(),
            api_key: Some("unraid-secret".to_string()),
        };
        assert!(!format!("{target:?}").contains("unraid-secret"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_connect_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = SubscriptionTarget {
            url: format!("ws://127.0.0.1:{port}/graphql"),
            api_key: Some("k".to_string()),
        };
        let err = WsConnector.connect(&target).await.err().unwrap();
        assert!(matches!(err, SubscriptionTransportError::Connect { .. }), "{err:?}");
    }
}
