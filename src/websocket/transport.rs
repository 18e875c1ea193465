use crate::config::Framing;
use crate::error::{RealtimeError, Result};
use log::*;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

// Type alias for the WebSocket stream
pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Builds `{base}/{endpoint}/{server-id}/{session-id}/websocket` with fresh
/// random ids. Call once per connection attempt.
pub fn session_url(ws_base_url: &str, endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(ws_base_url)?;
    let server_id = Uuid::new_v4().as_u128() % 1000;
    let session_id = Uuid::new_v4().simple().to_string();
    let path = format!(
        "{}/{}/{:03}/{}/websocket",
        url.path().trim_end_matches('/'),
        endpoint.trim_matches('/'),
        server_id,
        &session_id[..8]
    );
    url.set_path(&path);
    Ok(url)
}

/// Opens the WebSocket, carrying the bearer token on the upgrade request.
pub(crate) async fn open(
    url: &Url,
    access_token: &str,
    connect_timeout: Duration,
) -> Result<WsStream> {
    let mut request = url.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", access_token)).map_err(|e| {
        RealtimeError::Transport(format!("Access token is not a valid header value: {}", e))
    })?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    info!("Connecting to WebSocket: {}", url);
    let (ws_stream, response) = timeout(connect_timeout, connect_async(request))
        .await
        .map_err(|_| {
            RealtimeError::Transport(format!(
                "WebSocket connect timed out after {:?}",
                connect_timeout
            ))
        })?
        .map_err(|e| RealtimeError::Transport(format!("WebSocket connection failed: {}", e)))?;
    info!(
        "WebSocket connected successfully. Response: {:?}",
        response.status()
    );
    Ok(ws_stream)
}

/// What one inbound WebSocket text message carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Open,
    Heartbeat,
    Messages(Vec<String>),
    Close { code: u16, reason: String },
}

pub fn decode_envelope(framing: Framing, text: &str) -> Result<Envelope> {
    if framing == Framing::Raw {
        return Ok(Envelope::Messages(vec![text.to_string()]));
    }
    let kind = text.chars().next();
    let rest = &text[kind.map_or(0, char::len_utf8)..];
    match kind {
        Some('o') => Ok(Envelope::Open),
        Some('h') => Ok(Envelope::Heartbeat),
        Some('a') => Ok(Envelope::Messages(serde_json::from_str::<Vec<String>>(rest)?)),
        Some('c') => {
            let (code, reason) = serde_json::from_str::<(u16, String)>(rest)?;
            Ok(Envelope::Close { code, reason })
        }
        _ => Err(RealtimeError::Protocol(format!(
            "Unexpected SockJS frame '{}'",
            text.chars().take(32).collect::<String>()
        ))),
    }
}

pub fn encode_envelope(framing: Framing, payload: &str) -> Result<String> {
    match framing {
        Framing::Raw => Ok(payload.to_string()),
        Framing::SockJs => Ok(serde_json::to_string(&[payload])?),
    }
}
