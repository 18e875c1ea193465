//! STOMP 1.2 frame codec and heart-beat negotiation.

use crate::error::{RealtimeError, Result};
use std::fmt;
use std::time::Duration;

const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        })
    }

    // CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected | Command::Stomp)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// One unit read off the wire: either an EOL heart-beat or a full frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Frame(StompFrame),
}

impl StompFrame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header. Repeated headers keep the first occurrence.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, heart_beat: (u64, u64), extra: &[(String, String)]) -> Self {
        let mut frame = StompFrame::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", format!("{},{}", heart_beat.0, heart_beat.1));
        for (k, v) in extra {
            frame = frame.header(k.clone(), v.clone());
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        StompFrame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        StompFrame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send_json(destination: &str, body: String) -> Self {
        StompFrame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body)
    }

    pub fn disconnect() -> Self {
        StompFrame::new(Command::Disconnect)
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (k, v) in &self.headers {
            if escape {
                out.push_str(&escape_header(k));
                out.push(':');
                out.push_str(&escape_header(v));
            } else {
                out.push_str(k);
                out.push(':');
                out.push_str(v);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get_header("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parses a single frame. The trailing NUL is optional.
    pub fn decode(raw: &str) -> Result<Self> {
        let raw = raw.trim_start_matches(['\r', '\n']);
        let raw = raw.strip_suffix('\0').unwrap_or(raw);

        let (head, body) = match raw.find("\n\n") {
            Some(idx) => (&raw[..idx], &raw[idx + 2..]),
            None => match raw.find("\r\n\r\n") {
                Some(idx) => (&raw[..idx], &raw[idx + 4..]),
                None => (raw, ""),
            },
        };

        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let command_line = lines.next().unwrap_or_default();
        let command = Command::parse(command_line).ok_or_else(|| {
            RealtimeError::Protocol(format!("Unknown STOMP command '{}'", command_line))
        })?;

        let unescape = command.escapes_headers();
        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (k, v) = line.split_once(':').ok_or_else(|| {
                RealtimeError::Protocol(format!("Malformed STOMP header line '{}'", line))
            })?;
            if unescape {
                headers.push((unescape_header(k)?, unescape_header(v)?));
            } else {
                headers.push((k.to_string(), v.to_string()));
            }
        }

        let mut frame = StompFrame {
            command,
            headers,
            body: String::new(),
        };
        frame.body = match frame
            .get_header("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            Some(len) if len <= body.len() && body.is_char_boundary(len) => body[..len].to_string(),
            _ => body.to_string(),
        };
        Ok(frame)
    }
}

/// Splits a WebSocket text payload into heart-beats and frames.
///
/// A single payload may carry several NUL-terminated frames. Each entry is
/// decoded independently so one malformed frame does not hide the others.
pub fn decode_stream(text: &str) -> Vec<Result<Inbound>> {
    let mut out = Vec::new();
    for segment in text.split('\0') {
        let trimmed = segment.trim_start_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if !segment.is_empty() {
                out.push(Ok(Inbound::Heartbeat));
            }
            continue;
        }
        out.push(StompFrame::decode(trimmed).map(Inbound::Frame));
    }
    out
}

/// The single EOL sent as an outgoing heart-beat.
pub const HEARTBEAT_PULSE: &str = "\n";

/// Result of heart-beat negotiation, per STOMP 1.2 section "Heart-beating".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub outgoing: Option<Duration>,
    pub incoming: Option<Duration>,
}

impl Heartbeat {
    /// How long the reader may go without any inbound traffic before the
    /// session is considered dead.
    pub fn incoming_deadline(&self) -> Option<Duration> {
        self.incoming.map(|d| d * 2)
    }
}

/// Combines the client's `heart-beat:cx,cy` with the server's `heart-beat`
/// header from CONNECTED.
pub fn negotiate_heartbeat(client: (u64, u64), server_header: Option<&str>) -> Heartbeat {
    let (sx, sy) = server_header
        .and_then(|h| {
            let (a, b) = h.split_once(',')?;
            Some((a.trim().parse::<u64>().ok()?, b.trim().parse::<u64>().ok()?))
        })
        .unwrap_or((0, 0));
    let (cx, cy) = client;

    let pick = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };

    Heartbeat {
        outgoing: pick(cx, sy),
        incoming: pick(cy, sx),
    }
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(RealtimeError::Protocol(format!(
                    "Undefined header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_frame_encoding() {
        let extra = vec![
            ("Authorization".to_string(), "Bearer abc".to_string()),
            ("userId".to_string(), "7".to_string()),
        ];
        let encoded = StompFrame::connect("api.example.com", (4000, 4000), &extra).encode();
        assert_eq!(
            encoded,
            "CONNECT\naccept-version:1.2,1.1,1.0\nhost:api.example.com\nheart-beat:4000,4000\nAuthorization:Bearer abc\nuserId:7\n\n\0"
        );
    }

    #[test]
    fn test_send_frame_has_content_length() {
        let encoded = StompFrame::send_json("/app/location_update", "{\"a\":1}".to_string()).encode();
        assert!(encoded.starts_with("SEND\ndestination:/app/location_update\n"));
        assert!(encoded.contains("content-length:7\n"));
        assert!(encoded.ends_with("\n\n{\"a\":1}\0"));
    }

    #[test]
    fn test_decode_message_with_escaped_headers() {
        let raw = "MESSAGE\ndestination:/topic/a\\cb\nsubscription:sub-1\nmessage-id:9\n\n{\"orderId\":500}\0";
        let frame = StompFrame::decode(raw).unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get_header("destination"), Some("/topic/a:b"));
        assert_eq!(frame.get_header("subscription"), Some("sub-1"));
        assert_eq!(frame.body, "{\"orderId\":500}");
    }

    #[test]
    fn test_encode_escapes_subscribe_headers() {
        let encoded = StompFrame::subscribe("sub-1", "/topic/a:b").encode();
        assert!(encoded.contains("destination:/topic/a\\cb\n"));
        let decoded = StompFrame::decode(&encoded).unwrap();
        assert_eq!(decoded.get_header("destination"), Some("/topic/a:b"));
    }

    #[test]
    fn test_decode_respects_content_length() {
        let raw = "MESSAGE\ndestination:/t\ncontent-length:2\n\nhi-trailing\0";
        let frame = StompFrame::decode(raw).unwrap();
        assert_eq!(frame.body, "hi");
    }

    #[test]
    fn test_decode_connected_with_crlf() {
        let raw = "CONNECTED\r\nversion:1.2\r\nheart-beat:0,0\r\n\r\n\0";
        let frame = StompFrame::decode(raw).unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.get_header("version"), Some("1.2"));
    }

    #[test]
    fn test_decode_rejects_unknown_command_and_bad_escape() {
        assert!(matches!(
            StompFrame::decode("HELLO\n\n\0"),
            Err(RealtimeError::Protocol(_))
        ));
        assert!(matches!(
            StompFrame::decode("MESSAGE\ndestination:/t\\x\n\n\0"),
            Err(RealtimeError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_stream_mixed_payload() {
        let text = "\nMESSAGE\ndestination:/a\n\nx\0\nRECEIPT\nreceipt-id:1\n\n\0";
        let items: Vec<Inbound> = decode_stream(text)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Inbound::Frame(f) if f.command == Command::Message));
        assert!(matches!(&items[1], Inbound::Frame(f) if f.command == Command::Receipt));

        let pulse = decode_stream("\n");
        assert_eq!(pulse.len(), 1);
        assert!(matches!(pulse[0], Ok(Inbound::Heartbeat)));
    }

    #[test]
    fn test_heartbeat_negotiation() {
        let hb = negotiate_heartbeat((4000, 4000), Some("10000,2000"));
        assert_eq!(hb.outgoing, Some(Duration::from_millis(4000)));
        assert_eq!(hb.incoming, Some(Duration::from_millis(10000)));
        assert_eq!(hb.incoming_deadline(), Some(Duration::from_millis(20000)));

        let off = negotiate_heartbeat((4000, 4000), Some("0,0"));
        assert_eq!(off, Heartbeat::default());

        let missing = negotiate_heartbeat((4000, 4000), None);
        assert_eq!(missing.incoming_deadline(), None);
    }
}
