//! Frame codec — newline-delimited JSON-RPC 2.0 framing.
//!
//! Every frame is a single compact JSON object terminated by `\n`. This is
//! the wire format MCP uses over stdio on both the upstream channel and
//! every backend's child process pipes, so the same reader/writer pair
//! drives both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// A single JSON-RPC 2.0 frame read off the wire.
///
/// `id` is `None` for notifications. Request vs. response is distinguished
/// by which of `method`/`result`/`error` is present; callers match on that
/// directly rather than via a frame "kind" enum, since a raw `Value` is
/// already the natural representation for payloads this gateway mostly
/// relays verbatim.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Frame {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrameError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Frame {
    pub fn request(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Frame {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Frame {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn result(id: Value, result: Value) -> Self {
        Frame {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response. `id` is the request id this responds to, or
    /// `None` when the id of the originating request could not be read (a
    /// parse error); in that case the wire frame still carries an explicit
    /// `"id":null` member per JSON-RPC 2.0, not an omitted `id` key.
    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Frame {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.unwrap_or(Value::Null)),
            method: None,
            params: None,
            result: None,
            error: Some(FrameError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }
}

/// Outcome of reading one frame from a byte stream.
pub enum ReadOutcome {
    Frame(Frame),
    /// The stream reached EOF before any (or between) frames.
    Eof,
    /// A line was not valid JSON, or lacked `"jsonrpc": "2.0"`.
    ///
    /// Carries the raw line so the caller can decide whether to report a
    /// -32700/-32600 error upstream or silently drop it (a misbehaving
    /// backend's stray stdout output must not kill the session).
    ParseError { code: i64, raw: String },
}

/// Read one newline-delimited JSON-RPC frame from `reader`.
///
/// Blank lines are skipped. Does not close the stream on a malformed line;
/// the caller decides what to do with `ReadOutcome::ParseError`.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<ReadOutcome> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                return Ok(ReadOutcome::ParseError {
                    code: PARSE_ERROR,
                    raw: trimmed.to_string(),
                });
            }
        };
        if value.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Ok(ReadOutcome::ParseError {
                code: INVALID_REQUEST,
                raw: trimmed.to_string(),
            });
        }
        match serde_json::from_value::<Frame>(value) {
            Ok(frame) => return Ok(ReadOutcome::Frame(frame)),
            Err(_) => {
                return Ok(ReadOutcome::ParseError {
                    code: INVALID_REQUEST,
                    raw: trimmed.to_string(),
                });
            }
        }
    }
}

/// Write one frame, serialized compactly, newline-terminated, and flushed.
///
/// Flushing after every frame is mandatory: MCP clients read line-by-line
/// and a buffered-but-unflushed frame simply never arrives.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    let mut line = serde_json::to_string(frame).map_err(std::io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_request_frame() {
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\",\"params\":{}}\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        match read_frame(&mut reader).await.unwrap() {
            ReadOutcome::Frame(frame) => {
                assert!(frame.is_request());
                assert_eq!(frame.method.as_deref(), Some("ping"));
            }
            _ => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn test_read_notification_frame() {
        let input = b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        match read_frame(&mut reader).await.unwrap() {
            ReadOutcome::Frame(frame) => assert!(frame.is_notification()),
            _ => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn test_read_response_frame() {
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        match read_frame(&mut reader).await.unwrap() {
            ReadOutcome::Frame(frame) => assert!(frame.is_response()),
            _ => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn test_eof_returns_eof() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        assert!(matches!(
            read_frame(&mut reader).await.unwrap(),
            ReadOutcome::Eof
        ));
    }

    #[tokio::test]
    async fn test_invalid_json_is_parse_error_not_fatal() {
        let input = b"not json at all\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        match read_frame(&mut reader).await.unwrap() {
            ReadOutcome::ParseError { code, .. } => assert_eq!(code, PARSE_ERROR),
            _ => panic!("expected a parse error"),
        }
        // the stream is not torn down; the next read recovers the following frame.
        match read_frame(&mut reader).await.unwrap() {
            ReadOutcome::Frame(frame) => assert!(frame.is_request()),
            _ => panic!("expected a frame after the bad line"),
        }
    }

    #[tokio::test]
    async fn test_missing_jsonrpc_field_is_invalid_request() {
        let input = b"{\"id\":1,\"method\":\"ping\"}\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        match read_frame(&mut reader).await.unwrap() {
            ReadOutcome::ParseError { code, .. } => assert_eq!(code, INVALID_REQUEST),
            _ => panic!("expected a parse error"),
        }
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let input = b"\n\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        match read_frame(&mut reader).await.unwrap() {
            ReadOutcome::Frame(frame) => assert!(frame.is_request()),
            _ => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn test_write_frame_is_newline_terminated_and_flushed() {
        let mut buf: Vec<u8> = Vec::new();
        let frame = Frame::result(Value::from(1), serde_json::json!({"ok": true}));
        write_frame(&mut buf, &frame).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        let parsed: Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed["id"], 1);
    }

    #[tokio::test]
    async fn test_round_trip_request() {
        let mut buf: Vec<u8> = Vec::new();
        let frame = Frame::request(Value::from(42), "tools/call", Some(serde_json::json!({})));
        write_frame(&mut buf, &frame).await.unwrap();
        let mut reader = BufReader::new(Cursor::new(buf));
        match read_frame(&mut reader).await.unwrap() {
            ReadOutcome::Frame(f) => {
                assert_eq!(f.id, Some(Value::from(42)));
                assert_eq!(f.method.as_deref(), Some("tools/call"));
            }
            _ => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_error_frame_constructor() {
        let frame = Frame::error(Some(Value::from(3)), METHOD_NOT_FOUND, "unknown method");
        let err = frame.error.unwrap();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert_eq!(err.message, "unknown method");
    }

    #[test]
    fn test_error_frame_with_no_id_serializes_id_null() {
        let frame = Frame::error(None, PARSE_ERROR, "parse error");
        let serialized = serde_json::to_value(&frame).unwrap();
        assert!(serialized.get("id").is_some());
        assert_eq!(serialized["id"], Value::Null);
    }
}
