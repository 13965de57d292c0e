//! Gateway dispatcher — the upstream-facing MCP server role.
//!
//! Implements the MCP server role directly over the frame codec rather than
//! through an SDK's `ServerHandler`-style trait, since request framing and
//! correlation is the part of this gateway that actually needs owning.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::codec::{self, Frame, ReadOutcome};
use crate::error::GatewayError;
use crate::registry::GatewayRegistry;
use crate::security::SecurityMonitor;

const PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "gatemux";

/// Owns the upstream connection and routes `tools/call` onto the registry
/// and security monitor.
pub struct GatewayDispatcher {
    registry: Arc<GatewayRegistry>,
    security: Arc<SecurityMonitor>,
}

impl GatewayDispatcher {
    pub fn new(registry: Arc<GatewayRegistry>, security: Arc<SecurityMonitor>) -> Self {
        GatewayDispatcher { registry, security }
    }

    /// Drive the upstream connection until EOF. Each request that requires
    /// backend work runs on its own task; upstream writes are serialized by
    /// a mutex so responses never interleave at the byte level.
    ///
    /// Every in-flight request's task is tracked by its upstream id in
    /// `in_flight`, so a `notifications/cancelled` naming that id can abort
    /// the task directly instead of merely logging.
    pub async fn run<R, W>(&self, mut reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let mut tasks = tokio::task::JoinSet::new();
        let in_flight: Arc<Mutex<HashMap<String, AbortHandle>>> = Arc::new(Mutex::new(HashMap::new()));

        loop {
            match codec::read_frame(&mut reader).await? {
                ReadOutcome::Eof => break,
                ReadOutcome::ParseError { code, raw } => {
                    tracing::debug!(line = %raw, code, "discarding malformed upstream line");
                    let response = Frame::error(None, code, "parse error");
                    write_locked(&writer, &response).await?;
                }
                ReadOutcome::Frame(frame) => {
                    if frame.is_notification() {
                        self.handle_notification(&frame, &in_flight).await;
                        continue;
                    }
                    let registry = self.registry.clone();
                    let security = self.security.clone();
                    let writer = writer.clone();
                    let frame_clone = frame.clone();
                    let id_key = frame.id.as_ref().map(id_key);
                    let in_flight_for_task = in_flight.clone();
                    let id_key_for_task = id_key.clone();
                    let abort_handle = tasks.spawn(async move {
                        let response = handle_request(&registry, &security, frame_clone).await;
                        if let Some(key) = &id_key_for_task {
                            in_flight_for_task.lock().await.remove(key);
                        }
                        if let Some(response) = response {
                            let mut guard = writer.lock().await;
                            let _ = codec::write_frame(&mut *guard, &response).await;
                        }
                    });
                    if let Some(key) = id_key {
                        in_flight.lock().await.insert(key, abort_handle);
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle_notification(&self, frame: &Frame, in_flight: &Arc<Mutex<HashMap<String, AbortHandle>>>) {
        match frame.method.as_deref() {
            Some("notifications/initialized") => {
                tracing::debug!("upstream client initialized");
            }
            Some("notifications/cancelled") => {
                let target = frame
                    .params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .map(id_key);
                match target {
                    Some(key) => match in_flight.lock().await.remove(&key) {
                        Some(handle) => {
                            handle.abort();
                            tracing::debug!(request_id = %key, "aborted in-flight request on cancellation");
                        }
                        None => {
                            tracing::debug!(request_id = %key, "cancellation for unknown or already-completed request");
                        }
                    },
                    None => tracing::debug!("cancellation notice missing requestId"),
                }
            }
            Some(other) => tracing::debug!(method = %other, "unhandled upstream notification"),
            None => {}
        }
    }
}

/// Canonicalize a JSON-RPC id into a hashable map key. `Value` itself isn't
/// `Hash` (it can hold floats), so ids are tracked by their serialized form.
fn id_key(id: &Value) -> String {
    serde_json::to_string(id).unwrap_or_default()
}

async fn write_locked<W: AsyncWrite + Unpin>(
    writer: &Arc<Mutex<W>>,
    frame: &Frame,
) -> std::io::Result<()> {
    let mut guard = writer.lock().await;
    codec::write_frame(&mut *guard, frame).await
}

async fn handle_request(
    registry: &Arc<GatewayRegistry>,
    security: &Arc<SecurityMonitor>,
    frame: Frame,
) -> Option<Frame> {
    let id = frame.id.clone()?;
    let method = frame.method.clone().unwrap_or_default();

    let response = match method.as_str() {
        "initialize" => Frame::result(id.clone(), initialize_result()),
        "tools/list" => Frame::result(id.clone(), tools_list_result()),
        "ping" => Frame::result(id.clone(), json!({})),
        "tools/call" => handle_tools_call(registry, security, id.clone(), frame.params).await,
        _ => Frame::error(Some(id.clone()), codec::METHOD_NOT_FOUND, format!("unknown method '{}'", method)),
    };
    Some(response)
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
        "capabilities": { "tools": {} },
    })
}

fn tools_list_result() -> Value {
    json!({
        "tools": [
            {
                "name": "use_tool",
                "description": "Call a tool on a named backend MCP server.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "backend_server": { "type": "string" },
                        "server_tool": { "type": "string" },
                        "tool_arguments": { "type": "object" },
                    },
                    "required": ["backend_server", "server_tool", "tool_arguments"],
                    "additionalProperties": false,
                },
            },
            {
                "name": "discover_backend_tools",
                "description": "List the tools exposed by one backend, or all backends if none is named.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "backend_name": { "type": "string" },
                    },
                    "additionalProperties": false,
                },
            },
            {
                "name": "security_status",
                "description": "Return the current session's security trace and taint state.",
                "inputSchema": {
                    "type": "object",
                    "properties": {},
                    "additionalProperties": false,
                },
            },
        ]
    })
}

fn tool_result(text: impl Into<String>, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text.into() }],
        "isError": is_error,
    })
}

async fn handle_tools_call(
    registry: &Arc<GatewayRegistry>,
    security: &Arc<SecurityMonitor>,
    id: Value,
    params: Option<Value>,
) -> Frame {
    let params = match params {
        Some(p) => p,
        None => return Frame::error(Some(id), codec::INVALID_PARAMS, "missing params"),
    };
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    match name {
        "use_tool" => Frame::result(id, use_tool(registry, security, &arguments).await),
        "discover_backend_tools" => {
            Frame::result(id, discover_backend_tools(registry, &arguments).await)
        }
        "security_status" => Frame::result(id, security_status(security).await),
        other => Frame::error(
            Some(id),
            codec::INVALID_PARAMS,
            format!("unknown meta-tool '{}'", other),
        ),
    }
}

async fn use_tool(registry: &Arc<GatewayRegistry>, security: &Arc<SecurityMonitor>, arguments: &Value) -> Value {
    let backend_server = match arguments.get("backend_server").and_then(Value::as_str) {
        Some(s) => s,
        None => return tool_result("missing required argument 'backend_server'", true),
    };
    let server_tool = match arguments.get("server_tool").and_then(Value::as_str) {
        Some(s) => s,
        None => return tool_result("missing required argument 'server_tool'", true),
    };
    let tool_arguments = arguments.get("tool_arguments").cloned().unwrap_or(json!({}));

    if let Err(denial) = security.check(backend_server, server_tool, &tool_arguments).await {
        return tool_result(GatewayError::SecurityDenied(denial.reason).to_string(), true);
    }

    let session = match registry.get(backend_server).await {
        Ok(session) => session,
        Err(e) => return tool_result(e.to_string(), true),
    };

    let timeout = session.config_snapshot().timeout();
    let call_params = json!({ "name": server_tool, "arguments": tool_arguments });
    match session.call("tools/call", Some(call_params), timeout).await {
        Ok(result) => result,
        Err(e) => tool_result(format!("backend call failed: {}", e), true),
    }
}

async fn discover_backend_tools(registry: &Arc<GatewayRegistry>, arguments: &Value) -> Value {
    let requested = arguments.get("backend_name").and_then(Value::as_str);

    // A single named backend returns its tools/list result directly, with
    // no enclosing per-backend map.
    if let Some(single) = requested {
        return match registry.get(single).await {
            Ok(session) => match session.tools_list().await {
                Ok(tools) => tool_result(serde_json::to_string_pretty(&tools).unwrap_or_default(), false),
                Err(e) => tool_result(e.to_string(), true),
            },
            Err(e) => tool_result(e.to_string(), true),
        };
    }

    // No backend named: fan out to every configured backend concurrently,
    // so N slow backends cost one round of latency rather than N.
    let names = registry.backend_names().await;
    let entries = futures::future::join_all(names.into_iter().map(|name| {
        let registry = registry.clone();
        async move {
            let value = match registry.get(&name).await {
                Ok(session) => {
                    let description = session.config_snapshot().description;
                    match session.tools_list().await {
                        Ok(tools) => json!({ "description": description, "tools": tools }),
                        Err(e) => json!({ "description": description, "error": e.to_string() }),
                    }
                }
                Err(e) => json!({ "error": e.to_string() }),
            };
            (name, value)
        }
    }))
    .await;

    let aggregated: HashMap<String, Value> = entries.into_iter().collect();
    tool_result(
        serde_json::to_string_pretty(&aggregated).unwrap_or_default(),
        false,
    )
}

async fn security_status(security: &Arc<SecurityMonitor>) -> Value {
    let status = security.status().await;
    tool_result(serde_json::to_string_pretty(&status).unwrap_or_default(), false)
}
