//! Request dispatcher.
//!
//! Each inbound message moves through parse, resolve, authorize and execute
//! and ends in exactly one [`Outcome`]. Discovery methods never consult the
//! guard; `tools/call` always does, after the tool has been resolved and
//! before its handler runs.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::credential::Credential;
use crate::error::Error;
use crate::guard::{authorize_requirement, DenyReason};
use crate::protocol::{
    error_codes, McpRequest, McpResponse, ServerCapabilities, ServerInfo, PROTOCOL_VERSION,
};
use crate::tools::ToolRegistry;

/// Methods answered without authorization.
pub const DISCOVERY_METHODS: &[&str] = &[
    "initialize",
    "tools/list",
    "resources/list",
    "prompts/list",
    "ping",
];

/// Terminal state of a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Success response.
    Completed,
    /// Notification acknowledged; nothing is sent back.
    Notification,
    /// Malformed envelope.
    ProtocolError,
    /// Envelope was fine but the parameters were not.
    InvalidParams,
    /// Unknown method or tool.
    MethodNotFound,
    /// Guard denied the call.
    Unauthorized(DenyReason),
    /// Handler failed, panicked or timed out.
    HandlerError,
}

impl Outcome {
    /// HTTP status for this outcome.
    pub fn http_status(&self) -> u16 {
        match self {
            Outcome::Completed | Outcome::InvalidParams | Outcome::MethodNotFound => 200,
            Outcome::Notification => 202,
            Outcome::ProtocolError => 400,
            Outcome::Unauthorized(DenyReason::MissingScopes) => 403,
            Outcome::Unauthorized(_) => 401,
            Outcome::HandlerError => 500,
        }
    }
}

/// A response paired with how the request ended.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// Response to send, if any.
    pub response: Option<McpResponse>,
    /// Terminal state.
    pub outcome: Outcome,
}

impl Dispatched {
    fn respond(outcome: Outcome, response: McpResponse) -> Self {
        Self {
            response: Some(response),
            outcome,
        }
    }
}

/// Routes MCP requests to the tool registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    server_info: ServerInfo,
}

impl Dispatcher {
    /// Create a dispatcher over a registry.
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        let server_info = ServerInfo::named(registry.context().config.service_name.clone());
        Self {
            registry,
            server_info,
        }
    }

    /// The registry requests are routed to.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Server name and version.
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Dispatch a raw JSON message.
    pub async fn dispatch(&self, raw: &str, credential: Option<&Credential>) -> Dispatched {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.dispatch_value(value, credential).await,
            Err(e) => {
                warn!(error = %e, "Failed to parse request");
                Dispatched::respond(
                    Outcome::ProtocolError,
                    McpResponse::error(None, error_codes::PARSE_ERROR, format!("parse error: {}", e)),
                )
            }
        }
    }

    /// Dispatch an already parsed JSON value.
    pub async fn dispatch_value(&self, value: Value, credential: Option<&Credential>) -> Dispatched {
        let id = value.get("id").cloned();
        let request: McpRequest = match serde_json::from_value(value) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "Invalid request envelope");
                return Dispatched::respond(
                    Outcome::ProtocolError,
                    McpResponse::error(id, error_codes::INVALID_REQUEST, format!("invalid request: {}", e)),
                );
            }
        };
        self.dispatch_request(request, credential).await
    }

    /// Dispatch a typed request.
    pub async fn dispatch_request(
        &self,
        request: McpRequest,
        credential: Option<&Credential>,
    ) -> Dispatched {
        if request.jsonrpc != "2.0" {
            return Dispatched::respond(
                Outcome::ProtocolError,
                McpResponse::error(
                    request.id,
                    error_codes::INVALID_REQUEST,
                    format!("unsupported jsonrpc version: {}", request.jsonrpc),
                ),
            );
        }

        debug!(method = %request.method, "Dispatching request");

        if request.is_notification() {
            info!(method = %request.method, "Notification received");
            return Dispatched {
                response: None,
                outcome: Outcome::Notification,
            };
        }

        let id = request.id.clone();
        match request.method.as_str() {
            // Sent with an id, a notification method still gets an answer.
            method if method.starts_with("notifications/") => {
                Dispatched::respond(Outcome::Completed, McpResponse::success(id, json!({})))
            }
            "initialize" => {
                info!("Initializing MCP session");
                Dispatched::respond(Outcome::Completed, McpResponse::success(id, self.initialize_result()))
            }
            "tools/list" => Dispatched::respond(
                Outcome::Completed,
                McpResponse::success(id, json!({ "tools": self.registry.definitions() })),
            ),
            "resources/list" => Dispatched::respond(
                Outcome::Completed,
                McpResponse::success(id, json!({ "resources": [] })),
            ),
            "prompts/list" => Dispatched::respond(
                Outcome::Completed,
                McpResponse::success(id, json!({ "prompts": [] })),
            ),
            "ping" => Dispatched::respond(Outcome::Completed, McpResponse::success(id, json!({}))),
            "tools/call" => self.handle_tools_call(request, credential).await,
            other => Dispatched::respond(
                Outcome::MethodNotFound,
                McpResponse::error(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("unknown method: {}", other),
                ),
            ),
        }
    }

    /// Result body of `initialize`.
    pub fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": ServerCapabilities::advertised(),
            "serverInfo": self.server_info,
        })
    }

    /// Capabilities and tool list, as served to authenticated callers.
    pub fn capabilities(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": ServerCapabilities::advertised(),
            "serverInfo": self.server_info,
            "tools": self.registry.definitions(),
        })
    }

    async fn handle_tools_call(
        &self,
        request: McpRequest,
        credential: Option<&Credential>,
    ) -> Dispatched {
        let id = request.id;
        let name = match request.params.get("name").and_then(Value::as_str) {
            Some(n) => n.to_string(),
            None => {
                return Dispatched::respond(
                    Outcome::InvalidParams,
                    McpResponse::error(id, error_codes::INVALID_PARAMS, "missing tool name"),
                );
            }
        };
        let descriptor = match self.registry.resolve(&name) {
            Ok(d) => d,
            Err(_) => {
                return Dispatched::respond(
                    Outcome::MethodNotFound,
                    McpResponse::error(
                        id,
                        error_codes::METHOD_NOT_FOUND,
                        format!("unknown tool: {}", name),
                    ),
                );
            }
        };

        let decision = authorize_requirement(credential, &descriptor.required);
        if !decision.is_allowed() {
            let reason = decision.reason.unwrap_or(DenyReason::Unauthenticated);
            warn!(
                tool = %name,
                subject = decision.subject.as_deref().unwrap_or("-"),
                reason = %reason,
                missing = ?decision.missing_scopes,
                "Tool call denied"
            );
            let code = match reason {
                DenyReason::MissingScopes => error_codes::FORBIDDEN,
                DenyReason::Unauthenticated | DenyReason::Expired => error_codes::UNAUTHORIZED,
            };
            return Dispatched::respond(
                Outcome::Unauthorized(reason),
                McpResponse::error_with_data(
                    id,
                    code,
                    decision.message(),
                    Some(json!({
                        "reason": reason,
                        "missing_scopes": decision.missing_scopes,
                    })),
                ),
            );
        }

        let arguments = match request.params.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(args @ Value::Object(_)) => args.clone(),
            Some(_) => {
                return Dispatched::respond(
                    Outcome::InvalidParams,
                    McpResponse::error(id, error_codes::INVALID_PARAMS, "arguments must be an object"),
                );
            }
        };

        let correlation_id = Uuid::new_v4().to_string();
        info!(
            tool = %name,
            subject = decision.subject.as_deref().unwrap_or("-"),
            correlation_id = %correlation_id,
            token_id = credential.map(|c| c.correlation_id.as_str()).unwrap_or("-"),
            "Calling tool"
        );

        match self
            .registry
            .execute(&name, arguments, credential, &correlation_id)
            .await
        {
            Ok(result) => match serde_json::to_value(result) {
                Ok(value) => Dispatched::respond(Outcome::Completed, McpResponse::success(id, value)),
                Err(e) => self.handler_error(id, &name, &correlation_id, Error::from(e)),
            },
            Err(Error::InvalidParams(message)) => Dispatched::respond(
                Outcome::InvalidParams,
                McpResponse::error(id, error_codes::INVALID_PARAMS, message),
            ),
            Err(e) => self.handler_error(id, &name, &correlation_id, e),
        }
    }

    fn handler_error(
        &self,
        id: Option<Value>,
        tool: &str,
        correlation_id: &str,
        err: Error,
    ) -> Dispatched {
        error!(tool = %tool, correlation_id, error = %err, "Tool handler error");
        Dispatched::respond(
            Outcome::HandlerError,
            McpResponse::error_with_data(
                id,
                error_codes::INTERNAL_ERROR,
                "internal error",
                Some(json!({ "correlation_id": correlation_id })),
            ),
        )
    }
}
