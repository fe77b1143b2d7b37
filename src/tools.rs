//! Tool registry and tool handlers.
//!
//! The registry is built by explicit `register` calls at startup and is
//! read-only afterwards. Handlers are the only place with side effects; the
//! orchestration, healing and generation tools return placeholder data and
//! do not schedule anything.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::analytics::{AnalyticsSink, UsageEvent, UsageOutcome};
use crate::catalog::AccessCatalog;
use crate::config::ServerConfig;
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::guard::ScopeRequirement;
use crate::protocol::{ToolCallResult, ToolDefinition};

/// Static description of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    /// Tool name.
    pub name: String,
    /// Human description.
    pub description: String,
    /// Scopes the caller must hold.
    pub required: ScopeRequirement,
    /// JSON Schema for the arguments.
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Wire definition for `tools/list`.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            required_scopes: self.required.required_scopes().into_iter().collect(),
        }
    }
}

/// Tool trait for implementing MCP tools.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool descriptor.
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: Value, call: &ToolCall<'_>) -> Result<ToolCallResult>;
}

/// Read-only state shared by every handler.
pub struct ToolContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Scope and role catalog.
    pub catalog: Arc<AccessCatalog>,
    /// Usage event sink.
    pub analytics: Arc<dyn AnalyticsSink>,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

impl ToolContext {
    /// Create a new tool context.
    pub fn new(
        config: ServerConfig,
        catalog: Arc<AccessCatalog>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        Self {
            config,
            catalog,
            analytics,
            started_at: Instant::now(),
        }
    }

    fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Per-invocation view handed to a handler.
pub struct ToolCall<'a> {
    /// Shared context.
    pub context: &'a ToolContext,
    /// Caller credential; `None` only for public tools.
    pub credential: Option<&'a Credential>,
    /// Correlation id of this invocation.
    pub correlation_id: &'a str,
    /// Number of registered tools.
    pub registered_tools: usize,
}

impl ToolCall<'_> {
    fn subject(&self) -> Option<&str> {
        self.credential.map(|c| c.subject.as_str())
    }
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    tool: Arc<dyn Tool>,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
    context: Arc<ToolContext>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new(context: ToolContext) -> Self {
        Self {
            tools: BTreeMap::new(),
            context: Arc::new(context),
        }
    }

    /// Create a registry holding the default tools.
    pub fn with_defaults(context: ToolContext) -> Result<Self> {
        let mut registry = Self::new(context);
        registry.register(Arc::new(HealthCheckTool))?;
        registry.register(Arc::new(PingTool))?;
        registry.register(Arc::new(DiagnosticsTool))?;
        registry.register(Arc::new(WhoAmITool))?;
        registry.register(Arc::new(GenerateCodeTool))?;
        registry.register(Arc::new(OrchestrateAgentsTool))?;
        registry.register(Arc::new(CloudAgentTool))?;
        registry.register(Arc::new(SelfHealTool))?;
        registry.register(Arc::new(GenerateArchitectureTool))?;
        registry.register(Arc::new(ServerStatusTool))?;
        Ok(registry)
    }

    /// Register a tool. Names must be unique.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let descriptor = tool.descriptor();
        if self.tools.contains_key(&descriptor.name) {
            return Err(Error::DuplicateTool(descriptor.name));
        }
        self.tools
            .insert(descriptor.name.clone(), RegisteredTool { descriptor, tool });
        Ok(())
    }

    /// Look up a tool descriptor.
    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor> {
        self.tools
            .get(name)
            .map(|t| &t.descriptor)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))
    }

    /// Every tool definition, ordered by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.descriptor.definition()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Shared handler context.
    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// Check that every scope a tool demands exists in the catalog.
    pub fn validate_against(&self, catalog: &AccessCatalog) -> Result<()> {
        for registered in self.tools.values() {
            for scope in registered.descriptor.required.required_scopes() {
                if !catalog.contains_scope(&scope) {
                    return Err(Error::Catalog(format!(
                        "tool {} requires unknown scope {}",
                        registered.descriptor.name, scope
                    )));
                }
            }
        }
        Ok(())
    }

    /// Run a tool's handler and record the usage event.
    ///
    /// Authorization happens before this call. Panics and timeouts are
    /// reported as errors.
    pub async fn execute(
        &self,
        name: &str,
        arguments: Value,
        credential: Option<&Credential>,
        correlation_id: &str,
    ) -> Result<ToolCallResult> {
        let registered = self
            .tools
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        let call = ToolCall {
            context: &self.context,
            credential,
            correlation_id,
            registered_tools: self.tools.len(),
        };

        let start = Instant::now();
        let handler = AssertUnwindSafe(registered.tool.execute(arguments, &call)).catch_unwind();
        let result = match tokio::time::timeout(self.context.config.request_timeout, handler).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Internal(format!("tool {} panicked", name))),
            Err(_) => Err(Error::Timeout(format!(
                "tool {} exceeded {:?}",
                name, self.context.config.request_timeout
            ))),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(r) if r.is_error => UsageOutcome::ToolError,
            Ok(_) => UsageOutcome::Success,
            Err(e) => {
                error!(tool = %name, correlation_id, error = %e, "Tool execution failed");
                UsageOutcome::Failed
            }
        };
        info!(tool = %name, correlation_id, duration_ms, outcome = ?outcome, "Tool executed");

        self.context.analytics.track(UsageEvent {
            tool: name.to_string(),
            subject: call.subject().map(str::to_string),
            outcome,
            correlation_id: correlation_id.to_string(),
            duration_ms,
            timestamp: Utc::now(),
        });

        result
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))
}

fn empty_schema() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

// =============================================================================
// Tool Implementations
// =============================================================================

/// Public liveness check.
pub struct HealthCheckTool;

#[async_trait::async_trait]
impl Tool for HealthCheckTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "health_check".into(),
            description: "Report server health. Callable without credentials.".into(),
            required: ScopeRequirement::Public,
            input_schema: empty_schema(),
        }
    }

    async fn execute(&self, _arguments: Value, call: &ToolCall<'_>) -> Result<ToolCallResult> {
        Ok(ToolCallResult::json(&json!({
            "status": "healthy",
            "service": call.context.config.service_name,
            "version": env!("CARGO_PKG_VERSION"),
        })))
    }
}

/// Connectivity check for authenticated callers.
pub struct PingTool;

#[derive(Debug, Deserialize)]
struct PingArgs {
    #[serde(default)]
    message: Option<String>,
}

#[async_trait::async_trait]
impl Tool for PingTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "ping".into(),
            description: "Answer with pong and the request correlation id.".into(),
            required: ScopeRequirement::scopes(["tools:basic"]),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Optional text echoed back"
                    }
                },
                "required": []
            }),
        }
    }

    async fn execute(&self, arguments: Value, call: &ToolCall<'_>) -> Result<ToolCallResult> {
        let args: PingArgs = parse_args(arguments)?;
        Ok(ToolCallResult::json(&json!({
            "message": "pong",
            "echo": args.message,
            "correlation_id": call.correlation_id,
            "subject": call.subject(),
            "timestamp": Utc::now().to_rfc3339(),
        })))
    }
}

/// Server diagnostics.
pub struct DiagnosticsTool;

#[async_trait::async_trait]
impl Tool for DiagnosticsTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "diagnostics".into(),
            description: "Report version, uptime and registered tool count.".into(),
            required: ScopeRequirement::scopes(["tools:ping"]),
            input_schema: empty_schema(),
        }
    }

    async fn execute(&self, _arguments: Value, call: &ToolCall<'_>) -> Result<ToolCallResult> {
        Ok(ToolCallResult::json(&json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": call.context.uptime_secs(),
            "tools": call.registered_tools,
            "correlation_id": call.correlation_id,
        })))
    }
}

/// Describe the caller's credential.
pub struct WhoAmITool;

#[async_trait::async_trait]
impl Tool for WhoAmITool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "whoami".into(),
            description: "Return the caller's subject, issuer and granted scopes.".into(),
            required: ScopeRequirement::Authenticated,
            input_schema: empty_schema(),
        }
    }

    async fn execute(&self, _arguments: Value, call: &ToolCall<'_>) -> Result<ToolCallResult> {
        let credential = call
            .credential
            .ok_or_else(|| Error::Internal("whoami reached without a credential".into()))?;
        Ok(ToolCallResult::json(&json!({
            "subject": credential.subject,
            "issuer": credential.issuer,
            "scopes": credential.granted_scopes,
            "expires_at": credential.expires_at.to_rfc3339(),
        })))
    }
}

/// Placeholder code generation plan.
pub struct GenerateCodeTool;

#[derive(Debug, Deserialize)]
struct GenerateCodeArgs {
    description: String,
    #[serde(default = "default_language")]
    language: String,
}

fn default_language() -> String {
    "rust".into()
}

#[async_trait::async_trait]
impl Tool for GenerateCodeTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "generate_code".into(),
            description: "Produce a code generation plan for a description.".into(),
            required: ScopeRequirement::scopes(["tools:generation"]),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "description": {
                        "type": "string",
                        "description": "What to generate"
                    },
                    "language": {
                        "type": "string",
                        "description": "Target language (default: rust)"
                    }
                },
                "required": ["description"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, call: &ToolCall<'_>) -> Result<ToolCallResult> {
        let args: GenerateCodeArgs = parse_args(arguments)?;
        Ok(ToolCallResult::json(&json!({
            "status": "planned",
            "language": args.language,
            "description": args.description,
            "steps": ["analyze requirements", "scaffold modules", "write tests"],
            "correlation_id": call.correlation_id,
        })))
    }
}

/// Placeholder multi-agent plan.
pub struct OrchestrateAgentsTool;

#[derive(Debug, Deserialize)]
struct OrchestrateArgs {
    task: String,
    #[serde(default)]
    agents: Option<usize>,
}

const AGENT_ROLES: [&str; 5] = ["planner", "implementer", "reviewer", "tester", "integrator"];

#[async_trait::async_trait]
impl Tool for OrchestrateAgentsTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "orchestrate_agents".into(),
            description: "Lay out a multi-agent plan for a task.".into(),
            required: ScopeRequirement::scopes(["legendary:orchestrator"]),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "description": "Task to plan"
                    },
                    "agents": {
                        "type": "integer",
                        "description": "Requested agent count, capped by the server",
                        "minimum": 1
                    }
                },
                "required": ["task"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, call: &ToolCall<'_>) -> Result<ToolCallResult> {
        let args: OrchestrateArgs = parse_args(arguments)?;
        let max_agents = call.context.config.max_agents;
        let agents = args.agents.unwrap_or(3).clamp(1, max_agents);

        let plan: Vec<Value> = (0..agents)
            .map(|i| {
                json!({
                    "agent": format!("agent-{}", i + 1),
                    "role": AGENT_ROLES[i % AGENT_ROLES.len()],
                })
            })
            .collect();

        Ok(ToolCallResult::json(&json!({
            "status": "simulated",
            "task": args.task,
            "agents": agents,
            "max_agents": max_agents,
            "plan": plan,
            "correlation_id": call.correlation_id,
        })))
    }
}

/// Placeholder cloud agent session.
pub struct CloudAgentTool;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CloudAction {
    Start,
    Status,
}

#[derive(Debug, Deserialize)]
struct CloudAgentArgs {
    action: CloudAction,
    #[serde(default)]
    session_id: Option<String>,
}

#[async_trait::async_trait]
impl Tool for CloudAgentTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "cloud_agent".into(),
            description: "Start or inspect a cloud agent session.".into(),
            required: ScopeRequirement::scopes(["legendary:cloud_agent"]),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["start", "status"]
                    },
                    "session_id": {
                        "type": "string",
                        "description": "Session to inspect (status only)"
                    }
                },
                "required": ["action"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, call: &ToolCall<'_>) -> Result<ToolCallResult> {
        let args: CloudAgentArgs = parse_args(arguments)?;
        let mut body = match args.action {
            CloudAction::Start => json!({
                "session_id": Uuid::new_v4().to_string(),
                "state": "provisioned",
                "status": "simulated",
            }),
            CloudAction::Status => {
                let session_id = args.session_id.ok_or_else(|| {
                    Error::InvalidParams("session_id is required for status".into())
                })?;
                json!({
                    "session_id": session_id,
                    "state": "idle",
                    "status": "simulated",
                })
            }
        };
        body["correlation_id"] = json!(call.correlation_id);
        Ok(ToolCallResult::json(&body))
    }
}

/// Placeholder self-healing diagnosis.
pub struct SelfHealTool;

#[derive(Debug, Deserialize)]
struct SelfHealArgs {
    target: String,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait::async_trait]
impl Tool for SelfHealTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "self_heal".into(),
            description: "Diagnose a failing component and propose remediation.".into(),
            required: ScopeRequirement::scopes(["legendary:healing"]),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "target": {
                        "type": "string",
                        "description": "Component to diagnose"
                    },
                    "error": {
                        "type": "string",
                        "description": "Observed error message"
                    }
                },
                "required": ["target"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, call: &ToolCall<'_>) -> Result<ToolCallResult> {
        let args: SelfHealArgs = parse_args(arguments)?;
        if !call.context.config.features.healing_enabled {
            return Ok(ToolCallResult::tool_error("self-healing is disabled on this server"));
        }
        Ok(ToolCallResult::json(&json!({
            "status": "simulated",
            "target": args.target,
            "observed_error": args.error,
            "diagnosis": "no automated diagnosis available",
            "actions": ["collect logs", "restart component", "verify health"],
            "correlation_id": call.correlation_id,
        })))
    }
}

/// Placeholder architecture outline.
pub struct GenerateArchitectureTool;

#[derive(Debug, Deserialize)]
struct ArchitectureArgs {
    system: String,
    #[serde(default = "default_style")]
    style: String,
}

fn default_style() -> String {
    "modular-monolith".into()
}

#[async_trait::async_trait]
impl Tool for GenerateArchitectureTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "generate_architecture".into(),
            description: "Outline an architecture for a system description.".into(),
            required: ScopeRequirement::scopes(["legendary:architect"]),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "system": {
                        "type": "string",
                        "description": "System to design"
                    },
                    "style": {
                        "type": "string",
                        "description": "Architectural style (default: modular-monolith)"
                    }
                },
                "required": ["system"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, call: &ToolCall<'_>) -> Result<ToolCallResult> {
        let args: ArchitectureArgs = parse_args(arguments)?;
        Ok(ToolCallResult::json(&json!({
            "status": "simulated",
            "system": args.system,
            "style": args.style,
            "components": [
                { "name": "api", "responsibility": "request handling" },
                { "name": "domain", "responsibility": "business rules" },
                { "name": "storage", "responsibility": "persistence" },
            ],
            "correlation_id": call.correlation_id,
        })))
    }
}

/// Administrative view of the running server.
pub struct ServerStatusTool;

#[async_trait::async_trait]
impl Tool for ServerStatusTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "server_status".into(),
            description: "Report feature flags, limits and catalog size.".into(),
            required: ScopeRequirement::scopes(["admin:full"]),
            input_schema: empty_schema(),
        }
    }

    async fn execute(&self, _arguments: Value, call: &ToolCall<'_>) -> Result<ToolCallResult> {
        let ctx = call.context;
        Ok(ToolCallResult::json(&json!({
            "service": ctx.config.service_name,
            "issuer_project_id": ctx.config.issuer_project_id,
            "features": ctx.config.features,
            "analytics_active": ctx.config.analytics_active(),
            "max_agents": ctx.config.max_agents,
            "request_timeout_secs": ctx.config.request_timeout.as_secs(),
            "tools": call.registered_tools,
            "scopes": ctx.catalog.scopes().count(),
            "roles": ctx.catalog.roles().count(),
            "uptime_secs": ctx.uptime_secs(),
        })))
    }
}
