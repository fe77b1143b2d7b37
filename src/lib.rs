//! Scope-gated MCP Tool Server
//!
//! This crate provides an MCP server whose tools are protected by OAuth-style
//! scopes. It provides:
//!
//! - A scope and role catalog with namespace wildcards (`tools:*`)
//! - Bearer token validation into a [`Credential`]
//! - A pure authorization guard deciding allow/deny per tool call
//! - A tool registry and JSON-RPC dispatcher shared by the stdio and HTTP transports
//! - Fire-and-forget usage analytics and a deployment probe
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                MCP client (IDE, agent, curl)                     │
//! └──────────────┬──────────────────────────────┬───────────────────┘
//!                │ JSON-RPC over stdio          │ JSON-RPC over HTTP
//!                ▼                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        legendary-mcp                             │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐   │
//! │  │ Token      │ │ Dispatcher │ │ Auth       │ │ Tool       │   │
//! │  │ Validator  │→│            │→│ Guard      │→│ Registry   │   │
//! │  └────────────┘ └────────────┘ └────────────┘ └────────────┘   │
//! │                        ▲                            │           │
//! │                 ┌────────────┐               ┌────────────┐     │
//! │                 │ Scope/Role │               │ Analytics  │     │
//! │                 │ Catalog    │               │ Sink       │     │
//! │                 └────────────┘               └────────────┘     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # MCP Tools
//!
//! | Tool | Requires |
//! |------|----------|
//! | `health_check` | nothing |
//! | `ping` | `tools:basic` |
//! | `diagnostics` | `tools:ping` |
//! | `whoami` | any valid credential |
//! | `generate_code` | `tools:generation` |
//! | `orchestrate_agents` | `legendary:orchestrator` |
//! | `cloud_agent` | `legendary:cloud_agent` |
//! | `self_heal` | `legendary:healing` |
//! | `generate_architecture` | `legendary:architect` |
//! | `server_status` | `admin:full` |

pub mod analytics;
pub mod catalog;
pub mod config;
pub mod credential;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod guard;
#[cfg(feature = "http")]
pub mod http;
pub mod probe;
pub mod protocol;
pub mod server;
pub mod tools;

pub use catalog::AccessCatalog;
pub use config::ServerConfig;
pub use credential::{Credential, DevTokenIssuer, TokenValidator};
pub use dispatcher::{Dispatched, Dispatcher, Outcome};
pub use error::{Error, Result};
pub use guard::{authorize, AuthorizationDecision, DenyReason, ScopeRequirement};
pub use protocol::{McpRequest, McpResponse};
pub use server::McpServer;
pub use tools::ToolRegistry;
