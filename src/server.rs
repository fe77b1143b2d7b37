//! MCP server over stdio.
//!
//! One JSON-RPC message per line. The session credential comes from an
//! access token supplied at launch; its expiry is re-checked on every call.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::credential::{Credential, TokenValidator};
use crate::dispatcher::Dispatcher;
use crate::error::Result;

/// Line-delimited MCP server.
pub struct McpServer {
    dispatcher: Dispatcher,
    credential: Option<Credential>,
}

impl McpServer {
    /// Create an anonymous server: only public tools are callable.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            credential: None,
        }
    }

    /// Attach a session credential from a bearer token.
    ///
    /// An invalid token leaves the session anonymous.
    pub fn with_access_token(mut self, validator: &TokenValidator, token: Option<&str>) -> Self {
        self.credential = match token {
            Some(token) => match validator.validate(token) {
                Ok(credential) => {
                    info!(subject = %credential.subject, scopes = credential.granted_scopes.len(), "Session authenticated");
                    Some(credential)
                }
                Err(e) => {
                    warn!(error = %e, "Access token rejected, continuing unauthenticated");
                    None
                }
            },
            None => None,
        };
        self
    }

    /// Session credential, if any.
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Run the server on stdio.
    pub async fn run_stdio(&self) -> Result<()> {
        info!("Starting MCP server on stdio");
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve messages from `reader` until EOF, writing responses to `writer`.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            debug!("Received: {}", line);

            let dispatched = self.dispatcher.dispatch(line, self.credential.as_ref()).await;
            let Some(response) = dispatched.response else {
                continue;
            };
            let response_json = serde_json::to_string(&response)?;

            debug!(outcome = ?dispatched.outcome, "Sending: {}", response_json);

            writer.write_all(response_json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        info!("stdin closed, shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::NoopAnalytics;
    use crate::catalog::AccessCatalog;
    use crate::config::ServerConfig;
    use crate::credential::DevTokenIssuer;
    use crate::tools::{ToolContext, ToolRegistry};
    use chrono::TimeDelta;
    use serde_json::Value;
    use std::sync::Arc;

    const SECRET: &[u8] = b"test_secret_for_unit_testing_only";

    fn server() -> McpServer {
        let catalog = Arc::new(AccessCatalog::builtin());
        let context = ToolContext::new(ServerConfig::default(), catalog, Arc::new(NoopAnalytics));
        let registry = ToolRegistry::with_defaults(context).unwrap();
        McpServer::new(Dispatcher::new(Arc::new(registry)))
    }

    async fn exchange(server: &McpServer, input: &str) -> Vec<Value> {
        let mut output = Vec::new();
        server.run(input.as_bytes(), &mut output).await.unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_session_handshake() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#, "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#, "\n",
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#, "\n",
        );
        let responses = exchange(&server(), input).await;

        // The notification produces no line.
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert!(responses[0]["result"]["serverInfo"].is_object());
        assert_eq!(responses[1]["result"]["tools"].as_array().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_anonymous_session_is_gated() {
        let input = r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"ping"}}"#;
        let responses = exchange(&server(), input).await;
        assert_eq!(responses[0]["error"]["code"], -32001);
    }

    #[tokio::test]
    async fn test_access_token_authenticates_session() {
        let catalog = Arc::new(AccessCatalog::builtin());
        let issuer = DevTokenIssuer::new(SECRET, "https://issuer.test", catalog);
        let token = issuer
            .issue_for_role("user123", "user", TimeDelta::hours(1))
            .unwrap();
        let validator = TokenValidator::hs256(SECRET);

        let server = server().with_access_token(&validator, Some(&token));
        assert_eq!(server.credential().unwrap().subject, "user123");

        let input = r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"ping"}}"#;
        let responses = exchange(&server, input).await;
        assert!(responses[0]["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("pong"));
    }

    #[tokio::test]
    async fn test_bad_token_leaves_session_anonymous() {
        let validator = TokenValidator::hs256(SECRET);
        let server = server().with_access_token(&validator, Some("not-a-jwt"));
        assert!(server.credential().is_none());
    }

    #[tokio::test]
    async fn test_garbage_line_gets_parse_error() {
        let responses = exchange(&server(), "garbage\n").await;
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert!(responses[0]["id"].is_null());
    }
}
