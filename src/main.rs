//! legendary-mcp - Scope-gated MCP tool server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use url::Url;

use legendary_mcp::analytics::sink_from_config;
use legendary_mcp::config::SigningKey;
use legendary_mcp::probe::Probe;
use legendary_mcp::tools::ToolContext;
use legendary_mcp::{
    AccessCatalog, DevTokenIssuer, Dispatcher, McpServer, ServerConfig, TokenValidator,
    ToolRegistry,
};

/// legendary-mcp - MCP tools gated by OAuth scopes.
#[derive(Parser, Debug)]
#[command(name = "legendary-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve MCP over HTTP.
    ServeHttp {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1:8080", env = "MCP_BIND")]
        bind: SocketAddr,
    },
    /// Serve MCP over stdio (default).
    ServeStdio {
        /// Bearer token for the session.
        #[arg(long, env = "MCP_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,
    },
    /// Mint a development token signed with MCP_SIGNING_SECRET.
    IssueToken {
        /// Role whose scopes the token carries.
        #[arg(long, default_value = "user")]
        role: String,
        /// Token subject.
        #[arg(long, default_value = "dev-user")]
        subject: String,
        /// Lifetime in seconds.
        #[arg(long, default_value = "3600")]
        ttl_secs: i64,
    },
    /// Check a running HTTP deployment.
    Probe {
        /// Base URL of the server.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: Url,
        /// Token for the authorized check.
        #[arg(long, env = "MCP_ACCESS_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Print the active scope and role catalog as JSON.
    ExportCatalog {
        /// Write to a file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging - output to stderr to avoid interfering with MCP protocol
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = ServerConfig::from_env().context("invalid configuration")?;
    let catalog = Arc::new(load_catalog(&config)?);

    let command = args.command.unwrap_or_else(|| Command::ServeStdio {
        access_token: std::env::var("MCP_ACCESS_TOKEN").ok(),
    });
    match command {
        Command::ServeStdio { access_token } => {
            let (dispatcher, validator) = build(config, catalog)?;
            let mut server = McpServer::new(dispatcher);
            match (&validator, access_token.as_deref()) {
                (Some(validator), token) => server = server.with_access_token(validator, token),
                (None, Some(_)) => warn!("Access token given but no signing key configured, ignoring"),
                (None, None) => {}
            }
            server.run_stdio().await?;
        }
        Command::ServeHttp { bind } => serve_http(config, catalog, bind).await?,
        Command::IssueToken {
            role,
            subject,
            ttl_secs,
        } => {
            let secret = match &config.signing_key {
                Some(SigningKey::Secret(secret)) => secret.clone(),
                _ => anyhow::bail!("issue-token requires MCP_SIGNING_SECRET"),
            };
            let mut issuer = DevTokenIssuer::new(secret.as_bytes(), issuer_name(&config), catalog);
            if let Some(audience) = config.audience.first() {
                issuer = issuer.with_audience(audience.clone());
            }
            let token = issuer.issue_for_role(&subject, &role, token_ttl(ttl_secs)?)?;
            println!("{}", token);
        }
        Command::Probe { url, token } => {
            let report = Probe::new(url, token)?.run().await;
            println!("{}", report);
            if !report.passed() {
                std::process::exit(1);
            }
        }
        Command::ExportCatalog { output } => {
            let json = catalog.to_json_pretty()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "Catalog exported");
                }
                None => println!("{}", json),
            }
        }
    }

    Ok(())
}

fn load_catalog(config: &ServerConfig) -> anyhow::Result<AccessCatalog> {
    match &config.catalog_file {
        Some(path) => {
            let catalog = AccessCatalog::from_path(path)
                .with_context(|| format!("loading catalog {}", path.display()))?;
            info!(path = %path.display(), "Loaded scope catalog");
            Ok(catalog)
        }
        None => Ok(AccessCatalog::builtin()),
    }
}

fn token_ttl(secs: i64) -> anyhow::Result<TimeDelta> {
    TimeDelta::try_seconds(secs).with_context(|| format!("--ttl-secs {} is out of range", secs))
}

fn issuer_name(config: &ServerConfig) -> String {
    match &config.issuer_url {
        Some(url) => url.as_str().trim_end_matches('/').to_string(),
        None => config.service_name.clone(),
    }
}

fn build_validator(config: &ServerConfig) -> anyhow::Result<Option<TokenValidator>> {
    let validator = match &config.signing_key {
        Some(SigningKey::Secret(secret)) => TokenValidator::hs256(secret.as_bytes()),
        Some(SigningKey::PemFile(path)) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("reading signing key {}", path.display()))?;
            TokenValidator::rs256_pem(&pem)?
        }
        None => {
            warn!("No signing key configured, every caller is anonymous");
            return Ok(None);
        }
    };

    let validator = match &config.issuer_url {
        Some(_) => validator.with_issuer(issuer_name(config)),
        None => validator,
    };
    Ok(Some(validator.with_audience(&config.audience)))
}

fn build(
    config: ServerConfig,
    catalog: Arc<AccessCatalog>,
) -> anyhow::Result<(Dispatcher, Option<TokenValidator>)> {
    let validator = build_validator(&config)?;
    let analytics = sink_from_config(&config);
    let registry = ToolRegistry::with_defaults(ToolContext::new(config, catalog.clone(), analytics))?;
    registry
        .validate_against(&catalog)
        .context("tool registry does not match the scope catalog")?;
    info!(tools = registry.len(), scopes = catalog.scopes().count(), "Tool registry ready");
    Ok((Dispatcher::new(Arc::new(registry)), validator))
}

#[cfg(feature = "http")]
async fn serve_http(
    config: ServerConfig,
    catalog: Arc<AccessCatalog>,
    bind: SocketAddr,
) -> anyhow::Result<()> {
    use legendary_mcp::discovery::discover;
    use legendary_mcp::http::{serve, AppState};

    let metadata = discover(config.issuer_url.as_ref()).await;
    let (dispatcher, validator) = build(config, catalog)?;
    let state = AppState::new(dispatcher, validator).with_metadata(metadata);
    serve(bind, state).await?;
    Ok(())
}

#[cfg(not(feature = "http"))]
async fn serve_http(
    _config: ServerConfig,
    _catalog: Arc<AccessCatalog>,
    _bind: SocketAddr,
) -> anyhow::Result<()> {
    anyhow::bail!("built without the `http` feature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_ttl_range() {
        assert_eq!(token_ttl(3600).unwrap(), TimeDelta::hours(1));
        assert!(token_ttl(i64::MAX).is_err());
        assert!(token_ttl(i64::MIN).is_err());
    }
}
