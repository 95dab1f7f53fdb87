use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sage_gateway::SageError;
use sage_gateway::gateway::{ChatGateway, GatewayConfig, GatewayHttpState, http};

#[derive(Debug, Parser)]
#[command(
    name = "sage-gateway",
    version,
    about = "OpenAI-compatible gateway with weighted multi-key load balancing"
)]
struct Cli {
    /// Config file (YAML or JSON); defaults to the standard search locations
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host (overrides config and SAGE_GATEWAY_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides config and SAGE_GATEWAY_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Token guarding the /admin routes (overrides config)
    #[arg(long)]
    admin_token: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Export spans over OTLP/HTTP
    #[arg(long)]
    otel: bool,

    /// OTLP endpoint; implies --otel
    #[arg(long)]
    otel_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (mut config, path) = GatewayConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.verbose {
        config.verbose = true;
    }
    if let Some(token) = cli.admin_token {
        config.admin_token = Some(token);
    }

    let otel_enabled = cli.otel || cli.otel_endpoint.is_some();
    let _otel_guard = init_logging(
        &config,
        otel_enabled,
        cli.otel_endpoint.as_deref(),
        cli.json_logs,
    )?;
    tracing::info!(path = %path.display(), "using configuration");

    let gateway = ChatGateway::from_config(&config)?;
    tracing::info!(
        keys = gateway.pool().len(),
        strategy = gateway.strategy().as_str(),
        backend = %config.server_base_url,
        "gateway ready"
    );

    let mut state = GatewayHttpState::new(gateway);
    if let Some(token) = config.admin_token.as_deref() {
        state = state.with_admin_token(token);
    }

    let app = http::router(state);
    let listen = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "sage-gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("sage-gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

#[cfg(feature = "gateway-otel")]
fn init_logging(
    config: &GatewayConfig,
    otel_enabled: bool,
    endpoint: Option<&str>,
    json_logs: bool,
) -> Result<Option<sage_gateway::gateway::otel::OtelGuard>, Box<dyn std::error::Error>> {
    if otel_enabled {
        let guard = sage_gateway::gateway::otel::init_tracing(
            "sage-gateway",
            endpoint,
            env_filter(config.verbose),
            json_logs,
        )?;
        return Ok(Some(guard));
    }
    init_fmt(config.verbose, json_logs)?;
    Ok(None)
}

#[cfg(not(feature = "gateway-otel"))]
fn init_logging(
    config: &GatewayConfig,
    otel_enabled: bool,
    _endpoint: Option<&str>,
    json_logs: bool,
) -> Result<Option<()>, Box<dyn std::error::Error>> {
    if otel_enabled {
        return Err("otel requires `--features gateway-otel`".into());
    }
    init_fmt(config.verbose, json_logs)?;
    Ok(None)
}

fn init_fmt(verbose: bool, json_logs: bool) -> Result<(), SageError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_target(false);
    let installed = if json_logs {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    installed.map_err(|err| SageError::Config(format!("tracing init: {err}")))
}
