//! `courier` binary: loads configuration, then serves the HTTP API until
//! Ctrl-C while the first session comes up.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use courier_core::provider::bridge::BridgeProvider;
use courier_core::provider::SessionProvider;
use courier_core::{CourierConfig, CourierContext};
use courier_http::{HttpConfig, HttpState};
use serde::Deserialize;
use tokio::net::TcpListener;

// ============================================================================
// CLI Types
// ============================================================================

/// Courier - chat message gateway over a single failover-protected session
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to (overrides config file)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bearer token required on every route except /health
    #[arg(long, env = "COURIER_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Session provider
    #[arg(long, value_enum)]
    provider: Option<ProviderKind>,

    /// Base URL of the session sidecar (bridge provider only)
    #[arg(long, env = "COURIER_BRIDGE_URL")]
    bridge_url: Option<String>,

    /// Session identity; repeat to build the failover pool in order
    #[arg(long = "identity", value_name = "IDENTITY")]
    identities: Vec<String>,

    /// Directory for the message audit log
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(ValueEnum, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum ProviderKind {
    #[default]
    Loopback,
    Bridge,
}

// ============================================================================
// Configuration
// ============================================================================

/// Contents of the `--config` file: core settings at the top level, listener
/// settings under `http`.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct DaemonConfig {
    #[serde(flatten)]
    core: CourierConfig,
    http: HttpConfig,
    provider: ProviderKind,
    bridge_url: Option<String>,
}

impl DaemonConfig {
    fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        serde_json::from_str(&raw).map_err(|e| format!("Invalid config {}: {}", path.display(), e))
    }

    /// File config (or defaults) with command-line flags applied on top.
    fn resolve(args: ServeArgs) -> Result<Self, String> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(host) = args.host {
            config.http.host = host;
        }
        if let Some(port) = args.port {
            config.http.port = port;
        }
        if args.auth_token.is_some() {
            config.http.auth_token = args.auth_token;
        }
        if let Some(provider) = args.provider {
            config.provider = provider;
        }
        if args.bridge_url.is_some() {
            config.bridge_url = args.bridge_url;
        }
        if !args.identities.is_empty() {
            config.core.identities = args.identities;
        }
        if args.log_dir.is_some() {
            config.core.log_dir = args.log_dir;
        }

        if config.provider == ProviderKind::Bridge && config.bridge_url.is_none() {
            return Err("--bridge-url is required with --provider bridge".to_string());
        }
        config.core.validate().map_err(|e| e.to_string())?;
        config.http.addr()?;
        Ok(config)
    }
}

// ============================================================================
// Serve
// ============================================================================

/// Context and HTTP state for `config`, with the bridge wired to the
/// webhook when that provider is selected.
fn build(config: &DaemonConfig) -> Result<HttpState, String> {
    let bridge = config
        .bridge_url
        .as_deref()
        .filter(|_| config.provider == ProviderKind::Bridge)
        .map(|url| Arc::new(BridgeProvider::new(url)));

    let mut builder = CourierContext::builder().config(config.core.clone());
    if let Some(bridge) = &bridge {
        log::info!("Using bridge provider at {}", bridge.base_url());
        builder = builder.provider(Arc::clone(bridge) as Arc<dyn SessionProvider>);
    } else {
        log::info!("Using loopback provider");
    }
    let context = builder.build().map_err(|e| e.to_string())?;

    let mut state = HttpState::new(context, &config.http);
    if let Some(bridge) = bridge {
        state = state.with_bridge(bridge);
    }
    Ok(state)
}

/// Serve `state` until `shutdown`, bringing the first session up alongside.
///
/// The listener is already accepting while the session initializes, so a
/// sidecar can push its first `qr`/`ready` events to the webhook.
async fn run(
    state: HttpState,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), String> {
    let context = state.context.clone();
    let starter = {
        let context = context.clone();
        tokio::spawn(async move { context.start().await })
    };

    let result = courier_http::serve(Arc::new(state), listener, shutdown)
        .await
        .map_err(|e| format!("HTTP server failed: {}", e));

    starter.abort();
    context.shutdown().await;
    log::info!("Courier stopped");
    result
}

async fn serve(config: DaemonConfig) -> Result<(), String> {
    let state = build(&config)?;
    let listener = courier_http::bind(&config.http)
        .await
        .map_err(|e| format!("Failed to bind {}:{}: {}", config.http.host, config.http.port, e))?;

    run(state, listener, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
        }
    })
    .await
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve(args) => match DaemonConfig::resolve(args) {
            Ok(config) => serve(config).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
