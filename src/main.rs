//! agentdash - live agent output for the monitoring dashboard.
//!
//! ## Commands
//!
//! **`agentdash serve`**: runs the HTTP server exposing tmux sessions as
//! server-sent event streams.
//!
//! **`agentdash watch <name>`**: subscribes to one session's stream on a
//! running server and prints its output.
//!
//! **`agentdash list`**: prints the sessions a running server can stream.
//!
//! **`agentdash cache --origin <url>`**: fills the on-disk offline cache from
//! the dashboard origin and drops stores left by older versions.
//!
//! **`agentdash init-config`**: writes a config file with the defaults.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use agentdash::{
    api,
    cache::{CacheError, CacheManager, FsCacheStorage, HttpNetwork, NetworkError},
    client::{self, Handlers, ReconnectPolicy, SubscriptionEnd},
    config::{self, AgentdashConfig, ConfigError},
    protocol::{EventKind, StreamEvent},
    session::{InvalidSessionName, SessionName},
    source::TmuxSource,
    stream::StreamManager,
};
use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_URL: &str = "http://127.0.0.1:7681";

/// agentdash - live agent output for the monitoring dashboard
#[derive(ClapParser, Debug)]
#[command(name = "agentdash", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the streaming server
    Serve {
        /// Address to bind the HTTP server (overrides the config file)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Path to the config file
        #[arg(long, env = config::CONFIG_ENV)]
        config: Option<PathBuf>,

        /// Poll interval in milliseconds (overrides the config file)
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },

    /// Print the live output of one session
    Watch {
        /// Session name
        name: String,

        /// Base URL of the server
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// List sessions available to stream
    List {
        /// Base URL of the server
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// Install the offline cache from the dashboard origin
    Cache {
        /// Origin serving the dashboard shell
        #[arg(long, default_value = DEFAULT_URL)]
        origin: String,

        /// Cache directory (defaults to the user cache dir)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Path to the config file
        #[arg(long, env = config::CONFIG_ENV)]
        config: Option<PathBuf>,
    },

    /// Write a config file holding the defaults
    InitConfig {
        /// Path to the config file
        #[arg(long, env = config::CONFIG_ENV)]
        config: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Error, Debug)]
pub enum AgentdashError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    InvalidSessionName(#[from] InvalidSessionName),

    #[error("client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("config file already exists: {0}")]
    ConfigExists(PathBuf),

    #[error("stream ended: {0}")]
    StreamEnded(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), AgentdashError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve {
            bind,
            config,
            poll_interval_ms,
        } => run_serve(bind, config, poll_interval_ms).await,
        Commands::Watch { name, url } => run_watch(name, url).await,
        Commands::List { url } => run_list(url).await,
        Commands::Cache {
            origin,
            dir,
            config,
        } => run_cache(origin, dir, config).await,
        Commands::InitConfig { config, force } => run_init_config(config, force),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "agentdash=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server ─────────────────────────────────────────────────────────

async fn run_serve(
    bind: Option<SocketAddr>,
    config_path: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
) -> Result<(), AgentdashError> {
    let path = config::resolve_config_path(config_path);
    let mut config = AgentdashConfig::load_or_default(&path)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(ms) = poll_interval_ms {
        config.server.poll_interval_ms = ms;
    }

    let stream_config = config.server.stream_config();
    tracing::info!(
        poll_interval_ms = stream_config.poll_interval.as_millis() as u64,
        heartbeat_secs = stream_config.heartbeat_interval.as_secs(),
        max_streams = stream_config.max_streams,
        "agentdash server starting"
    );

    let source = Arc::new(TmuxSource::new(
        config.source.tmux.clone(),
        config.source.history_lines,
    ));
    let streams = StreamManager::new(source, stream_config);
    let app = api::router(
        api::AppState {
            streams: streams.clone(),
        },
        api::RouterConfig {
            cors_origins: config.server.cors_origins.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            tracing::info!("received Ctrl+C, closing streams");
            // Open event streams never finish on their own.
            streams.shutdown();
        })
        .await?;

    tracing::info!("agentdash server stopped");
    Ok(())
}

// ── Client commands ────────────────────────────────────────────────

async fn run_watch(name: String, url: String) -> Result<(), AgentdashError> {
    let name = SessionName::parse(&name)?;

    let handlers = Handlers::new()
        .on(EventKind::AgentOutput, |event| {
            if let StreamEvent::AgentOutput { chunk, .. } = event {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(chunk.as_bytes());
                let _ = stdout.flush();
            }
        })
        .on(EventKind::AgentError, |event| {
            if let StreamEvent::AgentError { session, message } = event {
                eprintln!("agentdash: {session}: {message}");
            }
        });

    let subscription = client::subscribe(
        client::stream_url(&url, name.as_str()),
        handlers,
        ReconnectPolicy::default(),
    );

    let end = tokio::select! {
        end = subscription.finished() => end,
        _ = tokio::signal::ctrl_c() => {
            subscription.unsubscribe();
            SubscriptionEnd::Unsubscribed
        }
    };

    match end {
        SubscriptionEnd::Unsubscribed => Ok(()),
        SubscriptionEnd::ServerError { message } => Err(AgentdashError::StreamEnded(message)),
        SubscriptionEnd::Rejected { status } => Err(AgentdashError::StreamEnded(format!(
            "server rejected the stream with status {status}"
        ))),
        SubscriptionEnd::RetriesExhausted { attempts } => Err(AgentdashError::StreamEnded(
            format!("connection lost after {attempts} reconnect attempts"),
        )),
    }
}

async fn run_list(url: String) -> Result<(), AgentdashError> {
    let sessions = client::list_agents(&reqwest::Client::new(), &url).await?;
    if sessions.is_empty() {
        println!("No active sessions.");
        return Ok(());
    }
    println!("{:<24} {:>7}  {}", "NAME", "WINDOWS", "ATTACHED");
    for session in sessions {
        println!(
            "{:<24} {:>7}  {}",
            session.name,
            session.windows,
            if session.attached { "yes" } else { "no" }
        );
    }
    Ok(())
}

// ── Offline cache ──────────────────────────────────────────────────

async fn run_cache(
    origin: String,
    dir: Option<PathBuf>,
    config_path: Option<PathBuf>,
) -> Result<(), AgentdashError> {
    let path = config::resolve_config_path(config_path);
    let config = AgentdashConfig::load_or_default(&path)?;
    let dir = dir.unwrap_or_else(config::default_cache_dir);

    let storage = Arc::new(FsCacheStorage::new(&dir));
    let network = Arc::new(HttpNetwork::new(&origin)?);
    let assets = config.cache.shell_assets.len();
    let manager = CacheManager::new(config.cache, storage, network);

    manager.install().await?;
    let deleted = manager.activate().await?;
    tracing::info!(dir = %dir.display(), %origin, assets, "offline cache installed");

    println!("Cached {assets} shell assets in {}.", dir.display());
    for name in deleted {
        println!("Removed stale cache {name}.");
    }
    Ok(())
}

fn run_init_config(config_path: Option<PathBuf>, force: bool) -> Result<(), AgentdashError> {
    let path = config::resolve_config_path(config_path);
    if path.exists() && !force {
        return Err(AgentdashError::ConfigExists(path));
    }
    AgentdashConfig::default().save(&path)?;
    println!("Wrote {}.", path.display());
    Ok(())
}
