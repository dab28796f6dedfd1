//! HTTP server for the SQL assistant

use anyhow::{Context, Result};
use clap::Parser;
use sql_assistant::api::{start_server, ApiState};
use sql_assistant::config::SessionBackend;
use sql_assistant::pipeline::spawn_sweeper;
use sql_assistant::session::open_store;
use sql_assistant::{AppConfig, Assistant, LlmClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "server")]
#[command(about = "Natural-language SQL assistant API server")]
struct Args {
    /// Address to bind (overrides SERVER_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides SERVER_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database the generated queries run against (overrides DATA_DB_PATH)
    #[arg(long)]
    data_db: Option<PathBuf>,

    /// Conversation store path, or ":memory:" (overrides CHAT_DB_PATH)
    #[arg(long)]
    chat_db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = AppConfig::from_env().context("failed to load configuration")?;

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(path) = args.data_db {
        config.database.data_path = path;
    }
    if let Some(path) = args.chat_db {
        config.sessions.backend = if path == ":memory:" {
            SessionBackend::Memory
        } else {
            SessionBackend::Sqlite(PathBuf::from(path))
        };
    }

    if !config.database.data_path.exists() {
        warn!(
            "Query database {} does not exist yet; requests will fail until it does",
            config.database.data_path.display()
        );
    }

    let model = Arc::new(LlmClient::new(&config.llm).context("failed to build model client")?);
    let store = open_store(&config.sessions).context("failed to open session store")?;
    let assistant = Arc::new(Assistant::new(&config, model, store));

    info!(
        "Model {} at {}, data {}",
        config.llm.model,
        config.llm.base_url,
        config.database.data_path.display()
    );

    let _sweeper = spawn_sweeper(assistant.clone(), config.sessions.sweep_interval);

    start_server(&config.server, ApiState::new(assistant))
        .await
        .context("server stopped")?;

    Ok(())
}
