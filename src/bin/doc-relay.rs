use std::path::PathBuf;

use clap::Parser;
use doc_relay::{AppState, RelayConfig, http, logging};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "doc-relay")]
#[command(about = "Document-aware streaming relay for chat completion backends")]
struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8080.
    #[arg(long, alias = "addr")]
    listen: Option<String>,

    /// Redis URL for shared rate limits.
    #[arg(long)]
    redis: Option<String>,

    #[arg(long)]
    redis_prefix: Option<String>,

    /// Upstream base URL, e.g. http://127.0.0.1:8000/v1.
    #[arg(long)]
    upstream: Option<String>,

    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_tracing(cli.json_logs)?;

    let mut config = match cli.config.as_deref() {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(redis) = cli.redis {
        config.rate_limit.redis_url = Some(redis);
    }
    if let Some(prefix) = cli.redis_prefix {
        config.rate_limit.redis_prefix = Some(prefix);
    }
    if let Some(upstream) = cli.upstream {
        config.upstream.base_url = upstream;
    }

    let state = AppState::from_config(&config)?;
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(
        listen = %config.listen,
        upstream = %config.upstream.base_url,
        "doc-relay listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
