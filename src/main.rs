use axonhub_router_core::config::Config;
use axonhub_router_core::server::{build_router, AppState};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "axonhub-router", about = "Multi-provider LLM request router")]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, env = "AXONHUB_CONFIG", default_value = "~/.axonhub/config.json")]
    config: String,

    /// Overrides the listen host from the config file.
    #[arg(long, env = "AXONHUB_HOST")]
    host: Option<String>,

    /// Overrides the listen port from the config file.
    #[arg(long, env = "AXONHUB_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_path = shellexpand::tilde(&cli.config).to_string();

    let mut file = if std::path::Path::new(&config_path).exists() {
        Config::from_file(&config_path)?.file().clone()
    } else {
        tracing::warn!(path = %config_path, "config file not found, starting with an empty channel list");
        axonhub_router_core::config::ConfigFile::default()
    };
    if let Some(host) = cli.host {
        file.host = host;
    }
    if let Some(port) = cli.port {
        file.port = port;
    }
    let config = Config::from_config_file(file)?;

    let listen_addr = config.listen_addr();
    let state = AppState::from_config(&config);
    let router = build_router(state);

    tracing::info!(addr = %listen_addr, "starting axonhub-router");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
