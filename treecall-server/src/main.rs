use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (TREECALL_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("TREECALL_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("treecall_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = treecall_server::config::ServerConfig::parse();
    tracing::info!(root = %config.root_name, "Starting call tree on {}", config.listen_addr);
    if !config.exec_allow.is_empty() {
        tracing::info!("$exec allows: {}", config.exec_allow.join(", "));
    }
    let server = treecall_server::server::Server::new(config);
    server.run().await
}
