use anyhow::Context;
use tracing_subscriber::EnvFilter;

use webserv::Server;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = webserv::load_config(&path).with_context(|| format!("loading {}", path))?;
    tracing::info!(
        servers = config.servers.len(),
        max_requests = config.max_requests,
        "configuration loaded from {}",
        path
    );

    let mut server = Server::new(config)?;
    server.bind()?;
    server.run()?;
    Ok(())
}
