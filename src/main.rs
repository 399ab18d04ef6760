//! Process entrypoint: logging, configuration, application wiring, serve.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use ghibli_proxy::app::App;
use ghibli_proxy::config::Config;
use ghibli_proxy::server::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    tracing::info!(
        bind_addr = %config.bind_addr,
        base_url = %config.base_url,
        cache_ttl_secs = config.cache_ttl.as_secs(),
        "starting ghibli-proxy"
    );

    let app = Arc::new(App::new(&config)?);
    let server = Server::bind(&config.bind_addr).await?;
    server.run(app).await?;

    Ok(())
}
