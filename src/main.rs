use ircv3d::{context::ServerContext, result::Result, server::Server, settings::Settings};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ircv3d=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::new()?;
    let address = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&address).await?;
    info!(%address, server_host = %settings.server_host, "listening");

    let server = Server::start(ServerContext::new(settings));

    tokio::select! {
        result = server.listen(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }

    server.shutdown().await
}
