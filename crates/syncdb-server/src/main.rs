use std::future::IntoFuture;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syncdb_core::Hub;
use syncdb_server::{
    config::{Args, ServerConfig, ENV_FILE},
    configured_sources, create_router,
    state::AppState,
    SourceRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Values from app.env fill in whatever the environment does not set
    dotenv::from_filename(ENV_FILE).ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "syncdb_server=info,syncdb_core=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config: ServerConfig = args.into();
    if !config.has_sources() {
        anyhow::bail!("no change source configured, set PG_URL and/or MONGO_URL");
    }

    let (hub, _hub_task) = Hub::start(config.hub.clone());

    let sources = Arc::new(SourceRegistry::new());
    for source in configured_sources(&config) {
        sources.start(source, &hub).await;
    }
    if sources.running() == 0 {
        anyhow::bail!("no change source could be started");
    }

    let app = create_router(AppState::new(hub, sources.clone(), &config));
    let listener = TcpListener::bind(config.listen).await?;

    tracing::info!(addr = %config.listen, "syncdb server listening");
    tracing::info!("Stream available at http://{}/stream", config.listen);
    tracing::info!("Health check at http://{}/health", config.listen);

    // Event streams never finish on their own, so there is no graceful drain;
    // stop the sources and let open connections drop with the process.
    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
    }

    sources.stop_all().await;
    tracing::info!("syncdb server stopped");

    Ok(())
}
