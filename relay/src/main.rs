//! Relay service entry point.

use anyhow::Result;
use iotbridge_relay::{broker, create_router, AllowAll, AppState, Gateway, JwtAuthenticator};
use iotbridge_shared::{load_config, TopicScheme};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    info!(
        broker = %config.mqtt.broker,
        port = config.mqtt.port,
        topic_root = %config.mqtt.topic_root,
        "starting relay gateway"
    );

    let (broker_handle, broker_events) = broker::spawn(config.mqtt.clone());

    let gateway = Arc::new(Gateway::new(
        broker_handle,
        TopicScheme::new(&config.mqtt.topic_root),
        Box::new(AllowAll),
    ));
    tokio::spawn(gateway.clone().run(broker_events));

    let state = Arc::new(AppState {
        gateway,
        authenticator: Arc::new(JwtAuthenticator::new(config.jwt.secret.clone())),
    });
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
