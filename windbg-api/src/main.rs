use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use windbg_api::api::rpc::{self, RpcState};
use windbg_api::core::config::Settings;
use windbg_api::core::notifications::{Notification, NotificationBus};
use windbg_api::core::session_manager::{SessionManager, process_memory_bytes};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::new()?;

    info!(
        "Starting debugger gateway on {}:{}",
        settings.server.host, settings.server.port
    );

    let bus = Arc::new(NotificationBus::new(256));

    // Mirror every notification into the log until a streaming transport
    // attaches its own adapter.
    bus.attach("log", |notification| {
        tracing::debug!(
            method = %notification.method,
            params = %notification.params,
            "notification"
        );
    });

    let manager = SessionManager::new(
        settings.debugging.clone(),
        settings.session.clone(),
        settings.queue.clone(),
        settings.recovery.clone(),
        bus.clone(),
    );

    spawn_health_publisher(bus.clone(), manager.clone());

    let app = create_app(manager.clone());

    let addr = SocketAddr::new(settings.server.host.parse()?, settings.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Gateway running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Drain sessions with the bounded disposal budget, then stop the bus.
    manager.shutdown().await;
    bus.close();
    info!("Gateway stopped");

    Ok(())
}

fn create_app(manager: Arc<SessionManager>) -> Router {
    let state = RpcState { manager };

    Router::new()
        .route("/health", get(health_check))
        .route("/rpc", post(rpc::dispatch))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<RpcState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "activeSessions": state.manager.active_count(),
    }))
}

fn spawn_health_publisher(bus: Arc<NotificationBus>, manager: Arc<SessionManager>) {
    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            if bus.is_closed() {
                break;
            }
            bus.publish(Notification::server_health(
                manager.active_count(),
                started.elapsed().as_secs(),
                process_memory_bytes(),
            ));
        }
    });
}
