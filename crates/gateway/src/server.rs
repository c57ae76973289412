use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router as HttpRouter,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::{get, post},
    },
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::info,
};

use {
    agentgate_config::{GatewayConfig, StateBackend},
    agentgate_protocol::{AgentId, AgentState},
};

use crate::{
    router::Router,
    state::GatewayState,
    state_store::{MemoryStateStore, SqliteStateStore, StateStore},
    ws::handle_connection,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    router: Router,
    #[cfg(feature = "prometheus")]
    prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway HTTP app (shared between production startup and tests).
pub fn build_gateway_app(router: Router) -> HttpRouter {
    let app_state = AppState {
        router,
        #[cfg(feature = "prometheus")]
        prometheus: None,
    };
    routes(app_state)
}

fn routes(app_state: AppState) -> HttpRouter {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = HttpRouter::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/state/get", post(get_state_handler))
        .route("/state/save", post(save_state_handler));

    #[cfg(feature = "prometheus")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Open the state backend selected by `config`.
pub async fn open_store(config: &GatewayConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    Ok(match config.state.backend {
        StateBackend::Memory => Arc::new(MemoryStateStore::new()),
        StateBackend::Sqlite => {
            let path = config
                .state
                .path
                .clone()
                .unwrap_or_else(|| agentgate_config::data_dir().join("state.db"));
            Arc::new(SqliteStateStore::open(&path).await?)
        },
    })
}

/// Start the gateway HTTP + WebSocket server.
pub async fn start_gateway(config: GatewayConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let state = GatewayState::new(config.routing.clone(), store);
    let router = Router::new(Arc::clone(&state));

    let app_state = AppState {
        router,
        #[cfg(feature = "prometheus")]
        prometheus: match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "prometheus recorder not installed");
                None
            },
        },
    };
    let app = routes(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("agentgate v{}", state.version),
        format!(
            "protocol v{}, listening on {}",
            agentgate_protocol::PROTOCOL_VERSION,
            addr
        ),
        format!(
            "state: {:?}, rpc timeout {}ms",
            config.state.backend, config.routing.rpc_timeout_ms
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    // Run the server with ConnectInfo for remote IP extraction.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let gateway = state.router.state();
    let connections = gateway.client_count().await;
    let agents: Vec<serde_json::Value> = gateway
        .registry
        .read()
        .await
        .list()
        .into_iter()
        .map(|(agent_type, conn_id)| serde_json::json!({ "type": agent_type, "connId": conn_id }))
        .collect();
    let subscriptions = gateway.subscriptions.read().await.len();
    let pending_calls = state.router.pending_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": gateway.version,
        "protocol": agentgate_protocol::PROTOCOL_VERSION,
        "uptimeMs": gateway.uptime_ms(),
        "connections": connections,
        "agentTypes": agents.len(),
        "agents": agents,
        "subscriptions": subscriptions,
        "pendingCalls": pending_calls,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(agentgate_protocol::MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_connection(socket, state.router, addr))
}

async fn get_state_handler(
    State(state): State<AppState>,
    Json(agent_id): Json<AgentId>,
) -> impl IntoResponse {
    Json(state.router.get_state(&agent_id).await)
}

async fn save_state_handler(
    State(state): State<AppState>,
    Json(agent_state): Json<AgentState>,
) -> impl IntoResponse {
    Json(state.router.save_state(agent_state).await)
}

#[cfg(feature = "prometheus")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (axum::http::StatusCode::OK, handle.render()),
        None => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed".to_string(),
        ),
    }
}
