use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::{Mutex, RwLock, mpsc, oneshot},
    task::AbortHandle,
    time::Instant,
};

use {
    agentgate_config::RoutingConfig,
    agentgate_protocol::{Message, RpcResponse},
};

use crate::{registry::AgentRegistry, state_store::StateStore, subscriptions::SubscriptionTable};

// ── Connected host ───────────────────────────────────────────────────────────

/// An agent host currently connected to the gateway.
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    /// Channel feeding this host's single writer task.
    pub sender: mpsc::UnboundedSender<Message>,
    pub remote_addr: Option<SocketAddr>,
    /// Milliseconds since gateway start at which the last frame arrived.
    last_activity_ms: AtomicU64,
}

impl ConnectedClient {
    pub fn new(
        conn_id: impl Into<String>,
        sender: mpsc::UnboundedSender<Message>,
        remote_addr: Option<SocketAddr>,
        now_ms: u64,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            sender,
            remote_addr,
            last_activity_ms: AtomicU64::new(now_ms),
        }
    }

    /// Queue a message for this host. Returns false once the writer is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.sender.send(msg).is_ok()
    }

    /// Touch the activity timestamp.
    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// A host is alive while its writer runs and it has been heard from
    /// within the liveness window.
    pub fn is_alive(&self, now_ms: u64, liveness_timeout: Duration) -> bool {
        !self.sender.is_closed()
            && u128::from(now_ms.saturating_sub(self.last_activity_ms()))
                <= liveness_timeout.as_millis()
    }
}

// ── Pending calls ────────────────────────────────────────────────────────────

/// Who is waiting for the response to a forwarded request.
#[derive(Debug)]
pub enum CallOrigin {
    /// A connected host; the response goes back over its stream.
    Connection(String),
    /// An in-process caller awaiting [`crate::router::Router::call`].
    Local(oneshot::Sender<RpcResponse>),
}

/// A forwarded request that has not reached a terminal outcome yet.
#[derive(Debug)]
pub struct PendingCall {
    pub origin: CallOrigin,
    /// Connection the request was forwarded to; only it may answer.
    pub target_conn: String,
    pub target_type: String,
    pub created_at: Instant,
    /// Deadline timer, cancelled when the call resolves another way.
    pub timer: AbortHandle,
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
///
/// Lock order when more than one is needed: `clients`, then `registry`;
/// `pending`, then `clients`.
pub struct GatewayState {
    /// All connected hosts, keyed by conn_id.
    pub clients: RwLock<HashMap<String, Arc<ConnectedClient>>>,
    /// agent_type → hosting connection.
    pub registry: RwLock<AgentRegistry>,
    /// topic → agent type rules.
    pub subscriptions: RwLock<SubscriptionTable>,
    /// request_id → call awaiting a response.
    pub pending: Mutex<HashMap<String, PendingCall>>,
    /// Agent state persistence.
    pub store: Arc<dyn StateStore>,
    pub routing: RoutingConfig,
    /// Server version string.
    pub version: String,
    started_at: Instant,
}

impl GatewayState {
    pub fn new(routing: RoutingConfig, store: Arc<dyn StateStore>) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            registry: RwLock::new(AgentRegistry::new()),
            subscriptions: RwLock::new(SubscriptionTable::new()),
            pending: Mutex::new(HashMap::new()),
            store,
            routing,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        })
    }

    /// Milliseconds since the gateway started; the clock for liveness.
    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Register a new client connection.
    pub async fn register_client(&self, client: Arc<ConnectedClient>) {
        let conn_id = client.conn_id.clone();
        self.clients.write().await.insert(conn_id, client);
        metrics::gauge!("agentgate_connections").increment(1.0);
    }

    /// Remove a client by conn_id. Returns the removed client if found.
    pub async fn remove_client(&self, conn_id: &str) -> Option<Arc<ConnectedClient>> {
        let removed = self.clients.write().await.remove(conn_id);
        if removed.is_some() {
            metrics::gauge!("agentgate_connections").decrement(1.0);
        }
        removed
    }

    pub async fn client(&self, conn_id: &str) -> Option<Arc<ConnectedClient>> {
        self.clients.read().await.get(conn_id).cloned()
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Queue `msg` for `conn_id`. Returns false if the host is gone.
    pub async fn send_to(&self, conn_id: &str, msg: Message) -> bool {
        match self.client(conn_id).await {
            Some(client) => client.send(msg),
            None => false,
        }
    }
}
