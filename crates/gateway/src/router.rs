//! Routing core: RPC correlation, event fan-out, control messages.
//!
//! Every forwarded request ends in exactly one terminal outcome, decided by
//! whoever removes its entry from the pending-calls table first: the real
//! response, the deadline timer, or the target connection closing.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use {
    agentgate_protocol::{
        AddSubscriptionRequest, AddSubscriptionResponse, AgentId, AgentState, Event,
        GetStateResponse, Message, RegisterAgentTypeRequest, RegisterAgentTypeResponse,
        RpcRequest, RpcResponse, SaveStateResponse,
    },
    tokio::{sync::oneshot, time::Instant},
    tracing::{debug, info, warn},
};

use crate::{
    error::RouteError,
    registry::Registration,
    state::{CallOrigin, ConnectedClient, GatewayState, PendingCall},
};

/// How a forwarded call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Responded,
    TimedOut,
    ConnectionLost,
}

impl CallOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Responded => "responded",
            Self::TimedOut => "timed_out",
            Self::ConnectionLost => "connection_lost",
        }
    }
}

/// Cheap handle over the shared gateway tables.
#[derive(Clone)]
pub struct Router {
    state: Arc<GatewayState>,
}

impl Router {
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────

    /// Single dispatch point for every envelope a host sends.
    pub async fn handle_inbound(&self, from: &ConnectedClient, msg: Message) {
        debug!(conn_id = %from.conn_id, kind = msg.kind(), "inbound");
        match msg {
            Message::Request(req) => {
                self.route_request(CallOrigin::Connection(from.conn_id.clone()), req)
                    .await;
            },
            Message::Response(resp) => self.route_response(&from.conn_id, resp).await,
            Message::Event(event) => {
                self.publish(event).await;
            },
            Message::RegisterAgentTypeRequest(req) => {
                let resp = self.register_agent_type(&from.conn_id, req).await;
                from.send(Message::RegisterAgentTypeResponse(resp));
            },
            Message::AddSubscriptionRequest(req) => {
                let resp = self.add_subscription(&from.conn_id, req).await;
                from.send(Message::AddSubscriptionResponse(resp));
            },
            other @ (Message::RegisterAgentTypeResponse(_) | Message::AddSubscriptionResponse(_)) => {
                warn!(conn_id = %from.conn_id, kind = other.kind(), "host sent a gateway-only message, ignoring");
            },
        }
    }

    // ── RPC path ─────────────────────────────────────────────────────────

    /// Forward `req` to the host of `req.target.type`, or answer the origin
    /// with an error right away when that is impossible.
    pub async fn route_request(&self, origin: CallOrigin, req: RpcRequest) {
        let request_id = req.request_id.clone();
        let target_type = req.target.r#type.clone();

        let resolved = self
            .state
            .registry
            .read()
            .await
            .resolve(&req.target)
            .map(str::to_string);
        let target_conn = match resolved {
            Ok(conn_id) => conn_id,
            Err(e) => {
                debug!(request_id = %request_id, error = %e, "request not routable");
                self.deliver(origin, RpcResponse::err(&request_id, e.to_string()))
                    .await;
                return;
            },
        };
        let Some(target) = self.state.client(&target_conn).await else {
            let err = RouteError::ConnectionLost(target_type);
            self.deliver(origin, RpcResponse::err(&request_id, err.to_string()))
                .await;
            return;
        };

        {
            let mut pending = self.state.pending.lock().await;
            if pending.contains_key(&request_id) {
                drop(pending);
                let err = RouteError::DuplicateRequest(request_id.clone());
                warn!(request_id = %request_id, "duplicate request id rejected");
                self.deliver(origin, RpcResponse::err(&request_id, err.to_string()))
                    .await;
                return;
            }
            // `connection_closed` removes the client before it scans `pending`,
            // so a target still listed here will see this entry when it closes.
            if !self.state.clients.read().await.contains_key(&target_conn) {
                drop(pending);
                debug!(request_id = %request_id, conn_id = %target_conn, "target closed before forwarding");
                let err = RouteError::ConnectionLost(target_type);
                self.deliver(origin, RpcResponse::err(&request_id, err.to_string()))
                    .await;
                return;
            }
            // The timer cannot fire before the entry exists: it needs this lock.
            let timer = self.spawn_deadline(request_id.clone(), self.state.routing.rpc_timeout());
            pending.insert(request_id.clone(), PendingCall {
                origin,
                target_conn: target_conn.clone(),
                target_type: target_type.clone(),
                created_at: Instant::now(),
                timer,
            });
        }

        debug!(request_id = %request_id, target = %req.target, method = %req.method, conn_id = %target_conn, "forwarding request");
        if target.send(Message::Request(req)) {
            metrics::counter!("agentgate_rpc_forwarded_total").increment(1);
        } else {
            self.resolve(
                &request_id,
                RpcResponse::err(
                    &request_id,
                    RouteError::ConnectionLost(target_type).to_string(),
                ),
                CallOutcome::ConnectionLost,
            )
            .await;
        }
    }

    /// Correlate a host's response with its pending call and pass it on.
    pub async fn route_response(&self, from_conn: &str, resp: RpcResponse) {
        let call = {
            let mut pending = self.state.pending.lock().await;
            let Some(expected) = pending.get(&resp.request_id).map(|c| c.target_conn.clone())
            else {
                debug!(request_id = %resp.request_id, conn_id = %from_conn, "late or unknown response discarded");
                return;
            };
            if expected != from_conn {
                warn!(request_id = %resp.request_id, conn_id = %from_conn, expected = %expected, "response from wrong connection discarded");
                return;
            }
            pending.remove(&resp.request_id)
        };
        if let Some(call) = call {
            self.finish(call, resp, CallOutcome::Responded).await;
        }
    }

    /// Issue a request from inside the gateway process and await its single
    /// terminal response.
    pub async fn call(&self, req: RpcRequest) -> RpcResponse {
        let request_id = req.request_id.clone();
        let (tx, rx) = oneshot::channel();
        self.route_request(CallOrigin::Local(tx), req).await;
        rx.await.unwrap_or_else(|_| {
            RpcResponse::err(&request_id, RouteError::Timeout(request_id.clone()).to_string())
        })
    }

    /// Number of calls awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.state.pending.lock().await.len()
    }

    fn spawn_deadline(&self, request_id: String, timeout: Duration) -> tokio::task::AbortHandle {
        let router = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let resp = RpcResponse::err(&request_id, RouteError::Timeout(request_id.clone()).to_string());
            router.resolve(&request_id, resp, CallOutcome::TimedOut).await;
        })
        .abort_handle()
    }

    /// Remove the pending entry and deliver `resp` to its origin. A no-op if
    /// another outcome already claimed the entry.
    async fn resolve(&self, request_id: &str, resp: RpcResponse, outcome: CallOutcome) {
        let Some(call) = self.state.pending.lock().await.remove(request_id) else {
            return;
        };
        self.finish(call, resp, outcome).await;
    }

    async fn finish(&self, call: PendingCall, resp: RpcResponse, outcome: CallOutcome) {
        if outcome != CallOutcome::TimedOut {
            call.timer.abort();
        } else {
            metrics::counter!("agentgate_rpc_timeouts_total").increment(1);
        }
        debug!(
            request_id = %resp.request_id,
            target = %call.target_type,
            outcome = outcome.as_str(),
            elapsed_ms = call.created_at.elapsed().as_millis() as u64,
            "call resolved"
        );
        self.deliver(call.origin, resp).await;
    }

    async fn deliver(&self, origin: CallOrigin, resp: RpcResponse) {
        match origin {
            CallOrigin::Connection(conn_id) => {
                let request_id = resp.request_id.clone();
                if !self.state.send_to(&conn_id, Message::Response(resp)).await {
                    debug!(request_id = %request_id, conn_id = %conn_id, "origin gone, response dropped");
                }
            },
            CallOrigin::Local(tx) => {
                let _ = tx.send(resp);
            },
        }
    }

    // ── Event path ───────────────────────────────────────────────────────

    /// Fan `event` out to every connection hosting a subscribed agent type.
    ///
    /// Each connection gets one copy whose `recipients` lists the matched
    /// types it hosts. Returns the number of connections reached.
    pub async fn publish(&self, event: Event) -> usize {
        let matched = self
            .state
            .subscriptions
            .read()
            .await
            .match_types(&event.topic_type);
        if matched.is_empty() {
            debug!(topic = %event.topic(), "no subscribers, event dropped");
            return 0;
        }

        let mut by_conn: BTreeMap<String, Vec<String>> = BTreeMap::new();
        {
            let registry = self.state.registry.read().await;
            for agent_type in matched {
                if let Some(conn_id) = registry.owner_of(&agent_type) {
                    by_conn.entry(conn_id.to_string()).or_default().push(agent_type);
                }
            }
        }

        let clients = self.state.clients.read().await;
        let mut delivered = 0;
        for (conn_id, recipients) in by_conn {
            let Some(client) = clients.get(&conn_id) else {
                continue;
            };
            let mut copy = event.clone();
            copy.recipients = recipients;
            if client.send(Message::Event(copy)) {
                delivered += 1;
            }
        }
        drop(clients);

        metrics::counter!("agentgate_events_delivered_total").increment(delivered as u64);
        debug!(topic = %event.topic(), connections = delivered, "event published");
        delivered
    }

    // ── Control path ─────────────────────────────────────────────────────

    pub async fn register_agent_type(
        &self,
        conn_id: &str,
        req: RegisterAgentTypeRequest,
    ) -> RegisterAgentTypeResponse {
        let now_ms = self.state.uptime_ms();
        let liveness = self.state.routing.liveness_timeout();
        let result = {
            let clients = self.state.clients.read().await;
            let mut registry = self.state.registry.write().await;
            registry.register(&req.agent_type, conn_id, |owner| {
                clients
                    .get(owner)
                    .is_some_and(|c| c.is_alive(now_ms, liveness))
            })
        };

        match result {
            Ok(registration) => {
                match &registration {
                    Registration::TookOver { previous_conn } => {
                        info!(agent_type = %req.agent_type, conn_id, previous = %previous_conn, "agent type taken over from dead connection");
                    },
                    Registration::New => {
                        info!(agent_type = %req.agent_type, conn_id, "agent type registered");
                    },
                    Registration::Unchanged => {},
                }
                RegisterAgentTypeResponse {
                    request_id: req.request_id,
                    success: true,
                    error: None,
                }
            },
            Err(e) => {
                warn!(agent_type = %req.agent_type, conn_id, error = %e, "agent type registration rejected");
                RegisterAgentTypeResponse {
                    request_id: req.request_id,
                    success: false,
                    error: Some(e.to_string()),
                }
            },
        }
    }

    pub async fn add_subscription(
        &self,
        conn_id: &str,
        req: AddSubscriptionRequest,
    ) -> AddSubscriptionResponse {
        let id = self
            .state
            .subscriptions
            .write()
            .await
            .add(req.subscription.clone(), conn_id);
        info!(conn_id, subscription_id = %id, subscription = ?req.subscription, "subscription added");
        AddSubscriptionResponse {
            request_id: req.request_id,
            success: true,
            subscription_id: Some(id),
            error: None,
        }
    }

    // ── Disconnect ───────────────────────────────────────────────────────

    /// Revoke everything `conn_id` owned and settle the calls that depended
    /// on it.
    pub async fn connection_closed(&self, conn_id: &str) {
        self.state.remove_client(conn_id).await;
        let revoked = self.state.registry.write().await.unregister_conn(conn_id);
        let removed_subs = self.state.subscriptions.write().await.remove_conn(conn_id);

        let (failed, abandoned) = {
            let mut pending = self.state.pending.lock().await;
            let affected: Vec<String> = pending
                .iter()
                .filter(|(_, call)| {
                    call.target_conn == conn_id
                        || matches!(&call.origin, CallOrigin::Connection(o) if o == conn_id)
                })
                .map(|(id, _)| id.clone())
                .collect();
            let mut failed = Vec::new();
            let mut abandoned = 0;
            for id in affected {
                let Some(call) = pending.remove(&id) else {
                    continue;
                };
                call.timer.abort();
                if call.target_conn == conn_id {
                    failed.push((id, call));
                } else {
                    abandoned += 1;
                }
            }
            (failed, abandoned)
        };

        let failed_count = failed.len();
        for (request_id, call) in failed {
            let err = RouteError::ConnectionLost(call.target_type.clone());
            debug!(request_id = %request_id, outcome = CallOutcome::ConnectionLost.as_str(), "call resolved");
            self.deliver(call.origin, RpcResponse::err(&request_id, err.to_string()))
                .await;
        }

        info!(
            conn_id,
            agent_types = ?revoked,
            subscriptions = removed_subs,
            failed_calls = failed_count,
            abandoned_calls = abandoned,
            "connection closed"
        );
    }

    // ── Unary state operations ───────────────────────────────────────────

    pub async fn get_state(&self, agent_id: &AgentId) -> GetStateResponse {
        match self.state.store.get(agent_id).await {
            Ok(Some(state)) => GetStateResponse {
                agent_state: Some(state),
                success: true,
                error: None,
            },
            Ok(None) => GetStateResponse {
                agent_state: None,
                success: false,
                error: Some(format!("no state stored for {agent_id}")),
            },
            Err(e) => {
                warn!(agent = %agent_id, error = %e, "state get failed");
                GetStateResponse {
                    agent_state: None,
                    success: false,
                    error: Some(e.to_string()),
                }
            },
        }
    }

    pub async fn save_state(&self, state: AgentState) -> SaveStateResponse {
        let agent_id = state.agent_id.clone();
        match self.state.store.save(state).await {
            Ok(etag) => SaveStateResponse {
                success: true,
                etag: Some(etag),
                error: None,
                error_code: None,
            },
            Err(e) => {
                debug!(agent = %agent_id, error = %e, "state save rejected");
                SaveStateResponse {
                    success: false,
                    etag: None,
                    error: Some(e.to_string()),
                    error_code: Some(e.code().to_string()),
                }
            },
        }
    }
}
