//! End-to-end tests over real sockets.
//!
//! Each test spins up the gateway on a random port and drives it with
//! WebSocket hosts and plain HTTP clients.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    agentgate_config::RoutingConfig,
    agentgate_gateway::{
        GatewayState, Router, server::build_gateway_app, state_store::MemoryStateStore,
    },
    agentgate_protocol::{
        AddSubscriptionRequest, AgentId, Event, Message, Payload, RegisterAgentTypeRequest,
        RpcRequest, RpcResponse, Subscription, TopicId,
    },
    futures::{SinkExt, StreamExt},
    tokio::net::TcpStream,
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite},
};

type Host = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Spin up a gateway on a random port and return its address.
async fn start_gateway() -> SocketAddr {
    let state = GatewayState::new(
        RoutingConfig::default(),
        Arc::new(MemoryStateStore::new()),
    );
    let app = build_gateway_app(Router::new(state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Host {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut Host, msg: Message) {
    ws.send(tungstenite::Message::text(msg.encode().unwrap()))
        .await
        .unwrap();
}

async fn send_raw(ws: &mut Host, raw: &str) {
    ws.send(tungstenite::Message::text(raw)).await.unwrap();
}

/// Next envelope from the gateway, skipping heartbeats.
async fn recv(ws: &mut Host) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        match frame {
            tungstenite::Message::Text(text) => return Message::decode(text.as_str()).unwrap(),
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn register(ws: &mut Host, agent_type: &str) {
    send(
        ws,
        Message::RegisterAgentTypeRequest(RegisterAgentTypeRequest {
            request_id: format!("reg-{agent_type}"),
            agent_type: agent_type.into(),
        }),
    )
    .await;
    match recv(ws).await {
        Message::RegisterAgentTypeResponse(resp) => assert!(resp.success, "{:?}", resp.error),
        other => panic!("expected registration response, got {other:?}"),
    }
}

async fn health(addr: SocketAddr) -> serde_json::Value {
    reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

// ============================================================================
// RPC
// ============================================================================

#[tokio::test]
async fn request_reaches_host_and_response_returns() {
    let addr = start_gateway().await;
    let mut echo = connect(addr).await;
    let mut caller = connect(addr).await;
    register(&mut echo, "echo").await;

    send(
        &mut caller,
        Message::Request(RpcRequest::new(
            "42",
            AgentId::new("echo", "1"),
            "say",
            Payload::text("text", "hello"),
        )),
    )
    .await;

    let Message::Request(req) = recv(&mut echo).await else {
        panic!("echo host expected a request");
    };
    assert_eq!(req.request_id, "42");
    assert_eq!(req.method, "say");
    send(
        &mut echo,
        Message::Response(RpcResponse::ok(req.request_id, req.payload)),
    )
    .await;

    let Message::Response(resp) = recv(&mut caller).await else {
        panic!("caller expected a response");
    };
    assert_eq!(resp.request_id, "42");
    assert!(!resp.is_error());
    assert_eq!(resp.payload.data.as_slice(), b"hello");
}

#[tokio::test]
async fn second_host_cannot_claim_live_agent_type() {
    let addr = start_gateway().await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    register(&mut first, "echo").await;

    send(
        &mut second,
        Message::RegisterAgentTypeRequest(RegisterAgentTypeRequest {
            request_id: "r2".into(),
            agent_type: "echo".into(),
        }),
    )
    .await;
    let Message::RegisterAgentTypeResponse(resp) = recv(&mut second).await else {
        panic!("expected registration response");
    };
    assert_eq!(resp.request_id, "r2");
    assert!(!resp.success);
}

#[tokio::test]
async fn malformed_request_gets_targeted_error() {
    let addr = start_gateway().await;
    let mut host = connect(addr).await;

    // No target: decodes as JSON but not as a request.
    send_raw(&mut host, r#"{"type":"request","requestId":"bad","method":"m"}"#).await;
    let Message::Response(resp) = recv(&mut host).await else {
        panic!("expected an error response");
    };
    assert_eq!(resp.request_id, "bad");
    assert!(resp.error.contains("malformed"));

    // The stream survives bad frames.
    register(&mut host, "still-here").await;
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn published_event_reaches_subscribed_host() {
    let addr = start_gateway().await;
    let mut listener = connect(addr).await;
    let mut publisher = connect(addr).await;
    register(&mut listener, "sports").await;

    send(
        &mut listener,
        Message::AddSubscriptionRequest(AddSubscriptionRequest {
            request_id: "s1".into(),
            subscription: Subscription::prefix("news.", "sports"),
        }),
    )
    .await;
    let Message::AddSubscriptionResponse(ack) = recv(&mut listener).await else {
        panic!("expected subscription response");
    };
    assert!(ack.success);
    assert!(ack.subscription_id.is_some());

    send(
        &mut publisher,
        Message::Event(Event::new(
            &TopicId::new("news.sports", "wire"),
            Payload::text("text", "goal"),
        )),
    )
    .await;

    let Message::Event(event) = recv(&mut listener).await else {
        panic!("expected an event");
    };
    assert_eq!(event.topic_type, "news.sports");
    assert_eq!(event.recipients, vec!["sports".to_string()]);
}

// ============================================================================
// Lifecycle and HTTP
// ============================================================================

#[tokio::test]
async fn disconnect_releases_agent_types() {
    let addr = start_gateway().await;
    let mut host = connect(addr).await;
    register(&mut host, "echo").await;
    assert_eq!(health(addr).await["agentTypes"], 1);

    host.close(None).await.unwrap();
    let mut released = false;
    for _ in 0..50 {
        if health(addr).await["agentTypes"] == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "agent type still registered after disconnect");

    // The type can be claimed again by a new host.
    let mut replacement = connect(addr).await;
    register(&mut replacement, "echo").await;
}

#[tokio::test]
async fn state_endpoints_enforce_etags() {
    let addr = start_gateway().await;
    let client = reqwest::Client::new();
    let agent = serde_json::json!({ "type": "counter", "key": "1" });

    let created: serde_json::Value = client
        .post(format!("http://{addr}/state/save"))
        .json(&serde_json::json!({
            "agentId": agent,
            "etag": "",
            "data": { "kind": "text", "value": "1" },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["success"], true);
    let etag = created["etag"].as_str().unwrap().to_string();

    let stale: serde_json::Value = client
        .post(format!("http://{addr}/state/save"))
        .json(&serde_json::json!({
            "agentId": agent,
            "etag": "not-the-etag",
            "data": { "kind": "text", "value": "2" },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stale["success"], false);
    assert_eq!(stale["errorCode"], "ETAG_MISMATCH");

    let got: serde_json::Value = client
        .post(format!("http://{addr}/state/get"))
        .json(&agent)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(got["success"], true);
    assert_eq!(got["agentState"]["etag"], etag.as_str());
    assert_eq!(got["agentState"]["data"]["value"], "1");
}
