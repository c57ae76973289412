//! Gateway: routes RPC calls and events between connected agent hosts.
//!
//! Lifecycle:
//! 1. Load config and open the state store
//! 2. Bind the HTTP server (health, state endpoints, metrics)
//! 3. Attach the WebSocket upgrade handler, one stream per host
//!
//! Hosts register the agent types they run and the topics those types
//! subscribe to; the router then forwards requests to the owning host,
//! correlates responses, and fans events out by subscription.

pub mod error;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;
pub mod state_store;
pub mod subscriptions;
pub mod ws;

pub use {router::Router, state::GatewayState};
