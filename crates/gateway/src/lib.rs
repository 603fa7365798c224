//! WebSocket gateway: accepts connections, drives the per-connection
//! session state machine, and bridges frames into the replication engine.

pub mod auth;
pub mod broadcast;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod ws;

pub use server::{build_gateway_app, start_gateway};
pub use state::GatewayState;
