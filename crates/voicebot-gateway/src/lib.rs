//! WebSocket gateway bridging telephony media streams to a greeting pipeline.

pub mod auth;
pub mod calls;
pub mod connection;
pub mod greeting;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod outbound;
pub mod server;
pub mod state;
pub mod webhook;

pub use server::start_gateway;
pub use state::GatewayState;
