//! Pathfinder coordinator.
//!
//! Tracks the browser sessions and robots connected over WebSocket, binds each
//! session to at most one robot, routes execute/stop/control commands across
//! that binding, and relays robot telemetry back to the one session it is
//! addressed to.

pub mod bindings;
pub mod connection;
pub mod coordinator;
pub mod liveness;
pub mod methods;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod state;

pub use coordinator::Coordinator;
pub use server::{build_router, start_gateway, start_gateway_with_shutdown};
pub use state::GatewayState;
