//! Pathfinder robot agent.
//!
//! Runs user-submitted Lua programs in a restricted interpreter, one worker
//! thread per job, and streams their console output and widget telemetry back
//! to the coordinator as it is produced.

pub mod client;
pub mod error;
pub mod hardware;
pub mod sandbox;
pub mod telemetry;
pub mod widgets;

pub use client::run_agent;
pub use error::SandboxError;
pub use sandbox::Sandbox;
pub use telemetry::AgentEvent;
pub use widgets::WidgetChannelState;
