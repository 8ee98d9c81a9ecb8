//! Events produced by running jobs, addressed to the session that started them.

use serde::{Deserialize, Serialize};

use pathfinder_core::protocol::{
    ConsoleLine, ExecutionRejected, GatewayFrame, SessionRef, WidgetImage, WidgetText, base64_bytes,
    names,
};

/// Outbound telemetry from a sandboxed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Stdout {
        session_id: String,
        line: String,
    },
    Stderr {
        session_id: String,
        line: String,
    },
    WidgetText {
        session_id: String,
        widget_id: String,
        text: String,
    },
    WidgetImage {
        session_id: String,
        widget_id: String,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
    /// Terminal event; exactly one per job.
    Finished {
        session_id: String,
    },
    /// The agent refused to start a job.
    ExecutionError {
        session_id: String,
        error: String,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> &str {
        match self {
            AgentEvent::Stdout { session_id, .. }
            | AgentEvent::Stderr { session_id, .. }
            | AgentEvent::WidgetText { session_id, .. }
            | AgentEvent::WidgetImage { session_id, .. }
            | AgentEvent::Finished { session_id }
            | AgentEvent::ExecutionError { session_id, .. } => session_id,
        }
    }

    /// Wire frame sent to the coordinator for this event.
    pub fn to_frame(&self) -> GatewayFrame {
        match self.clone() {
            AgentEvent::Stdout { session_id, line } => {
                GatewayFrame::event(names::STDOUT, ConsoleLine { session_id, line })
            }
            AgentEvent::Stderr { session_id, line } => {
                GatewayFrame::event(names::STDERR, ConsoleLine { session_id, line })
            }
            AgentEvent::WidgetText {
                session_id,
                widget_id,
                text,
            } => GatewayFrame::event(
                names::WIDGET_TEXT,
                WidgetText {
                    session_id,
                    widget_id,
                    text,
                },
            ),
            AgentEvent::WidgetImage {
                session_id,
                widget_id,
                bytes,
            } => GatewayFrame::event(
                names::WIDGET_IMAGE,
                WidgetImage {
                    session_id,
                    widget_id,
                    bytes,
                },
            ),
            AgentEvent::Finished { session_id } => {
                GatewayFrame::event(names::FINISHED, SessionRef { session_id })
            }
            AgentEvent::ExecutionError { session_id, error } => GatewayFrame::event(
                names::EXECUTION_ERROR,
                ExecutionRejected { session_id, error },
            ),
        }
    }
}
