//! Coordinator connection.
//!
//! Connects to `{server_url}/robot`, waits for `hello`, registers, then runs
//! one loop that sends heartbeats, forwards sandbox telemetry, and dispatches
//! `execute`/`stop`/control events from the coordinator. When the connection
//! drops, running jobs are cancelled and the agent reconnects after a fixed
//! delay under the same robot id.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pathfinder_core::config::{AgentConfig, Config, SandboxConfig, robot_id_path};
use pathfinder_core::protocol::{
    AuthParams, ControlUpdate, ExecuteCommand, GatewayFrame, HeartbeatParams, RegisterAck,
    RegisterParams, SessionRef, names,
};
use pathfinder_core::types::generate_robot_id;

use crate::error::SandboxError;
use crate::hardware::Hardware;
use crate::sandbox::Sandbox;
use crate::telemetry::AgentEvent;
use crate::widgets::WidgetChannelState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsError = tokio_tungstenite::tungstenite::Error;

enum ConnectionExit {
    Shutdown,
    Disconnected,
}

/// A robot agent: one sandbox plus the connection that feeds it.
pub struct AgentClient {
    config: AgentConfig,
    robot_id: String,
    sandbox: Sandbox,
    events: mpsc::UnboundedReceiver<AgentEvent>,
}

impl AgentClient {
    pub fn new(
        config: AgentConfig,
        sandbox_config: SandboxConfig,
        hardware: Option<Arc<dyn Hardware>>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let sandbox = Sandbox::new(sandbox_config, WidgetChannelState::new(), hardware, events_tx);
        let robot_id = config.robot_id.clone().unwrap_or_else(generate_robot_id);
        Self {
            config,
            robot_id,
            sandbox,
            events,
        }
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Stay connected until `shutdown` fires, reconnecting after every drop.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let AgentClient {
            config,
            robot_id,
            sandbox,
            mut events,
        } = self;
        let delay = Duration::from_secs(config.reconnect_delay_secs.max(1));

        info!(
            robot_id = %robot_id,
            name = %config.robot_name,
            hardware = sandbox.has_hardware(),
            "Agent starting"
        );

        loop {
            match run_connection(&config, &robot_id, &sandbox, &mut events, &shutdown).await {
                Ok(ConnectionExit::Shutdown) => break,
                Ok(ConnectionExit::Disconnected) => info!("Disconnected from coordinator"),
                Err(e) => warn!("Coordinator connection failed: {e:#}"),
            }

            sandbox.cancel_all();
            sandbox.widgets().clear();
            info!("Reconnecting in {}s", delay.as_secs());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        sandbox.cancel_all();
        info!("Agent stopped");
        Ok(())
    }
}

/// Build an agent from the config file's `agent` and `sandbox` sections and
/// run it until `shutdown` fires. Without a configured `robot_id` the agent
/// reuses the one stored under the data dir, so restarts keep its identity.
pub async fn run_agent(
    config: &Config,
    hardware: Option<Arc<dyn Hardware>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut agent = config.agent();
    agent.robot_id = Some(config.resolve_robot_id(&robot_id_path())?);
    AgentClient::new(agent, config.sandbox(), hardware)
        .run(shutdown)
        .await
}

/// WebSocket URL of the coordinator's robot endpoint.
pub fn robot_endpoint(server_url: &str) -> String {
    let url = server_url.trim_end_matches('/');
    let url = if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    };
    if url.ends_with("/robot") {
        url
    } else {
        format!("{url}/robot")
    }
}

async fn run_connection(
    config: &AgentConfig,
    robot_id: &str,
    sandbox: &Sandbox,
    events: &mut mpsc::UnboundedReceiver<AgentEvent>,
    shutdown: &CancellationToken,
) -> anyhow::Result<ConnectionExit> {
    let url = robot_endpoint(&config.server_url);
    info!(url = %url, robot_id, "Connecting to coordinator");

    let (ws, _) = tokio::select! {
        _ = shutdown.cancelled() => return Ok(ConnectionExit::Shutdown),
        result = connect_async(url.as_str()) => result.with_context(|| format!("connect to {url}"))?,
    };
    let (mut sink, mut stream) = ws.split();

    let pending = take_pending_finished(events);

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, next_frame(&mut stream)).await {
        Ok(Some(GatewayFrame::Event { event, .. })) if event == names::HELLO => {
            debug!("Received hello");
        }
        Ok(Some(other)) => bail!("expected hello, got {other:?}"),
        Ok(None) => bail!("connection closed before hello"),
        Err(_) => bail!("timed out waiting for hello"),
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let params = RegisterParams {
        robot_id: robot_id.to_string(),
        name: config.robot_name.clone(),
        hw_enabled: sandbox.has_hardware(),
        version: Some(config.robot_version.clone()),
        auth: config.resolve_token().map(|token| AuthParams::Token { token }),
    };
    send(&mut sink, &GatewayFrame::request(request_id.clone(), names::REGISTER, params)).await?;

    let ack = tokio::time::timeout(HANDSHAKE_TIMEOUT, wait_for_response(&mut stream, &request_id))
        .await
        .context("timed out waiting for registration")??;
    if ack.needs_update {
        warn!(
            version = %config.robot_version,
            latest = ack.latest_version.as_deref().unwrap_or("unknown"),
            "Coordinator reports this robot is out of date"
        );
    }
    info!(robot_id = %ack.robot_id, "Registered with coordinator");

    for event in &pending {
        send(&mut sink, &event.to_frame()).await?;
    }

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(ConnectionExit::Shutdown);
            }

            _ = heartbeat.tick() => {
                let frame = GatewayFrame::event(
                    names::HEARTBEAT,
                    HeartbeatParams { robot_id: robot_id.to_string(), updating: false },
                );
                send(&mut sink, &frame).await?;
            }

            Some(event) = events.recv() => {
                send(&mut sink, &event.to_frame()).await?;
            }

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<GatewayFrame>(text.as_str()) {
                        Ok(frame) => {
                            if let Some(reply) = handle_frame(sandbox, frame) {
                                send(&mut sink, &reply).await?;
                            }
                        }
                        Err(e) => warn!(%e, "Ignoring malformed frame from coordinator"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(ConnectionExit::Disconnected),
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            },
        }
    }
}

/// Drain telemetry queued while disconnected. Output lines have nowhere to
/// go, but every job's `finished` is kept so it still gets reported.
fn take_pending_finished(events: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut pending = Vec::new();
    while let Ok(event) = events.try_recv() {
        if matches!(event, AgentEvent::Finished { .. }) {
            pending.push(event);
        }
    }
    pending
}

/// Act on one coordinator frame; returns a frame to send back, if any.
fn handle_frame(sandbox: &Sandbox, frame: GatewayFrame) -> Option<GatewayFrame> {
    let GatewayFrame::Event { event, payload, .. } = frame else {
        debug!("Ignoring non-event frame");
        return None;
    };
    let payload = payload.unwrap_or(serde_json::Value::Null);

    match event.as_str() {
        names::EXECUTE => {
            let cmd: ExecuteCommand = match serde_json::from_value(payload) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!(%e, "Malformed execute command");
                    return None;
                }
            };
            match sandbox.execute(&cmd.session_id, &cmd.code) {
                Ok(()) => None,
                Err(e) => {
                    warn!(session_id = %cmd.session_id, %e, "Execute rejected");
                    Some(
                        AgentEvent::ExecutionError {
                            session_id: cmd.session_id,
                            error: e.to_string(),
                        }
                        .to_frame(),
                    )
                }
            }
        }
        names::STOP => {
            let target: SessionRef = match serde_json::from_value(payload) {
                Ok(target) => target,
                Err(e) => {
                    warn!(%e, "Malformed stop command");
                    return None;
                }
            };
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                match sandbox.stop(&target.session_id).await {
                    Ok(()) => {}
                    Err(SandboxError::NotRunning(_)) => {
                        debug!(session_id = %target.session_id, "Stop for a session with no job");
                    }
                    Err(e) => warn!(session_id = %target.session_id, %e, "Stop incomplete"),
                }
            });
            None
        }
        names::SESSION_CLOSED => {
            match serde_json::from_value::<SessionRef>(payload) {
                Ok(target) => {
                    if sandbox.widgets().remove_session(&target.session_id) {
                        debug!(session_id = %target.session_id, "Cleared widget state for closed session");
                    }
                }
                Err(e) => warn!(%e, "Malformed session_closed event"),
            }
            None
        }
        other => {
            let session_id = payload
                .get("session_id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            match ControlUpdate::from_event(other, payload) {
                Some(Ok(update)) => match session_id {
                    Some(session_id) => sandbox.widgets().apply(&session_id, &update),
                    None => warn!(event = other, "Control update without session_id"),
                },
                Some(Err(e)) => warn!(event = other, %e, "Malformed control update"),
                None => debug!(event = other, "Ignoring unknown event"),
            }
            None
        }
    }
}

async fn send<S>(sink: &mut S, frame: &GatewayFrame) -> anyhow::Result<()>
where
    S: futures::Sink<Message, Error = WsError> + Unpin,
{
    let text = frame.to_json()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Next parseable frame, or `None` once the socket closes.
async fn next_frame<St>(stream: &mut St) -> Option<GatewayFrame>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
                Ok(frame) => return Some(frame),
                Err(e) => warn!(%e, "Ignoring malformed frame from coordinator"),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

async fn wait_for_response<St>(stream: &mut St, request_id: &str) -> anyhow::Result<RegisterAck>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match next_frame(stream).await {
            Some(GatewayFrame::Response {
                id,
                ok,
                payload,
                error,
            }) if id == request_id => {
                if !ok {
                    let reason = error
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .unwrap_or_else(|| "unknown error".into());
                    bail!("registration rejected ({reason})");
                }
                let payload = payload.context("registration response has no payload")?;
                return Ok(serde_json::from_value(payload)?);
            }
            Some(other) => debug!(?other, "Skipping frame while registering"),
            None => bail!("connection closed during registration"),
        }
    }
}
