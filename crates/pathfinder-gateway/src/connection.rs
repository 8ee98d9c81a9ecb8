//! WebSocket connection lifecycle for both peer populations: browsers on
//! `/ws` and robots on `/robot`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use pathfinder_core::config::Config;
use pathfinder_core::identity::constant_time_eq;
use pathfinder_core::protocol::{
    names, AuthParams, ControlUpdate, ErrorShape, Features, GatewayFrame, HeartbeatParams,
    HelloOk, Policy, RegisterParams, RobotStatusChanged, ServerInfo, PROTOCOL_VERSION,
};
use pathfinder_core::types::ConnectionKind;

use crate::methods::{dispatch_browser, dispatch_robot, BrowserContext, BROWSER_METHODS, ROBOT_METHODS};
use crate::relay::Telemetry;
use crate::state::GatewayState;

/// Largest frame accepted on either endpoint. Camera frames travel as base64.
pub const MAX_PAYLOAD: usize = 8 * 1024 * 1024;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

const BROWSER_EVENTS: &[&str] = &[
    names::EXECUTION_STARTED,
    names::EXECUTION_ERROR,
    names::EXECUTION_STOPPED,
    names::STDOUT,
    names::STDERR,
    names::FINISHED,
    names::IMAGE_DATA,
    names::TEXT_DATA,
    names::ROBOT_STATUS_CHANGED,
];

const ROBOT_EVENTS: &[&str] = &[
    names::EXECUTE,
    names::STOP,
    names::GESTURE_UPDATE,
    names::PID_UPDATE,
    names::SLIDER_UPDATE,
];

type WsSink = SplitSink<WebSocket, Message>;

/// Determine the robot auth mode from config.
fn auth_mode(config: &Config) -> &str {
    config
        .gateway
        .as_ref()
        .and_then(|g| g.auth.as_ref())
        .map(|a| a.effective_mode())
        .unwrap_or("none")
}

/// Authenticate a robot using the credentials carried in its `register`.
fn authenticate(config: &Config, auth: Option<&AuthParams>) -> Result<(), String> {
    let auth_config = config.gateway.as_ref().and_then(|g| g.auth.as_ref());

    match auth_mode(config) {
        "none" => Ok(()),
        "token" => {
            let expected = auth_config
                .and_then(|a| a.resolve_token())
                .ok_or_else(|| "Server token not configured".to_string())?;
            match auth {
                Some(AuthParams::Token { token }) if constant_time_eq(token, &expected) => Ok(()),
                Some(AuthParams::Token { .. }) => Err("Invalid token".to_string()),
                _ => Err("Token authentication required".to_string()),
            }
        }
        "password" => {
            let expected = auth_config
                .and_then(|a| a.resolve_password())
                .ok_or_else(|| "Server password not configured".to_string())?;
            match auth {
                Some(AuthParams::Password { password }) => {
                    let expected_hash = format!("{:x}", Sha256::digest(expected.as_bytes()));
                    let provided_hash = format!("{:x}", Sha256::digest(password.as_bytes()));
                    if constant_time_eq(&provided_hash, &expected_hash) {
                        Ok(())
                    } else {
                        Err("Invalid password".to_string())
                    }
                }
                _ => Err("Password authentication required".to_string()),
            }
        }
        other => Err(format!("Unknown auth mode: {other}")),
    }
}

fn hello_frame(state: &GatewayState, conn_id: &str, kind: ConnectionKind) -> GatewayFrame {
    let (methods, events) = match kind {
        ConnectionKind::Browser => (BROWSER_METHODS, BROWSER_EVENTS),
        ConnectionKind::Robot => (ROBOT_METHODS, ROBOT_EVENTS),
    };
    let hello = HelloOk {
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            conn_id: conn_id.to_string(),
        },
        features: Features {
            methods: methods.iter().map(|m| m.to_string()).collect(),
            events: events.iter().map(|e| e.to_string()).collect(),
        },
        policy: Policy {
            max_payload: MAX_PAYLOAD,
            heartbeat_interval_ms: state.config.agent().heartbeat_interval_secs * 1000,
            heartbeat_timeout_ms: state.config.liveness().heartbeat_timeout_secs * 1000,
        },
    };
    GatewayFrame::Event {
        event: names::HELLO.into(),
        payload: serde_json::to_value(&hello).ok(),
        seq: Some(0),
    }
}

async fn send_frame(ws_tx: &mut WsSink, frame: &GatewayFrame) -> bool {
    match frame.to_json() {
        Ok(msg) => ws_tx.send(Message::Text(msg.into())).await.is_ok(),
        Err(e) => {
            error!(%e, "Failed to serialize frame");
            false
        }
    }
}

fn parse_error_frame(e: &serde_json::Error) -> GatewayFrame {
    GatewayFrame::Response {
        id: "unknown".into(),
        ok: false,
        payload: None,
        error: Some(ErrorShape {
            code: "parse_error".into(),
            message: format!("Invalid frame: {e}"),
            details: None,
        }),
    }
}

/// Forward queued frames to the socket until either side goes away.
fn spawn_writer(mut ws_tx: WsSink, mut event_rx: mpsc::UnboundedReceiver<String>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = event_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    })
}

/// Handle a browser WebSocket. `token` comes from the upgrade request.
pub async fn handle_browser_connection(state: Arc<GatewayState>, ws: WebSocket, token: Option<String>) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let Some(identity) = state.identity.identify(token.as_deref()).await else {
        warn!("Browser connection rejected by identity provider");
        let frame = GatewayFrame::event(
            names::AUTH_ERROR,
            serde_json::json!({ "code": "unauthorized", "message": "Unknown or missing token" }),
        );
        send_frame(&mut ws_tx, &frame).await;
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel::<String>();

    // Stored assignments are read before taking the lock
    let assigned = state.assignments.get_assigned_robots(&identity.user_id);

    let session_id = {
        let mut guard = state.coordinator.write().await;
        let coordinator = &mut *guard;
        let session_id = coordinator.open_session(identity.clone(), event_tx.clone());

        // Auto-bind to the most recently assigned robot the registry knows
        if let Some(robot_id) = assigned
            .iter()
            .rev()
            .find(|r| coordinator.registry.robot(r).is_some())
        {
            if coordinator
                .bindings
                .assign(&session_id, robot_id, &coordinator.registry)
                .is_ok()
            {
                if let Some(record) = coordinator.registry.robot(robot_id) {
                    coordinator.send_to_session(
                        &session_id,
                        &GatewayFrame::event(
                            names::ROBOT_STATUS_CHANGED,
                            RobotStatusChanged {
                                robot_id: robot_id.clone(),
                                status: record.status,
                            },
                        ),
                    );
                }
                debug!(session_id = %session_id, robot_id = %robot_id, "Session auto-bound");
            }
        }
        session_id
    };

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect(ConnectionKind::Browser.as_str());

    if !send_frame(&mut ws_tx, &hello_frame(&state, &session_id, ConnectionKind::Browser)).await {
        state.coordinator.write().await.close_session(&session_id);
        return;
    }

    let ctx = BrowserContext {
        session_id: session_id.clone(),
        identity,
    };
    let send_task = spawn_writer(ws_tx, event_rx);

    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<GatewayFrame>(text.as_str()) {
                Ok(GatewayFrame::Request { id, method, params }) => {
                    let response = dispatch_browser(&state, &ctx, &id, &method, params).await;
                    if let Ok(response_json) = response.to_json() {
                        let _ = event_tx.send(response_json);
                    }
                }
                Ok(GatewayFrame::Event { event, payload, .. }) => {
                    handle_browser_event(&state, &ctx, &event, payload).await;
                }
                Ok(_) => debug!("Received response frame from browser, ignoring"),
                Err(e) => {
                    warn!(%e, "Invalid frame received");
                    if let Ok(msg) = parse_error_frame(&e).to_json() {
                        let _ = event_tx.send(msg);
                    }
                }
            },
            Ok(Message::Close(_)) => {
                debug!(session_id = %session_id, "Browser requested close");
                break;
            }
            Err(e) => {
                error!(session_id = %session_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    state.coordinator.write().await.close_session(&session_id);

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect(ConnectionKind::Browser.as_str());

    info!(session_id = %session_id, "Browser connection closed");
}

async fn handle_browser_event(
    state: &Arc<GatewayState>,
    ctx: &BrowserContext,
    event: &str,
    payload: Option<serde_json::Value>,
) {
    let payload = payload.unwrap_or_else(|| serde_json::json!({}));
    match ControlUpdate::from_event(event, payload) {
        Some(Ok(update)) => {
            let coordinator = state.coordinator.read().await;
            if let Err(e) = coordinator.forward_control(&ctx.session_id, &update) {
                debug!(session_id = %ctx.session_id, event, %e, "Control update not forwarded");
            }
        }
        Some(Err(e)) => warn!(session_id = %ctx.session_id, event, %e, "Malformed control update"),
        None => debug!(session_id = %ctx.session_id, event, "Unknown browser event"),
    }
}

/// Handle a robot WebSocket. The first frame must be a `register` request.
pub async fn handle_robot_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<String>();

    let conn_id = state
        .coordinator
        .write()
        .await
        .open_robot_connection(event_tx.clone());
    info!(conn_id = %conn_id, "New robot connection");

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect(ConnectionKind::Robot.as_str());

    let registered = if send_frame(&mut ws_tx, &hello_frame(&state, &conn_id, ConnectionKind::Robot)).await {
        match tokio::time::timeout(REGISTER_TIMEOUT, wait_for_register(&state, &conn_id, &mut ws_rx)).await {
            Ok(Ok(ack)) => send_frame(&mut ws_tx, &ack).await,
            Ok(Err(Some(rejection))) => {
                warn!(conn_id = %conn_id, "Robot registration rejected");
                send_frame(&mut ws_tx, &rejection).await;
                let _ = ws_tx.send(Message::Close(None)).await;
                false
            }
            Ok(Err(None)) => false,
            Err(_) => {
                warn!(conn_id = %conn_id, "Robot registration timeout");
                let _ = ws_tx.send(Message::Close(None)).await;
                false
            }
        }
    } else {
        false
    };

    if registered {
        let send_task = spawn_writer(ws_tx, event_rx);
        robot_read_loop(&state, &conn_id, &mut ws_rx, &event_tx).await;
        send_task.abort();
    }

    state.coordinator.write().await.close_robot_connection(&conn_id);

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_ws_disconnect(ConnectionKind::Robot.as_str());
        crate::metrics::set_robots_online(state.coordinator.read().await.registry.online_robot_count());
    }

    info!(conn_id = %conn_id, "Robot connection closed");
}

/// Wait for the robot's `register` request, authenticate it, and register.
///
/// `Err(Some(frame))` carries a response to send before closing;
/// `Err(None)` means the socket went away.
async fn wait_for_register(
    state: &Arc<GatewayState>,
    conn_id: &str,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<GatewayFrame, Option<GatewayFrame>> {
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let (id, params) = match serde_json::from_str::<GatewayFrame>(text.as_str()) {
                    Ok(GatewayFrame::Request { id, method, params }) if method == names::REGISTER => {
                        (id, params)
                    }
                    Ok(_) => {
                        debug!(conn_id, "Received non-register frame during handshake");
                        return Err(Some(GatewayFrame::error(
                            "unknown",
                            "unauthorized",
                            "Expected register request",
                        )));
                    }
                    Err(e) => return Err(Some(parse_error_frame(&e))),
                };

                let auth = params
                    .as_ref()
                    .and_then(|p| serde_json::from_value::<RegisterParams>(p.clone()).ok())
                    .and_then(|p| p.auth);
                if let Err(reason) = authenticate(&state.config, auth.as_ref()) {
                    warn!(conn_id, %reason, "Robot authentication failed");
                    return Err(Some(GatewayFrame::error(&id, "unauthorized", &reason)));
                }

                let ack = dispatch_robot(state, conn_id, &id, names::REGISTER, params).await;
                return match ack {
                    GatewayFrame::Response { ok: true, .. } => Ok(ack),
                    rejected => Err(Some(rejected)),
                };
            }
            Ok(Message::Close(_)) | Err(_) => return Err(None),
            _ => continue,
        }
    }
    Err(None)
}

async fn robot_read_loop(
    state: &Arc<GatewayState>,
    conn_id: &str,
    ws_rx: &mut SplitStream<WebSocket>,
    event_tx: &mpsc::UnboundedSender<String>,
) {
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<GatewayFrame>(text.as_str()) {
                Ok(GatewayFrame::Event { event, payload, .. }) => {
                    handle_robot_event(state, conn_id, &event, payload).await;
                }
                Ok(GatewayFrame::Request { id, method, params }) => {
                    let response = dispatch_robot(state, conn_id, &id, &method, params).await;
                    if let Ok(json) = response.to_json() {
                        let _ = event_tx.send(json);
                    }
                }
                Ok(_) => debug!(conn_id, "Received response frame from robot, ignoring"),
                Err(e) => {
                    warn!(conn_id, %e, "Invalid frame received from robot");
                    if let Ok(msg) = parse_error_frame(&e).to_json() {
                        let _ = event_tx.send(msg);
                    }
                }
            },
            Ok(Message::Close(_)) => {
                debug!(conn_id, "Robot requested close");
                break;
            }
            Err(e) => {
                error!(conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }
}

async fn handle_robot_event(
    state: &Arc<GatewayState>,
    conn_id: &str,
    event: &str,
    payload: Option<serde_json::Value>,
) {
    let payload = payload.unwrap_or_else(|| serde_json::json!({}));

    if event == names::HEARTBEAT {
        let heartbeat: HeartbeatParams = match serde_json::from_value(payload) {
            Ok(h) => h,
            Err(e) => {
                warn!(conn_id, %e, "Malformed heartbeat");
                return;
            }
        };
        let mut coordinator = state.coordinator.write().await;
        if coordinator.registry.robot_for_connection(conn_id) != Some(&heartbeat.robot_id) {
            warn!(conn_id, robot_id = %heartbeat.robot_id, "Heartbeat for a robot id this connection does not hold");
            return;
        }
        let now = chrono::Utc::now();
        let result = if heartbeat.updating {
            coordinator.mark_updating(&heartbeat.robot_id, now)
        } else {
            coordinator.ingest_heartbeat(&heartbeat.robot_id, now).map(|_| ())
        };
        if let Err(e) = result {
            debug!(conn_id, %e, "Heartbeat ignored");
        }
        return;
    }

    match Telemetry::from_event(event, payload) {
        Some(Ok((session_id, telemetry))) => {
            state.coordinator.write().await.emit(conn_id, &session_id, telemetry);
        }
        Some(Err(e)) => warn!(conn_id, event, %e, "Malformed telemetry"),
        None => debug!(conn_id, event, "Unknown robot event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathfinder_core::config::{GatewayAuthConfig, GatewayConfig};

    fn make_config_with_auth(mode: &str, token: Option<&str>, password: Option<&str>) -> Config {
        Config {
            gateway: Some(GatewayConfig {
                port: 5000,
                bind: None,
                auth: Some(GatewayAuthConfig {
                    mode: Some(mode.to_string()),
                    token: token.map(|s| s.to_string()),
                    token_env: None,
                    password: password.map(|s| s.to_string()),
                    password_env: None,
                }),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_auth_mode_none() {
        let config = make_config_with_auth("none", None, None);
        assert!(authenticate(&config, None).is_ok());
        assert!(authenticate(&Config::default(), None).is_ok());
    }

    #[test]
    fn test_auth_token() {
        let config = make_config_with_auth("token", Some("robot-secret"), None);
        let good = AuthParams::Token {
            token: "robot-secret".into(),
        };
        let bad = AuthParams::Token {
            token: "wrong".into(),
        };
        assert!(authenticate(&config, Some(&good)).is_ok());
        assert_eq!(authenticate(&config, Some(&bad)).unwrap_err(), "Invalid token");
        assert!(authenticate(&config, None).is_err());
    }

    #[test]
    fn test_auth_password() {
        let config = make_config_with_auth("password", None, Some("hunter2"));
        let good = AuthParams::Password {
            password: "hunter2".into(),
        };
        let wrong_kind = AuthParams::Token {
            token: "hunter2".into(),
        };
        assert!(authenticate(&config, Some(&good)).is_ok());
        assert!(authenticate(&config, Some(&wrong_kind)).is_err());
    }

    #[test]
    fn test_auth_unknown_mode() {
        let config = make_config_with_auth("mtls", None, None);
        assert!(authenticate(&config, None).unwrap_err().contains("mtls"));
    }
}
