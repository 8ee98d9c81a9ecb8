//! Gateway method handlers.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use pathfinder_core::error::RelayError;
use pathfinder_core::protocol::{
    names, AssignParams, ErrorPayload, ExecuteParams, GatewayFrame, RegisterAck, RegisterParams,
};
use pathfinder_core::types::{fallback_robot_name, Identity, RobotStatus, RobotSummary};

use crate::registry::RobotRecord;
use crate::state::GatewayState;

/// Methods a browser connection may call.
pub const BROWSER_METHODS: &[&str] = &[
    names::EXECUTE,
    names::STOP,
    names::ROBOTS_LIST,
    names::ROBOT_ASSIGN,
    names::ROBOT_STATUS,
    names::ROBOT_UNREGISTER,
];

/// Methods a robot connection may call.
pub const ROBOT_METHODS: &[&str] = &[names::REGISTER];

/// Who is calling a browser method.
#[derive(Debug, Clone)]
pub struct BrowserContext {
    pub session_id: String,
    pub identity: Identity,
}

/// Dispatch a browser request and return the response frame.
pub async fn dispatch_browser(
    state: &Arc<GatewayState>,
    ctx: &BrowserContext,
    request_id: &str,
    method: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    debug!(session_id = %ctx.session_id, method, "Dispatching method");

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let response = match method {
        names::EXECUTE => handle_execute(state, ctx, request_id, params).await,
        names::STOP => handle_stop(state, ctx, request_id).await,
        names::ROBOTS_LIST => handle_robots_list(state, ctx, request_id).await,
        names::ROBOT_ASSIGN => handle_robot_assign(state, ctx, request_id, params).await,
        names::ROBOT_STATUS => handle_robot_status(state, ctx, request_id, params).await,
        names::ROBOT_UNREGISTER => handle_robot_unregister(state, ctx, request_id, params).await,
        _ => GatewayFrame::error(
            request_id,
            "method_not_found",
            &format!("Unknown method: {method}"),
        ),
    };

    #[cfg(feature = "metrics")]
    crate::metrics::record_request(method, start.elapsed().as_secs_f64());

    response
}

/// Dispatch a robot request and return the response frame.
pub async fn dispatch_robot(
    state: &Arc<GatewayState>,
    conn_id: &str,
    request_id: &str,
    method: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    debug!(conn_id, method, "Dispatching robot method");
    match method {
        names::REGISTER => match parse_params::<RegisterParams>(request_id, params) {
            Ok(params) => handle_register(state, conn_id, request_id, &params).await,
            Err(resp) => resp,
        },
        _ => GatewayFrame::error(
            request_id,
            "method_not_found",
            &format!("Unknown method: {method}"),
        ),
    }
}

fn relay_error(id: &str, err: &RelayError) -> GatewayFrame {
    GatewayFrame::error(id, err.code(), &err.to_string())
}

fn parse_params<T: serde::de::DeserializeOwned>(
    id: &str,
    params: Option<serde_json::Value>,
) -> Result<T, GatewayFrame> {
    let value = params.unwrap_or_else(|| json!({}));
    serde_json::from_value(value)
        .map_err(|e| relay_error(id, &RelayError::InvalidParams(e.to_string())))
}

async fn handle_execute(
    state: &Arc<GatewayState>,
    ctx: &BrowserContext,
    id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: ExecuteParams = match parse_params(id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let mut coordinator = state.coordinator.write().await;
    match coordinator.submit_execute(&ctx.session_id, &params.code) {
        Ok(ack) => GatewayFrame::ok(
            id,
            json!({ "status": "started", "robot_id": ack.robot_id, "robot_name": ack.robot_name }),
        ),
        Err(e) => {
            info!(session_id = %ctx.session_id, code = e.code(), "Execute rejected");
            coordinator.send_to_session(
                &ctx.session_id,
                &GatewayFrame::event(
                    names::EXECUTION_ERROR,
                    ErrorPayload {
                        error: e.to_string(),
                    },
                ),
            );
            relay_error(id, &e)
        }
    }
}

async fn handle_stop(state: &Arc<GatewayState>, ctx: &BrowserContext, id: &str) -> GatewayFrame {
    let mut coordinator = state.coordinator.write().await;
    match coordinator.submit_stop(&ctx.session_id) {
        Ok(()) => GatewayFrame::ok(id, json!({ "status": "stop_requested" })),
        Err(e) => relay_error(id, &e),
    }
}

fn summarize(record: &RobotRecord, assigned: bool) -> RobotSummary {
    RobotSummary {
        robot_id: record.robot_id.clone(),
        name: record.display_name.clone(),
        online: record.status != RobotStatus::Offline,
        assigned,
        last_seen: record.last_heartbeat_at,
        hardware_enabled: record.hardware_capable,
        robot_version: record.firmware_version.clone(),
        needs_update: record.needs_update,
    }
}

/// Robots assigned to the caller; admins also see every registered robot.
async fn handle_robots_list(
    state: &Arc<GatewayState>,
    ctx: &BrowserContext,
    id: &str,
) -> GatewayFrame {
    let assigned = state
        .assignments
        .get_assigned_robots(&ctx.identity.user_id);

    let coordinator = state.coordinator.read().await;
    let mut robots: Vec<RobotSummary> = assigned
        .iter()
        .map(|robot_id| match coordinator.registry.robot(robot_id) {
            Some(record) => summarize(record, true),
            None => RobotSummary {
                robot_id: robot_id.clone(),
                name: fallback_robot_name(robot_id),
                online: false,
                assigned: true,
                last_seen: None,
                hardware_enabled: false,
                robot_version: String::new(),
                needs_update: false,
            },
        })
        .collect();

    if ctx.identity.is_admin() {
        let mut others: Vec<RobotSummary> = coordinator
            .registry
            .robots()
            .filter(|r| !assigned.contains(&r.robot_id))
            .map(|r| summarize(r, false))
            .collect();
        others.sort_by(|a, b| a.robot_id.cmp(&b.robot_id));
        robots.extend(others);
    }

    let bound = coordinator.bindings.resolve(&ctx.session_id).cloned();
    GatewayFrame::ok(id, json!({ "robots": robots, "bound": bound }))
}

async fn handle_robot_assign(
    state: &Arc<GatewayState>,
    ctx: &BrowserContext,
    id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: AssignParams = match parse_params(id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let (name, status) = {
        let mut coordinator = state.coordinator.write().await;
        let coordinator = &mut *coordinator;
        if let Err(e) = coordinator
            .bindings
            .assign(&ctx.session_id, &params.robot_id, &coordinator.registry)
        {
            return relay_error(id, &e);
        }
        match coordinator.registry.robot(&params.robot_id) {
            Some(record) => (record.display_name.clone(), record.status),
            None => return relay_error(id, &RelayError::NotFound(format!("Robot {}", params.robot_id))),
        }
    };

    let persisted = match state
        .assignments
        .persist_assignment(&ctx.identity.user_id, &params.robot_id)
    {
        Ok(()) => true,
        Err(e) => {
            warn!(user = %ctx.identity.user_id, robot_id = %params.robot_id, %e, "Failed to persist assignment");
            false
        }
    };

    info!(session_id = %ctx.session_id, robot_id = %params.robot_id, "Robot assigned");
    GatewayFrame::ok(
        id,
        json!({
            "robot_id": params.robot_id,
            "name": name,
            "status": status,
            "persisted": persisted,
        }),
    )
}

#[derive(serde::Deserialize, Default)]
struct StatusParams {
    #[serde(default)]
    robot_id: Option<String>,
}

/// Status of the named robot, or of the session's bound robot.
async fn handle_robot_status(
    state: &Arc<GatewayState>,
    ctx: &BrowserContext,
    id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    let params: StatusParams = match parse_params(id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let coordinator = state.coordinator.read().await;
    let robot_id = match params
        .robot_id
        .or_else(|| coordinator.bindings.resolve(&ctx.session_id).cloned())
    {
        Some(r) => r,
        None => return relay_error(id, &RelayError::NotAssigned),
    };
    let Some(record) = coordinator.registry.robot(&robot_id) else {
        return relay_error(id, &RelayError::NotFound(format!("Robot {robot_id}")));
    };

    let job = coordinator
        .job(&ctx.session_id)
        .map(|j| j.status)
        .unwrap_or_default();
    let mut payload = serde_json::to_value(record).unwrap_or_else(|_| json!({}));
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("online".into(), json!(record.status != RobotStatus::Offline));
        obj.insert("job".into(), json!(job));
    }
    GatewayFrame::ok(id, payload)
}

async fn handle_robot_unregister(
    state: &Arc<GatewayState>,
    ctx: &BrowserContext,
    id: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    if !ctx.identity.is_admin() {
        return relay_error(
            id,
            &RelayError::Forbidden("robot.unregister requires the admin role".into()),
        );
    }
    let params: AssignParams = match parse_params(id, params) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let cleared = {
        let mut coordinator = state.coordinator.write().await;
        match coordinator.unregister_robot(&params.robot_id) {
            Some(cleared) => cleared,
            None => {
                return relay_error(id, &RelayError::NotFound(format!("Robot {}", params.robot_id)));
            }
        }
    };

    if let Err(e) = state.assignments.remove_robot(&params.robot_id) {
        warn!(robot_id = %params.robot_id, %e, "Failed to drop persisted assignments");
    }

    info!(robot_id = %params.robot_id, by = %ctx.identity.username, "Robot unregistered by admin");
    GatewayFrame::ok(
        id,
        json!({ "robot_id": params.robot_id, "cleared_sessions": cleared.len() }),
    )
}

async fn handle_register(
    state: &Arc<GatewayState>,
    conn_id: &str,
    id: &str,
    params: &RegisterParams,
) -> GatewayFrame {
    let latest = state.latest_robot_version();
    let mut coordinator = state.coordinator.write().await;
    if let Err(e) = coordinator.register_robot(conn_id, params, Utc::now()) {
        return relay_error(id, &e);
    }

    let needs_update = match &params.version {
        Some(version) => coordinator
            .version_check(&params.robot_id, version, latest)
            .unwrap_or(false),
        None => false,
    };

    #[cfg(feature = "metrics")]
    crate::metrics::set_robots_online(coordinator.registry.online_robot_count());

    let ack = RegisterAck {
        robot_id: params.robot_id.clone(),
        needs_update,
        latest_version: latest.map(str::to_string),
    };
    GatewayFrame::ok(id, serde_json::to_value(ack).unwrap_or_else(|_| json!({})))
}
