//! Pathfinder wire protocol.
//!
//! Browsers and robots talk to the coordinator with JSON-over-WebSocket using
//! three frame types: Request, Response, and Event. Requests expect exactly one
//! response; events are fire-and-forget in either direction.

use serde::{Deserialize, Serialize};

/// Protocol version implemented by this workspace.
pub const PROTOCOL_VERSION: u32 = 1;

/// A wire frame: the top-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    /// Client -> Server request.
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },

    /// Server -> Client response.
    #[serde(rename = "res")]
    Response {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    /// Event, in either direction.
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl GatewayFrame {
    pub fn request(id: impl Into<String>, method: &str, params: impl Serialize) -> Self {
        GatewayFrame::Request {
            id: id.into(),
            method: method.to_string(),
            params: serde_json::to_value(params).ok(),
        }
    }

    pub fn ok(id: &str, payload: serde_json::Value) -> Self {
        GatewayFrame::Response {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: &str, code: &str, message: &str) -> Self {
        GatewayFrame::Response {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.to_string(),
                message: message.to_string(),
                details: None,
            }),
        }
    }

    /// Build an event frame. Payloads that fail to serialize become `None`.
    pub fn event(event: &str, payload: impl Serialize) -> Self {
        GatewayFrame::Event {
            event: event.to_string(),
            payload: serde_json::to_value(payload).ok(),
            seq: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Error shape returned in response frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Server hello sent as the first event on every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub policy: Policy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub conn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub max_payload: usize,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
}

/// Event and method names used on the wire.
pub mod names {
    // Robot -> coordinator
    pub const REGISTER: &str = "register";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const STDOUT: &str = "stdout";
    pub const STDERR: &str = "stderr";
    pub const FINISHED: &str = "finished";
    pub const WIDGET_TEXT: &str = "widget_text";
    pub const WIDGET_IMAGE: &str = "widget_image";

    // Browser -> coordinator
    pub const EXECUTE: &str = "execute";
    pub const STOP: &str = "stop";
    pub const GESTURE_UPDATE: &str = "gesture_update";
    pub const PID_UPDATE: &str = "pid_update";
    pub const SLIDER_UPDATE: &str = "slider_update";
    pub const ROBOTS_LIST: &str = "robots.list";
    pub const ROBOT_ASSIGN: &str = "robot.assign";
    pub const ROBOT_STATUS: &str = "robot.status";
    pub const ROBOT_UNREGISTER: &str = "robot.unregister";

    // Coordinator -> robot
    pub const SESSION_CLOSED: &str = "session_closed";

    // Coordinator -> browser
    pub const HELLO: &str = "hello";
    pub const EXECUTION_STARTED: &str = "execution_started";
    pub const EXECUTION_ERROR: &str = "execution_error";
    pub const EXECUTION_STOPPED: &str = "execution_stopped";
    pub const IMAGE_DATA: &str = "image_data";
    pub const TEXT_DATA: &str = "text_data";
    pub const ROBOT_STATUS_CHANGED: &str = "robot_status";
    pub const AUTH_ERROR: &str = "auth.error";
}

// ============================================================
// Robot -> coordinator payloads
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterParams {
    pub robot_id: String,
    #[serde(alias = "robot_name")]
    pub name: String,
    #[serde(default, alias = "hardware_enabled")]
    pub hw_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Credentials checked against `gateway.auth` before the robot is registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthParams {
    #[serde(rename = "token")]
    Token { token: String },
    #[serde(rename = "password")]
    Password { password: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub robot_id: String,
    pub needs_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatParams {
    pub robot_id: String,
    /// Set while the robot is applying a firmware update.
    #[serde(default)]
    pub updating: bool,
}

/// One console line produced by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub session_id: String,
    #[serde(alias = "output")]
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetText {
    pub session_id: String,
    pub widget_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetImage {
    pub session_id: String,
    pub widget_id: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

/// Sent by an agent that refused an `execute` (e.g. already running).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRejected {
    pub session_id: String,
    pub error: String,
}

// ============================================================
// Coordinator -> robot payloads
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteCommand {
    pub session_id: String,
    pub code: String,
}

// ============================================================
// Browser <-> coordinator payloads
// ============================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteParams {
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignParams {
    pub robot_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleOutput {
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextData {
    pub widget_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    pub widget_id: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotStatusChanged {
    pub robot_id: String,
    pub status: crate::types::RobotStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

// ============================================================
// Control updates (browser -> coordinator -> robot)
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GestureUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    #[serde(alias = "data")]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidUpdate {
    pub widget_id: String,
    #[serde(default)]
    pub p: f64,
    #[serde(default)]
    pub i: f64,
    #[serde(default)]
    pub d: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliderUpdate {
    pub widget_id: String,
    pub values: Vec<f64>,
}

/// A browser-origin control value, last-value-wins at the robot.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlUpdate {
    Gesture(GestureUpdate),
    Pid(PidUpdate),
    Slider(SliderUpdate),
}

impl ControlUpdate {
    pub fn event_name(&self) -> &'static str {
        match self {
            ControlUpdate::Gesture(_) => names::GESTURE_UPDATE,
            ControlUpdate::Pid(_) => names::PID_UPDATE,
            ControlUpdate::Slider(_) => names::SLIDER_UPDATE,
        }
    }

    /// Parse a control update from an event name and payload.
    ///
    /// Returns `None` if the event is not a control update at all.
    pub fn from_event(
        event: &str,
        payload: serde_json::Value,
    ) -> Option<serde_json::Result<Self>> {
        let parsed = match event {
            names::GESTURE_UPDATE => serde_json::from_value(payload).map(ControlUpdate::Gesture),
            names::PID_UPDATE => serde_json::from_value(payload).map(ControlUpdate::Pid),
            names::SLIDER_UPDATE => serde_json::from_value(payload).map(ControlUpdate::Slider),
            _ => return None,
        };
        Some(parsed)
    }

    /// Serialize the update with a `session_id` tag, as forwarded to robots.
    pub fn to_tagged_payload(&self, session_id: &str) -> serde_json::Value {
        let mut value = match self {
            ControlUpdate::Gesture(g) => serde_json::to_value(g),
            ControlUpdate::Pid(p) => serde_json::to_value(p),
            ControlUpdate::Slider(s) => serde_json::to_value(s),
        }
        .unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = value.as_object_mut() {
            obj.insert("session_id".into(), session_id.into());
        }
        value
    }
}

/// Serialize byte payloads as standard base64 strings inside JSON frames.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_parse() {
        let raw = r#"{"type":"req","id":"1","method":"execute","params":{"code":"print(1)"}}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).unwrap();
        match frame {
            GatewayFrame::Request { id, method, params } => {
                assert_eq!(id, "1");
                assert_eq!(method, "execute");
                let params: ExecuteParams = serde_json::from_value(params.unwrap()).unwrap();
                assert_eq!(params.code, "print(1)");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_error_response_shape() {
        let frame = GatewayFrame::error("7", "not_assigned", "no robot");
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "res");
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "not_assigned");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_register_accepts_legacy_field_names() {
        let params: RegisterParams = serde_json::from_value(json!({
            "robot_id": "robot_1",
            "robot_name": "Findee",
            "hardware_enabled": true
        }))
        .unwrap();
        assert_eq!(params.name, "Findee");
        assert!(params.hw_enabled);
        assert!(params.version.is_none());
        assert!(params.auth.is_none());
    }

    #[test]
    fn test_register_auth_params() {
        let params: RegisterParams = serde_json::from_value(json!({
            "robot_id": "robot_1",
            "name": "Findee",
            "auth": {"type": "token", "token": "abc"}
        }))
        .unwrap();
        assert_eq!(
            params.auth,
            Some(AuthParams::Token {
                token: "abc".into()
            })
        );
    }

    #[test]
    fn test_widget_image_bytes_are_base64() {
        let image = WidgetImage {
            session_id: "s".into(),
            widget_id: "cam".into(),
            bytes: vec![0xff, 0xd8, 0xff],
        };
        let value = serde_json::to_value(&image).unwrap();
        assert_eq!(value["bytes"], "/9j/");
        let back: WidgetImage = serde_json::from_value(value).unwrap();
        assert_eq!(back.bytes, vec![0xff, 0xd8, 0xff]);
    }

    #[test]
    fn test_control_update_from_event() {
        let update = ControlUpdate::from_event(
            names::PID_UPDATE,
            json!({"widget_id": "pid1", "p": 1.5, "i": 0.1}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            update,
            ControlUpdate::Pid(PidUpdate {
                widget_id: "pid1".into(),
                p: 1.5,
                i: 0.1,
                d: 0.0
            })
        );
        assert!(ControlUpdate::from_event("stdout", json!({})).is_none());
        assert!(
            ControlUpdate::from_event(names::SLIDER_UPDATE, json!({"widget_id": "s"}))
                .unwrap()
                .is_err()
        );
    }

    #[test]
    fn test_control_update_tagged_payload() {
        let update = ControlUpdate::Gesture(GestureUpdate {
            widget_id: None,
            value: json!({"gesture": "fist"}),
        });
        let tagged = update.to_tagged_payload("sid1");
        assert_eq!(tagged["session_id"], "sid1");
        assert_eq!(tagged["value"]["gesture"], "fist");
    }
}
