//! Shared domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ConnectionId = String;
pub type SessionId = String;
pub type RobotId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Browser,
    Robot,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Browser => "browser",
            ConnectionKind::Robot => "robot",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    Online,
    #[default]
    Offline,
    Updating,
}

/// Coordinator-side view of a session's job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    StopRequested,
    Finished,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// The user behind a browser connection, as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub role: Role,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".into(),
            username: "anonymous".into(),
            role: Role::User,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// A robot as shown in the browser's robot list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotSummary {
    pub robot_id: RobotId,
    pub name: String,
    pub online: bool,
    pub assigned: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub hardware_enabled: bool,
    pub robot_version: String,
    pub needs_update: bool,
}

/// Display name used for robots known only to the assignment store.
pub fn fallback_robot_name(robot_id: &str) -> String {
    let short: String = robot_id.chars().take(8).collect();
    format!("Robot {short}")
}

/// Generate a fresh robot id of the form `robot_<8 hex>`.
pub fn generate_robot_id() -> RobotId {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("robot_{}", &hex[..8])
}
