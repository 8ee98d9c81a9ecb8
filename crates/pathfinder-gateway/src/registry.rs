//! Connection registry: every live browser and robot socket, plus the
//! long-lived robot records they attach to.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pathfinder_core::error::RelayError;
use pathfinder_core::protocol::{GatewayFrame, RegisterParams};
use pathfinder_core::types::{ConnectionId, ConnectionKind, RobotId, RobotStatus};

/// A live WebSocket connection. Destroyed on disconnect.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub kind: ConnectionKind,
    pub created_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<String>,
}

impl Connection {
    /// Queue a frame for this connection's writer task. Returns false if the
    /// socket is already gone.
    pub fn send(&self, frame: &GatewayFrame) -> bool {
        match frame.to_json() {
            Ok(json) => self.tx.send(json).is_ok(),
            Err(e) => {
                error!(conn_id = %self.id, %e, "Failed to serialize frame");
                false
            }
        }
    }
}

/// Everything the coordinator knows about a robot.
///
/// Records outlive their connections; only an explicit unregister removes one.
#[derive(Debug, Clone, Serialize)]
pub struct RobotRecord {
    pub robot_id: RobotId,
    pub display_name: String,
    pub connection_id: Option<ConnectionId>,
    pub status: RobotStatus,
    pub hardware_capable: bool,
    pub firmware_version: String,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub needs_update: bool,
    pub registered_at: DateTime<Utc>,
}

impl RobotRecord {
    pub fn is_connected(&self) -> bool {
        self.connection_id.is_some()
    }
}

/// Outcome of a robot `register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// First time this robot id was seen.
    pub created: bool,
    /// The robot was not online before this registration.
    pub came_online: bool,
    /// A previous connection that was holding this robot id.
    pub detached: Option<ConnectionId>,
    /// Robot id this socket held before re-registering under a new one. That
    /// robot is now offline.
    pub released: Option<RobotId>,
}

/// What a deregistered connection leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    Browser,
    Robot {
        robot_id: Option<RobotId>,
        went_offline: bool,
    },
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    robots: HashMap<RobotId, RobotRecord>,
    attached: HashMap<ConnectionId, RobotId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection and return its id.
    pub fn register(
        &mut self,
        kind: ConnectionKind,
        tx: mpsc::UnboundedSender<String>,
    ) -> ConnectionId {
        let id = Uuid::new_v4().to_string();
        self.connections.insert(
            id.clone(),
            Connection {
                id: id.clone(),
                kind,
                created_at: Utc::now(),
                tx,
            },
        );
        debug!(conn_id = %id, kind = kind.as_str(), "Connection registered");
        id
    }

    pub fn lookup(&self, id: &str) -> Result<&Connection, RelayError> {
        self.connections
            .get(id)
            .ok_or_else(|| RelayError::NotFound(format!("Connection {id}")))
    }

    /// Forget a connection. A robot connection leaves its record in place,
    /// marked offline with its historical fields intact.
    pub fn deregister(&mut self, id: &str) -> Option<Departure> {
        let conn = self.connections.remove(id)?;
        match conn.kind {
            ConnectionKind::Browser => Some(Departure::Browser),
            ConnectionKind::Robot => {
                let robot_id = self.attached.remove(id);
                let mut went_offline = false;
                if let Some(record) = robot_id.as_ref().and_then(|r| self.robots.get_mut(r)) {
                    if record.connection_id.as_deref() == Some(id) {
                        record.connection_id = None;
                        went_offline = record.status != RobotStatus::Offline;
                        record.status = RobotStatus::Offline;
                        info!(robot_id = %record.robot_id, conn_id = %id, "Robot disconnected");
                    }
                }
                Some(Departure::Robot {
                    robot_id,
                    went_offline,
                })
            }
        }
    }

    /// Attach a robot id to a robot connection, creating or refreshing its record.
    ///
    /// A robot id already held by another connection is treated as a
    /// reconnect: the old connection is detached, never duplicated.
    pub fn register_robot(
        &mut self,
        conn_id: &str,
        params: &RegisterParams,
        now: DateTime<Utc>,
    ) -> Result<Registration, RelayError> {
        let conn = self.lookup(conn_id)?;
        if conn.kind != ConnectionKind::Robot {
            return Err(RelayError::InvalidParams(
                "register is only accepted on robot connections".into(),
            ));
        }
        if params.robot_id.trim().is_empty() {
            return Err(RelayError::InvalidParams("robot_id is required".into()));
        }

        // Same socket re-registering under a different id releases the old one
        let mut released = None;
        if let Some(previous) = self.attached.get(conn_id).cloned() {
            if previous != params.robot_id {
                if let Some(record) = self.robots.get_mut(&previous) {
                    record.connection_id = None;
                    if record.status != RobotStatus::Offline {
                        record.status = RobotStatus::Offline;
                        info!(robot_id = %previous, conn_id, "Robot id released by re-registration");
                    }
                }
                released = Some(previous);
            }
        }

        let mut detached = None;
        let registration = match self.robots.get_mut(&params.robot_id) {
            Some(record) => {
                if let Some(old) = record.connection_id.as_ref().filter(|c| *c != conn_id) {
                    warn!(
                        robot_id = %params.robot_id,
                        old_conn = %old,
                        new_conn = %conn_id,
                        "Robot id re-registered from a new connection, detaching the old one"
                    );
                    self.attached.remove(old);
                    detached = Some(old.clone());
                }
                let came_online = record.status == RobotStatus::Offline;
                record.display_name = params.name.clone();
                record.hardware_capable = params.hw_enabled;
                if let Some(version) = &params.version {
                    record.firmware_version = version.clone();
                }
                record.connection_id = Some(conn_id.to_string());
                record.status = RobotStatus::Online;
                record.last_heartbeat_at = Some(now);
                Registration {
                    created: false,
                    came_online,
                    detached: detached.clone(),
                    released,
                }
            }
            None => {
                self.robots.insert(
                    params.robot_id.clone(),
                    RobotRecord {
                        robot_id: params.robot_id.clone(),
                        display_name: params.name.clone(),
                        connection_id: Some(conn_id.to_string()),
                        status: RobotStatus::Online,
                        hardware_capable: params.hw_enabled,
                        firmware_version: params.version.clone().unwrap_or_default(),
                        last_heartbeat_at: Some(now),
                        needs_update: false,
                        registered_at: now,
                    },
                );
                Registration {
                    created: true,
                    came_online: true,
                    detached: None,
                    released,
                }
            }
        };

        self.attached
            .insert(conn_id.to_string(), params.robot_id.clone());
        info!(
            robot_id = %params.robot_id,
            conn_id = %conn_id,
            name = %params.name,
            hardware = params.hw_enabled,
            created = registration.created,
            "Robot registered"
        );
        Ok(registration)
    }

    pub fn robot(&self, robot_id: &str) -> Option<&RobotRecord> {
        self.robots.get(robot_id)
    }

    pub(crate) fn robot_mut(&mut self, robot_id: &str) -> Option<&mut RobotRecord> {
        self.robots.get_mut(robot_id)
    }

    pub fn robots(&self) -> impl Iterator<Item = &RobotRecord> {
        self.robots.values()
    }

    /// Robot id currently held by a connection. Detached connections hold none.
    pub fn robot_for_connection(&self, conn_id: &str) -> Option<&RobotId> {
        self.attached.get(conn_id)
    }

    /// Explicit unregister. Returns the removed record; its connection, if
    /// any, stays open but no longer speaks for the robot.
    pub fn remove_robot(&mut self, robot_id: &str) -> Option<RobotRecord> {
        let record = self.robots.remove(robot_id)?;
        if let Some(conn_id) = &record.connection_id {
            self.attached.remove(conn_id);
        }
        info!(robot_id = %robot_id, "Robot unregistered");
        Some(record)
    }

    pub fn send_to(&self, conn_id: &str, frame: &GatewayFrame) -> bool {
        self.connections
            .get(conn_id)
            .is_some_and(|conn| conn.send(frame))
    }

    /// Send to a robot's live connection.
    pub fn send_to_robot(&self, robot_id: &str, frame: &GatewayFrame) -> Result<(), RelayError> {
        let conn_id = self
            .robots
            .get(robot_id)
            .and_then(|r| r.connection_id.as_deref())
            .ok_or_else(|| RelayError::RobotUnreachable(robot_id.to_string()))?;
        if self.send_to(conn_id, frame) {
            Ok(())
        } else {
            Err(RelayError::RobotUnreachable(robot_id.to_string()))
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn online_robot_count(&self) -> usize {
        self.robots
            .values()
            .filter(|r| r.status != RobotStatus::Offline)
            .count()
    }
}
