//! The single owned coordination state: registry, bindings, and the
//! per-session job table.
//!
//! Every mutation happens through `&mut Coordinator`, which the gateway keeps
//! behind one lock. Routing, relaying, and liveness are `impl` blocks in their
//! own modules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use pathfinder_core::protocol::{
    names, ConsoleOutput, GatewayFrame, RegisterParams, RobotStatusChanged,
};
use pathfinder_core::types::{
    ConnectionKind, Identity, JobStatus, RobotId, RobotStatus, SessionId,
};

use crate::bindings::BindingTable;
use crate::registry::{ConnectionRegistry, Departure, Registration};

/// Coordinator-side record of code running for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionJob {
    pub session_id: SessionId,
    /// The robot the code was sent to. Stop and telemetry follow the job even
    /// if the session is rebound mid-run.
    pub robot_id: RobotId,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Coordinator {
    pub registry: ConnectionRegistry,
    pub bindings: BindingTable,
    pub(crate) jobs: HashMap<SessionId, ExecutionJob>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a browser connection and open its session. The session id is
    /// the connection id.
    pub fn open_session(
        &mut self,
        identity: Identity,
        tx: mpsc::UnboundedSender<String>,
    ) -> SessionId {
        let session_id = self.registry.register(ConnectionKind::Browser, tx);
        info!(session_id = %session_id, user = %identity.username, "Browser session opened");
        self.bindings.open(&session_id, identity);
        session_id
    }

    /// Tear down a browser session. A running job is marked stop-requested
    /// and the stop is forwarded to its robot. Every robot that held state for
    /// the session is told it closed.
    pub fn close_session(&mut self, session_id: &str) {
        let mut robots: Vec<RobotId> = Vec::new();
        if let Some(job) = self.jobs.get_mut(session_id) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::StopRequested;
                let frame = GatewayFrame::event(names::STOP, json!({ "session_id": session_id }));
                if let Err(e) = self.registry.send_to_robot(&job.robot_id, &frame) {
                    debug!(session_id, %e, "Could not forward stop for closed session");
                }
            }
            robots.push(job.robot_id.clone());
        }
        if let Some(bound) = self.bindings.resolve(session_id) {
            if !robots.contains(bound) {
                robots.push(bound.clone());
            }
        }
        let closed = GatewayFrame::event(names::SESSION_CLOSED, json!({ "session_id": session_id }));
        for robot_id in &robots {
            if let Err(e) = self.registry.send_to_robot(robot_id, &closed) {
                debug!(session_id, robot_id = %robot_id, %e, "Could not announce closed session");
            }
        }

        self.bindings.unassign(session_id);
        self.registry.deregister(session_id);
        info!(session_id, "Browser session closed");
    }

    /// Register a robot connection (before it has identified itself).
    pub fn open_robot_connection(&mut self, tx: mpsc::UnboundedSender<String>) -> String {
        self.registry.register(ConnectionKind::Robot, tx)
    }

    /// Attach a robot id to a robot connection and tell bound sessions if it
    /// came back online.
    pub fn register_robot(
        &mut self,
        conn_id: &str,
        params: &RegisterParams,
        now: DateTime<Utc>,
    ) -> Result<Registration, pathfinder_core::error::RelayError> {
        let registration = self.registry.register_robot(conn_id, params, now)?;

        // The old socket may still be half open; its jobs are gone on the robot
        if registration.detached.is_some() {
            self.finish_orphaned_jobs(&params.robot_id, "reconnected");
        }
        if let Some(released) = &registration.released {
            self.finish_orphaned_jobs(released, "disconnected");
            self.notify_status(released);
        }
        if registration.came_online {
            self.notify_status(&params.robot_id);
        }
        Ok(registration)
    }

    /// Drop a robot connection. Jobs still running on it can never report
    /// `finished`, so they are terminated here.
    pub fn close_robot_connection(&mut self, conn_id: &str) {
        let Some(Departure::Robot {
            robot_id: Some(robot_id),
            went_offline,
        }) = self.registry.deregister(conn_id)
        else {
            return;
        };

        self.finish_orphaned_jobs(&robot_id, "disconnected");

        if went_offline {
            self.notify_status(&robot_id);
        }
    }

    /// End every job running on `robot_id` with a stderr line and `finished`.
    fn finish_orphaned_jobs(&mut self, robot_id: &str, reason: &str) {
        let orphaned: Vec<SessionId> = self
            .jobs
            .values()
            .filter(|job| job.robot_id == robot_id)
            .map(|job| job.session_id.clone())
            .collect();
        for session_id in orphaned {
            self.jobs.remove(&session_id);
            info!(robot_id, session_id = %session_id, reason, "Finishing orphaned job");
            let message = format!("Robot {robot_id} {reason} during execution");
            self.send_to_session(
                &session_id,
                &GatewayFrame::event(names::STDERR, ConsoleOutput { output: message }),
            );
            self.send_to_session(&session_id, &GatewayFrame::event(names::FINISHED, json!({})));
        }
    }

    /// Remove a robot record and unbind every session that referenced it.
    pub fn unregister_robot(&mut self, robot_id: &str) -> Option<Vec<SessionId>> {
        self.registry.remove_robot(robot_id)?;
        let cleared = self.bindings.clear_robot(robot_id);
        let frame = GatewayFrame::event(
            names::ROBOT_STATUS_CHANGED,
            RobotStatusChanged {
                robot_id: robot_id.to_string(),
                status: RobotStatus::Offline,
            },
        );
        for session_id in &cleared {
            self.send_to_session(session_id, &frame);
        }
        Some(cleared)
    }

    pub fn job(&self, session_id: &str) -> Option<&ExecutionJob> {
        self.jobs.get(session_id)
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Queue a frame for a browser session. Returns false if it is gone.
    pub fn send_to_session(&self, session_id: &str, frame: &GatewayFrame) -> bool {
        self.bindings.contains(session_id) && self.registry.send_to(session_id, frame)
    }

    /// Tell every session bound to `robot_id` about its current status.
    pub fn notify_status(&self, robot_id: &str) {
        let Some(record) = self.registry.robot(robot_id) else {
            return;
        };
        let frame = GatewayFrame::event(
            names::ROBOT_STATUS_CHANGED,
            RobotStatusChanged {
                robot_id: robot_id.to_string(),
                status: record.status,
            },
        );
        for session_id in self.bindings.sessions_bound_to(robot_id) {
            self.send_to_session(&session_id, &frame);
        }
    }
}
