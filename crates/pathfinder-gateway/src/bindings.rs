//! Session → robot binding table.

use std::collections::HashMap;

use tracing::debug;

use pathfinder_core::error::RelayError;
use pathfinder_core::types::{Identity, RobotId, SessionId};

use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub session_id: SessionId,
    pub identity: Identity,
    pub robot_id: Option<RobotId>,
}

/// One entry per connected browser session; each references at most one robot.
#[derive(Debug, Default)]
pub struct BindingTable {
    sessions: HashMap<SessionId, SessionBinding>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unbound entry for a freshly connected browser.
    pub fn open(&mut self, session_id: &str, identity: Identity) {
        self.sessions.insert(
            session_id.to_string(),
            SessionBinding {
                session_id: session_id.to_string(),
                identity,
                robot_id: None,
            },
        );
    }

    /// Bind a session to a known robot, replacing any previous binding.
    /// Returns the robot it was bound to before.
    pub fn assign(
        &mut self,
        session_id: &str,
        robot_id: &str,
        registry: &ConnectionRegistry,
    ) -> Result<Option<RobotId>, RelayError> {
        if registry.robot(robot_id).is_none() {
            return Err(RelayError::NotFound(format!("Robot {robot_id}")));
        }
        let binding = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::NotFound(format!("Session {session_id}")))?;
        let previous = binding.robot_id.replace(robot_id.to_string());
        debug!(session_id, robot_id, ?previous, "Session bound");
        Ok(previous)
    }

    /// Drop a session's entry entirely. Called when its browser disconnects.
    pub fn unassign(&mut self, session_id: &str) -> Option<SessionBinding> {
        self.sessions.remove(session_id)
    }

    /// The robot a session is bound to, if any.
    pub fn resolve(&self, session_id: &str) -> Option<&RobotId> {
        self.sessions
            .get(session_id)
            .and_then(|b| b.robot_id.as_ref())
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionBinding> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn sessions_bound_to(&self, robot_id: &str) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|b| b.robot_id.as_deref() == Some(robot_id))
            .map(|b| b.session_id.clone())
            .collect()
    }

    /// Unbind every session that references `robot_id`.
    pub fn clear_robot(&mut self, robot_id: &str) -> Vec<SessionId> {
        let mut cleared = Vec::new();
        for binding in self.sessions.values_mut() {
            if binding.robot_id.as_deref() == Some(robot_id) {
                binding.robot_id = None;
                cleared.push(binding.session_id.clone());
            }
        }
        cleared
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
