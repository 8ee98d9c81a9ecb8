//! Robot liveness: heartbeat ingestion, the staleness sweep, and firmware
//! version checks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pathfinder_core::error::RelayError;
use pathfinder_core::types::{RobotId, RobotStatus};
use pathfinder_core::version;

use crate::coordinator::Coordinator;
use crate::state::GatewayState;

impl Coordinator {
    /// Record a heartbeat. Returns true if the robot just came online.
    pub fn ingest_heartbeat(&mut self, robot_id: &str, now: DateTime<Utc>) -> Result<bool, RelayError> {
        let record = self
            .registry
            .robot_mut(robot_id)
            .ok_or_else(|| RelayError::NotFound(format!("Robot {robot_id}")))?;
        let previous = record.status;
        record.last_heartbeat_at = Some(now);
        record.status = RobotStatus::Online;
        if previous == RobotStatus::Offline {
            info!(robot_id, "Robot back online");
        }
        if previous != RobotStatus::Online {
            self.notify_status(robot_id);
        }
        Ok(previous == RobotStatus::Offline)
    }

    /// Heartbeat from a robot that is applying an update. It still counts as alive.
    pub fn mark_updating(&mut self, robot_id: &str, now: DateTime<Utc>) -> Result<(), RelayError> {
        let record = self
            .registry
            .robot_mut(robot_id)
            .ok_or_else(|| RelayError::NotFound(format!("Robot {robot_id}")))?;
        record.last_heartbeat_at = Some(now);
        if record.status != RobotStatus::Updating {
            record.status = RobotStatus::Updating;
            self.notify_status(robot_id);
        }
        Ok(())
    }

    /// Mark robots offline whose heartbeat is older than `timeout` and that
    /// have no live connection. Running jobs are left alone.
    pub fn sweep(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<RobotId> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let stale: Vec<RobotId> = self
            .registry
            .robots()
            .filter(|r| r.status != RobotStatus::Offline && !r.is_connected())
            .filter(|r| {
                r.last_heartbeat_at
                    .is_none_or(|seen| now.signed_duration_since(seen) > timeout)
            })
            .map(|r| r.robot_id.clone())
            .collect();

        for robot_id in &stale {
            if let Some(record) = self.registry.robot_mut(robot_id) {
                record.status = RobotStatus::Offline;
            }
            info!(robot_id = %robot_id, "Robot marked offline after heartbeat silence");
            self.notify_status(robot_id);
        }
        stale
    }

    /// Set `needs_update` from the reported firmware version. Returns the new flag.
    pub fn version_check(
        &mut self,
        robot_id: &str,
        reported_version: &str,
        latest: Option<&str>,
    ) -> Result<bool, RelayError> {
        let record = self
            .registry
            .robot_mut(robot_id)
            .ok_or_else(|| RelayError::NotFound(format!("Robot {robot_id}")))?;
        record.firmware_version = reported_version.to_string();
        record.needs_update = latest.is_some_and(|latest| version::is_outdated(reported_version, latest));
        if record.needs_update {
            info!(robot_id, reported_version, latest, "Robot firmware is outdated");
        }
        Ok(record.needs_update)
    }
}

/// Run the staleness sweep on its own interval until `cancel` fires.
pub fn spawn_liveness_monitor(state: Arc<GatewayState>, cancel: CancellationToken) -> JoinHandle<()> {
    let liveness = state.config.liveness();
    let timeout = Duration::from_secs(liveness.heartbeat_timeout_secs);
    let period = Duration::from_secs(liveness.sweep_interval_secs.max(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let mut coordinator = state.coordinator.write().await;
                    let stale = coordinator.sweep(Utc::now(), timeout);
                    if !stale.is_empty() {
                        debug!(count = stale.len(), "Liveness sweep marked robots offline");
                    }
                    #[cfg(feature = "metrics")]
                    crate::metrics::set_robots_online(coordinator.registry.online_robot_count());
                }
            }
        }
        debug!("Liveness monitor stopped");
    })
}
