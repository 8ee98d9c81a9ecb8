//! Command routing: browser intents resolved through the binding table and
//! forwarded to the bound robot's connection.
//!
//! All forwarding happens while the caller holds the coordinator lock and goes
//! through the robot connection's FIFO queue, so commands for one session
//! reach its robot in submission order.

use chrono::Utc;
use tracing::{debug, info};

use pathfinder_core::error::RelayError;
use pathfinder_core::protocol::{
    names, ControlUpdate, ExecuteCommand, GatewayFrame, MessagePayload, SessionRef,
};
use pathfinder_core::types::{JobStatus, RobotId};

use crate::coordinator::{Coordinator, ExecutionJob};

/// Immediate acknowledgement of an accepted `execute`. Completion arrives
/// later as relayed telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteAck {
    pub robot_id: RobotId,
    pub robot_name: String,
}

impl Coordinator {
    pub fn submit_execute(&mut self, session_id: &str, code: &str) -> Result<ExecuteAck, RelayError> {
        if code.trim().is_empty() {
            return Err(RelayError::InvalidParams("no code provided".into()));
        }
        let robot_id = self
            .bindings
            .resolve(session_id)
            .cloned()
            .ok_or(RelayError::NotAssigned)?;
        if self.jobs.contains_key(session_id) {
            return Err(RelayError::AlreadyRunning);
        }
        let robot_name = self
            .registry
            .robot(&robot_id)
            .filter(|r| r.is_connected())
            .map(|r| r.display_name.clone())
            .ok_or_else(|| RelayError::RobotUnreachable(robot_id.clone()))?;

        let frame = GatewayFrame::event(
            names::EXECUTE,
            ExecuteCommand {
                session_id: session_id.to_string(),
                code: code.to_string(),
            },
        );
        self.registry.send_to_robot(&robot_id, &frame)?;

        self.jobs.insert(
            session_id.to_string(),
            ExecutionJob {
                session_id: session_id.to_string(),
                robot_id: robot_id.clone(),
                status: JobStatus::Running,
                started_at: Utc::now(),
            },
        );
        // Queued before any telemetry the robot can produce for this job
        self.send_to_session(
            session_id,
            &GatewayFrame::event(
                names::EXECUTION_STARTED,
                MessagePayload {
                    message: format!("Running on {robot_name}..."),
                    warning: None,
                },
            ),
        );

        #[cfg(feature = "metrics")]
        crate::metrics::record_command(names::EXECUTE);

        info!(session_id, robot_id = %robot_id, bytes = code.len(), "Execute forwarded");
        Ok(ExecuteAck {
            robot_id,
            robot_name,
        })
    }

    /// Forward a stop for the session's job to the robot running it.
    ///
    /// The job stays until the robot reports `finished`.
    pub fn submit_stop(&mut self, session_id: &str) -> Result<(), RelayError> {
        let job = match self.jobs.get_mut(session_id) {
            Some(job) => job,
            None if self.bindings.resolve(session_id).is_none() => {
                return Err(RelayError::NotAssigned);
            }
            None => return Err(RelayError::NoActiveJob),
        };
        job.status = JobStatus::StopRequested;
        let robot_id = job.robot_id.clone();

        let frame = GatewayFrame::event(
            names::STOP,
            SessionRef {
                session_id: session_id.to_string(),
            },
        );
        self.registry.send_to_robot(&robot_id, &frame)?;

        self.send_to_session(
            session_id,
            &GatewayFrame::event(
                names::EXECUTION_STOPPED,
                MessagePayload {
                    message: "Stop requested".into(),
                    warning: None,
                },
            ),
        );

        #[cfg(feature = "metrics")]
        crate::metrics::record_command(names::STOP);

        info!(session_id, robot_id = %robot_id, "Stop forwarded");
        Ok(())
    }

    /// Forward a control value to the bound robot, tagged with the session id.
    pub fn forward_control(&self, session_id: &str, update: &ControlUpdate) -> Result<(), RelayError> {
        let robot_id = self
            .bindings
            .resolve(session_id)
            .ok_or(RelayError::NotAssigned)?;
        let frame = GatewayFrame::Event {
            event: update.event_name().to_string(),
            payload: Some(update.to_tagged_payload(session_id)),
            seq: None,
        };
        self.registry.send_to_robot(robot_id, &frame)?;

        #[cfg(feature = "metrics")]
        crate::metrics::record_command(update.event_name());

        debug!(session_id, robot_id = %robot_id, event = update.event_name(), "Control update forwarded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pathfinder_core::protocol::{PidUpdate, SliderUpdate};

    use super::*;
    use crate::coordinator::testing::*;

    #[test]
    fn test_execute_without_assignment() {
        let mut coordinator = Coordinator::new();
        let mut robot = robot(&mut coordinator, "rbt1");
        let mut browser = browser(&mut coordinator);

        let err = coordinator.submit_execute(&browser.id, "print('hi')").unwrap_err();
        assert_eq!(err, RelayError::NotAssigned);
        assert!(robot.drain().is_empty());
        assert!(browser.drain().is_empty());
        assert!(coordinator.job(&browser.id).is_none());
    }

    #[test]
    fn test_execute_forwards_and_acks() {
        let mut coordinator = Coordinator::new();
        let (mut browser, mut robot) = bound_pair(&mut coordinator, "rbt1");

        let ack = coordinator.submit_execute(&browser.id, "print('hi')").unwrap();
        assert_eq!(ack.robot_id, "rbt1");
        assert_eq!(ack.robot_name, "Bot rbt1");

        let sent = robot.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["event"], "execute");
        assert_eq!(sent[0]["payload"]["code"], "print('hi')");
        assert_eq!(sent[0]["payload"]["session_id"], browser.id.as_str());

        let events = browser.drain();
        assert_eq!(events[0]["event"], "execution_started");
        assert_eq!(events[0]["payload"]["message"], "Running on Bot rbt1...");

        assert_eq!(coordinator.job(&browser.id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_execute_rejections() {
        let mut coordinator = Coordinator::new();
        let (browser, robot) = bound_pair(&mut coordinator, "rbt1");

        assert!(matches!(
            coordinator.submit_execute(&browser.id, "   "),
            Err(RelayError::InvalidParams(_))
        ));

        coordinator.submit_execute(&browser.id, "x = 1").unwrap();
        assert_eq!(
            coordinator.submit_execute(&browser.id, "x = 2").unwrap_err(),
            RelayError::AlreadyRunning
        );

        // A robot without a live connection is unreachable
        let other = browser_bound_to_offline(&mut coordinator, robot);
        assert_eq!(
            coordinator.submit_execute(&other, "x = 1").unwrap_err(),
            RelayError::RobotUnreachable("rbt1".into())
        );
    }

    fn browser_bound_to_offline(coordinator: &mut Coordinator, robot: Peer) -> String {
        let session = browser(coordinator);
        coordinator
            .bindings
            .assign(&session.id, "rbt1", &coordinator.registry)
            .unwrap();
        coordinator.close_robot_connection(&robot.id);
        drop(robot);
        session.id
    }

    #[test]
    fn test_stop() {
        let mut coordinator = Coordinator::new();
        let (mut browser, mut robot) = bound_pair(&mut coordinator, "rbt1");

        assert_eq!(
            coordinator.submit_stop(&browser.id).unwrap_err(),
            RelayError::NoActiveJob
        );

        coordinator.submit_execute(&browser.id, "while true do end").unwrap();
        robot.drain();
        browser.drain();

        coordinator.submit_stop(&browser.id).unwrap();
        let sent = robot.drain();
        assert_eq!(sent[0]["event"], "stop");
        assert_eq!(browser.events(), vec!["execution_stopped"]);
        assert_eq!(
            coordinator.job(&browser.id).unwrap().status,
            JobStatus::StopRequested
        );
    }

    #[test]
    fn test_stop_unassigned() {
        let mut coordinator = Coordinator::new();
        let browser = browser(&mut coordinator);
        assert_eq!(
            coordinator.submit_stop(&browser.id).unwrap_err(),
            RelayError::NotAssigned
        );
    }

    #[test]
    fn test_commands_keep_submission_order() {
        let mut coordinator = Coordinator::new();
        let (browser, mut robot) = bound_pair(&mut coordinator, "rbt1");

        coordinator.submit_execute(&browser.id, "x = 1").unwrap();
        coordinator
            .forward_control(
                &browser.id,
                &ControlUpdate::Slider(SliderUpdate {
                    widget_id: "s1".into(),
                    values: vec![0.5],
                }),
            )
            .unwrap();
        coordinator
            .forward_control(
                &browser.id,
                &ControlUpdate::Pid(PidUpdate {
                    widget_id: "pid".into(),
                    p: 1.0,
                    i: 0.0,
                    d: 0.2,
                }),
            )
            .unwrap();
        coordinator.submit_stop(&browser.id).unwrap();

        assert_eq!(
            robot.events(),
            vec!["execute", "slider_update", "pid_update", "stop"]
        );
    }

    #[test]
    fn test_forward_control_requires_binding() {
        let mut coordinator = Coordinator::new();
        let browser = browser(&mut coordinator);
        let update = ControlUpdate::Slider(SliderUpdate {
            widget_id: "s1".into(),
            values: vec![1.0],
        });
        assert_eq!(
            coordinator.forward_control(&browser.id, &update).unwrap_err(),
            RelayError::NotAssigned
        );
    }
}
