//! Telemetry relay: robot-origin events delivered to the one browser session
//! they are addressed to.
//!
//! Delivery is fire-and-forget. Anything addressed to a session that is gone,
//! or that the emitting robot has no business talking to, is dropped.

use serde_json::json;
use tracing::debug;

use pathfinder_core::protocol::{
    names, ConsoleLine, ConsoleOutput, ErrorPayload, ExecutionRejected, GatewayFrame, ImageData,
    SessionRef, TextData, WidgetImage, WidgetText,
};
use pathfinder_core::types::SessionId;

use crate::coordinator::Coordinator;

/// One robot-origin event, already stripped of its session id.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Stdout(String),
    Stderr(String),
    Finished,
    Text { widget_id: String, text: String },
    Image { widget_id: String, bytes: Vec<u8> },
    /// The agent refused an execute; no `finished` will follow.
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Dropped,
}

impl Telemetry {
    pub fn kind(&self) -> &'static str {
        match self {
            Telemetry::Stdout(_) => names::STDOUT,
            Telemetry::Stderr(_) => names::STDERR,
            Telemetry::Finished => names::FINISHED,
            Telemetry::Text { .. } => names::WIDGET_TEXT,
            Telemetry::Image { .. } => names::WIDGET_IMAGE,
            Telemetry::Rejected(_) => names::EXECUTION_ERROR,
        }
    }

    /// Parse a robot event frame. `None` if the event is not telemetry.
    pub fn from_event(
        event: &str,
        payload: serde_json::Value,
    ) -> Option<serde_json::Result<(SessionId, Telemetry)>> {
        let parsed = match event {
            names::STDOUT => serde_json::from_value::<ConsoleLine>(payload)
                .map(|l| (l.session_id, Telemetry::Stdout(l.line))),
            names::STDERR => serde_json::from_value::<ConsoleLine>(payload)
                .map(|l| (l.session_id, Telemetry::Stderr(l.line))),
            names::FINISHED => {
                serde_json::from_value::<SessionRef>(payload).map(|s| (s.session_id, Telemetry::Finished))
            }
            names::WIDGET_TEXT => serde_json::from_value::<WidgetText>(payload).map(|w| {
                (
                    w.session_id,
                    Telemetry::Text {
                        widget_id: w.widget_id,
                        text: w.text,
                    },
                )
            }),
            names::WIDGET_IMAGE => serde_json::from_value::<WidgetImage>(payload).map(|w| {
                (
                    w.session_id,
                    Telemetry::Image {
                        widget_id: w.widget_id,
                        bytes: w.bytes,
                    },
                )
            }),
            names::EXECUTION_ERROR => serde_json::from_value::<ExecutionRejected>(payload)
                .map(|r| (r.session_id, Telemetry::Rejected(r.error))),
            _ => return None,
        };
        Some(parsed)
    }

    /// The frame the browser receives.
    fn into_browser_frame(self) -> GatewayFrame {
        match self {
            Telemetry::Stdout(output) => GatewayFrame::event(names::STDOUT, ConsoleOutput { output }),
            Telemetry::Stderr(output) => GatewayFrame::event(names::STDERR, ConsoleOutput { output }),
            Telemetry::Finished => GatewayFrame::event(names::FINISHED, json!({})),
            Telemetry::Text { widget_id, text } => {
                GatewayFrame::event(names::TEXT_DATA, TextData { widget_id, text })
            }
            Telemetry::Image { widget_id, bytes } => {
                GatewayFrame::event(names::IMAGE_DATA, ImageData { widget_id, bytes })
            }
            Telemetry::Rejected(error) => {
                GatewayFrame::event(names::EXECUTION_ERROR, ErrorPayload { error })
            }
        }
    }
}

impl Coordinator {
    /// Relay one telemetry event from the robot connection `from_conn` to
    /// `session_id`.
    ///
    /// The emitting robot must either be running that session's job or be the
    /// robot the session is bound to. `finished` and rejections are only
    /// accepted from the job's robot and clear the job, so the browser sees
    /// at most one terminal event per job.
    pub fn emit(&mut self, from_conn: &str, session_id: &str, telemetry: Telemetry) -> Delivery {
        let kind = telemetry.kind();
        let Some(robot_id) = self.registry.robot_for_connection(from_conn).cloned() else {
            debug!(conn_id = %from_conn, session_id, kind, "Telemetry from unregistered connection dropped");
            return self.dropped();
        };

        let runs_job = self
            .jobs
            .get(session_id)
            .is_some_and(|job| job.robot_id == robot_id);

        let terminal = matches!(telemetry, Telemetry::Finished | Telemetry::Rejected(_));
        if terminal {
            if !runs_job {
                debug!(session_id, robot_id = %robot_id, kind, "Terminal event for unknown job dropped");
                return self.dropped();
            }
            self.jobs.remove(session_id);
        } else {
            let bound = self.bindings.resolve(session_id) == Some(&robot_id);
            if !runs_job && !bound {
                debug!(session_id, robot_id = %robot_id, kind, "Telemetry for unrelated session dropped");
                return self.dropped();
            }
        }

        if self.send_to_session(session_id, &telemetry.into_browser_frame()) {
            #[cfg(feature = "metrics")]
            crate::metrics::record_telemetry_relayed(kind);
            Delivery::Delivered
        } else {
            debug!(session_id, kind, "Session gone, telemetry dropped");
            self.dropped()
        }
    }

    fn dropped(&self) -> Delivery {
        #[cfg(feature = "metrics")]
        crate::metrics::record_telemetry_dropped();
        Delivery::Dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::testing::*;

    #[test]
    fn test_print_then_text_then_finished_order() {
        let mut coordinator = Coordinator::new();
        let (mut browser, robot) = bound_pair(&mut coordinator, "rbt1");
        coordinator
            .submit_execute(&browser.id, "print('hi'); emit_text('x','w1')")
            .unwrap();
        browser.drain();

        let sid = browser.id.clone();
        assert_eq!(
            coordinator.emit(&robot.id, &sid, Telemetry::Stdout("hi".into())),
            Delivery::Delivered
        );
        coordinator.emit(
            &robot.id,
            &sid,
            Telemetry::Text {
                widget_id: "w1".into(),
                text: "x".into(),
            },
        );
        coordinator.emit(&robot.id, &sid, Telemetry::Finished);

        let frames = browser.drain();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["event"], "stdout");
        assert_eq!(frames[0]["payload"]["output"], "hi");
        assert_eq!(frames[1]["event"], "text_data");
        assert_eq!(frames[1]["payload"]["widget_id"], "w1");
        assert_eq!(frames[1]["payload"]["text"], "x");
        assert_eq!(frames[2]["event"], "finished");
        assert!(coordinator.job(&sid).is_none());
    }

    #[test]
    fn test_exactly_one_finished() {
        let mut coordinator = Coordinator::new();
        let (mut browser, robot) = bound_pair(&mut coordinator, "rbt1");
        coordinator.submit_execute(&browser.id, "x = 1").unwrap();
        browser.drain();

        let sid = browser.id.clone();
        assert_eq!(coordinator.emit(&robot.id, &sid, Telemetry::Finished), Delivery::Delivered);
        assert_eq!(coordinator.emit(&robot.id, &sid, Telemetry::Finished), Delivery::Dropped);
        assert_eq!(browser.events(), vec!["finished"]);
    }

    #[test]
    fn test_disconnected_session_dropped() {
        let mut coordinator = Coordinator::new();
        let (browser, robot) = bound_pair(&mut coordinator, "rbt1");
        coordinator.submit_execute(&browser.id, "x = 1").unwrap();
        let sid = browser.id.clone();
        coordinator.close_session(&sid);
        drop(browser);

        // A new session must never receive the old session's output
        let mut other = crate::coordinator::testing::browser(&mut coordinator);
        coordinator
            .bindings
            .assign(&other.id, "rbt1", &coordinator.registry)
            .unwrap();

        assert_eq!(
            coordinator.emit(&robot.id, &sid, Telemetry::Stdout("late".into())),
            Delivery::Dropped
        );
        assert_eq!(coordinator.emit(&robot.id, &sid, Telemetry::Finished), Delivery::Dropped);
        assert!(coordinator.job(&sid).is_none());
        assert!(other.drain().is_empty());
    }

    #[test]
    fn test_unknown_session_and_foreign_robot_dropped() {
        let mut coordinator = Coordinator::new();
        let (mut browser, _robot) = bound_pair(&mut coordinator, "rbt1");
        let intruder = robot(&mut coordinator, "rbt2");

        assert_eq!(
            coordinator.emit(&intruder.id, "no-such-session", Telemetry::Stdout("x".into())),
            Delivery::Dropped
        );
        assert_eq!(
            coordinator.emit(&intruder.id, &browser.id, Telemetry::Stdout("x".into())),
            Delivery::Dropped
        );
        assert_eq!(coordinator.emit("not-a-robot", &browser.id, Telemetry::Finished), Delivery::Dropped);
        assert!(browser.drain().is_empty());
    }

    #[test]
    fn test_job_output_follows_rebind() {
        let mut coordinator = Coordinator::new();
        let (mut browser, robot1) = bound_pair(&mut coordinator, "rbt1");
        let _robot2 = robot(&mut coordinator, "rbt2");
        coordinator.submit_execute(&browser.id, "x = 1").unwrap();
        coordinator
            .bindings
            .assign(&browser.id, "rbt2", &coordinator.registry)
            .unwrap();
        browser.drain();

        let sid = browser.id.clone();
        assert_eq!(
            coordinator.emit(&robot1.id, &sid, Telemetry::Stdout("still here".into())),
            Delivery::Delivered
        );
        assert_eq!(coordinator.emit(&robot1.id, &sid, Telemetry::Finished), Delivery::Delivered);
    }

    #[test]
    fn test_rejection_clears_job() {
        let mut coordinator = Coordinator::new();
        let (mut browser, robot) = bound_pair(&mut coordinator, "rbt1");
        coordinator.submit_execute(&browser.id, "x = 1").unwrap();
        browser.drain();

        let sid = browser.id.clone();
        coordinator.emit(&robot.id, &sid, Telemetry::Rejected("already running".into()));
        let frames = browser.drain();
        assert_eq!(frames[0]["event"], "execution_error");
        assert_eq!(frames[0]["payload"]["error"], "already running");
        assert!(coordinator.job(&sid).is_none());
    }

    #[test]
    fn test_parse_robot_events() {
        let (sid, telemetry) = Telemetry::from_event(
            "widget_image",
            serde_json::json!({"session_id": "s1", "widget_id": "cam", "bytes": "/9j/"}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(sid, "s1");
        assert_eq!(
            telemetry,
            Telemetry::Image {
                widget_id: "cam".into(),
                bytes: vec![0xff, 0xd8, 0xff]
            }
        );
        assert!(Telemetry::from_event("heartbeat", serde_json::json!({})).is_none());
        assert!(Telemetry::from_event("stdout", serde_json::json!({})).unwrap().is_err());
    }
}
