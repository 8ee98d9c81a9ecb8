//! Last-value-wins state for browser control widgets.
//!
//! The agent's control loop writes every gesture/PID/slider update it receives
//! here; sandboxed code reads snapshots when it polls. Rapid updates to one
//! widget collapse to whatever arrived last.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pathfinder_core::protocol::ControlUpdate;

/// Value returned to scripts polling a slider.
#[derive(Debug, Clone, PartialEq)]
pub enum SliderValue {
    Single(f64),
    Many(Vec<f64>),
}

#[derive(Debug, Default)]
struct SessionWidgets {
    gestures: HashMap<String, serde_json::Value>,
    last_gesture: Option<serde_json::Value>,
    pid: HashMap<String, (f64, f64, f64)>,
    sliders: HashMap<String, Vec<f64>>,
}

/// Per-session widget values, shared between the control loop and workers.
#[derive(Debug, Clone, Default)]
pub struct WidgetChannelState {
    inner: Arc<Mutex<HashMap<String, SessionWidgets>>>,
}

impl WidgetChannelState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a control update, replacing any earlier value for the widget.
    pub fn apply(&self, session_id: &str, update: &ControlUpdate) {
        let mut sessions = self.inner.lock().unwrap();
        let widgets = sessions.entry(session_id.to_string()).or_default();
        match update {
            ControlUpdate::Gesture(g) => {
                if let Some(widget_id) = &g.widget_id {
                    widgets.gestures.insert(widget_id.clone(), g.value.clone());
                }
                widgets.last_gesture = Some(g.value.clone());
            }
            ControlUpdate::Pid(p) => {
                widgets.pid.insert(p.widget_id.clone(), (p.p, p.i, p.d));
            }
            ControlUpdate::Slider(s) => {
                widgets.sliders.insert(s.widget_id.clone(), s.values.clone());
            }
        }
    }

    /// Latest gesture for `widget_id`, or the latest gesture of any widget.
    pub fn gesture(&self, session_id: &str, widget_id: Option<&str>) -> Option<serde_json::Value> {
        let sessions = self.inner.lock().unwrap();
        let widgets = sessions.get(session_id)?;
        match widget_id {
            Some(id) => widgets.gestures.get(id).cloned(),
            None => widgets.last_gesture.clone(),
        }
    }

    /// PID gains for a widget, `(0, 0, 0)` until the browser sends some.
    pub fn pid(&self, session_id: &str, widget_id: &str) -> (f64, f64, f64) {
        let sessions = self.inner.lock().unwrap();
        sessions
            .get(session_id)
            .and_then(|w| w.pid.get(widget_id).copied())
            .unwrap_or((0.0, 0.0, 0.0))
    }

    /// Forget everything a closed session sent. Returns whether it had state.
    pub fn remove_session(&self, session_id: &str) -> bool {
        self.inner.lock().unwrap().remove(session_id).is_some()
    }

    /// Forget every session, e.g. when the coordinator connection drops.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn slider(&self, session_id: &str, widget_id: &str) -> SliderValue {
        let sessions = self.inner.lock().unwrap();
        let values = sessions
            .get(session_id)
            .and_then(|w| w.sliders.get(widget_id));
        match values.map(Vec::as_slice) {
            None | Some([]) => SliderValue::Single(0.0),
            Some([single]) => SliderValue::Single(*single),
            Some(many) => SliderValue::Many(many.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathfinder_core::protocol::{GestureUpdate, PidUpdate, SliderUpdate};
    use serde_json::json;

    fn slider(widget_id: &str, values: &[f64]) -> ControlUpdate {
        ControlUpdate::Slider(SliderUpdate {
            widget_id: widget_id.into(),
            values: values.to_vec(),
        })
    }

    #[test]
    fn test_rapid_updates_collapse_to_latest() {
        let state = WidgetChannelState::new();
        for v in [1.0, 2.0, 3.0] {
            state.apply("s1", &slider("speed", &[v]));
        }
        assert_eq!(state.slider("s1", "speed"), SliderValue::Single(3.0));
    }

    #[test]
    fn test_slider_shapes() {
        let state = WidgetChannelState::new();
        assert_eq!(state.slider("s1", "missing"), SliderValue::Single(0.0));

        state.apply("s1", &slider("xy", &[0.25, -0.5]));
        assert_eq!(state.slider("s1", "xy"), SliderValue::Many(vec![0.25, -0.5]));

        state.apply("s1", &slider("empty", &[]));
        assert_eq!(state.slider("s1", "empty"), SliderValue::Single(0.0));
    }

    #[test]
    fn test_pid_defaults_to_zero() {
        let state = WidgetChannelState::new();
        assert_eq!(state.pid("s1", "pid1"), (0.0, 0.0, 0.0));

        state.apply(
            "s1",
            &ControlUpdate::Pid(PidUpdate {
                widget_id: "pid1".into(),
                p: 1.5,
                i: 0.1,
                d: 0.02,
            }),
        );
        assert_eq!(state.pid("s1", "pid1"), (1.5, 0.1, 0.02));
    }

    #[test]
    fn test_gesture_by_widget_and_latest() {
        let state = WidgetChannelState::new();
        assert!(state.gesture("s1", None).is_none());

        state.apply(
            "s1",
            &ControlUpdate::Gesture(GestureUpdate {
                widget_id: Some("pad".into()),
                value: json!({"x": 1}),
            }),
        );
        state.apply(
            "s1",
            &ControlUpdate::Gesture(GestureUpdate {
                widget_id: None,
                value: json!("swipe_left"),
            }),
        );

        assert_eq!(state.gesture("s1", Some("pad")), Some(json!({"x": 1})));
        assert_eq!(state.gesture("s1", None), Some(json!("swipe_left")));
    }

    #[test]
    fn test_sessions_are_isolated() {
        let state = WidgetChannelState::new();
        state.apply("s1", &slider("speed", &[9.0]));
        assert_eq!(state.slider("s2", "speed"), SliderValue::Single(0.0));
    }

    #[test]
    fn test_closed_session_state_is_removed() {
        let state = WidgetChannelState::new();
        state.apply("s1", &slider("speed", &[9.0]));
        state.apply("s2", &slider("speed", &[4.0]));
        assert_eq!(state.session_count(), 2);

        assert!(state.remove_session("s1"));
        assert!(!state.remove_session("s1"));
        assert_eq!(state.session_count(), 1);
        assert_eq!(state.slider("s1", "speed"), SliderValue::Single(0.0));
        assert_eq!(state.slider("s2", "speed"), SliderValue::Single(4.0));

        state.clear();
        assert_eq!(state.session_count(), 0);
    }
}
