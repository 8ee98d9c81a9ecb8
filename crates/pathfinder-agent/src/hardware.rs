//! Robot hardware handle exposed to scripts as the `robot` global.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use mlua::{UserData, UserDataMethods};
use tracing::debug;

use crate::sandbox::ensure_running;

/// Motor and sensor access for the robot this agent runs on.
pub trait Hardware: Send + Sync {
    fn name(&self) -> &str;

    /// Set wheel speeds, each in `-100.0..=100.0`.
    fn drive(&self, left: f64, right: f64) -> anyhow::Result<()>;

    /// Stop all motors.
    fn halt(&self) -> anyhow::Result<()>;

    /// Ultrasonic distance in centimetres.
    fn distance_cm(&self) -> anyhow::Result<f64>;

    /// One JPEG-encoded camera frame.
    fn capture_jpeg(&self) -> anyhow::Result<Vec<u8>>;
}

/// Stand-in driver for developing robot code on a machine without motors.
///
/// Motor commands are logged; the distance sensor reports a fixed reading and
/// there is no camera.
#[derive(Debug, Default)]
pub struct SimulatedHardware {
    speeds: Mutex<(f64, f64)>,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn speeds(&self) -> (f64, f64) {
        *self.speeds.lock().unwrap()
    }
}

impl Hardware for SimulatedHardware {
    fn name(&self) -> &str {
        "simulated"
    }

    fn drive(&self, left: f64, right: f64) -> anyhow::Result<()> {
        let left = left.clamp(-100.0, 100.0);
        let right = right.clamp(-100.0, 100.0);
        debug!(left, right, "Simulated drive");
        *self.speeds.lock().unwrap() = (left, right);
        Ok(())
    }

    fn halt(&self) -> anyhow::Result<()> {
        *self.speeds.lock().unwrap() = (0.0, 0.0);
        Ok(())
    }

    fn distance_cm(&self) -> anyhow::Result<f64> {
        Ok(100.0)
    }

    fn capture_jpeg(&self) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("simulated hardware has no camera")
    }
}

/// Pick the hardware handle for this agent.
///
/// `enabled = Some(false)` forces scripts to run without hardware. No physical
/// driver ships with the agent, so a handle only exists when simulation is
/// requested.
pub fn select_hardware(enabled: Option<bool>, simulate: bool) -> Option<Arc<dyn Hardware>> {
    if enabled == Some(false) || !simulate {
        return None;
    }
    Some(Arc::new(SimulatedHardware::new()))
}

/// Lua view of a [`Hardware`] handle, bound to one job's cancel flag.
pub(crate) struct LuaHardware {
    hardware: Arc<dyn Hardware>,
    cancel: Arc<AtomicBool>,
}

impl LuaHardware {
    pub(crate) fn new(hardware: Arc<dyn Hardware>, cancel: Arc<AtomicBool>) -> Self {
        Self { hardware, cancel }
    }
}

impl UserData for LuaHardware {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("drive", |_, this, (left, right): (f64, f64)| {
            ensure_running(&this.cancel)?;
            this.hardware
                .drive(left, right)
                .map_err(mlua::Error::external)
        });

        methods.add_method("stop", |_, this, ()| {
            ensure_running(&this.cancel)?;
            this.hardware.halt().map_err(mlua::Error::external)
        });

        methods.add_method("distance", |_, this, ()| {
            ensure_running(&this.cancel)?;
            this.hardware.distance_cm().map_err(mlua::Error::external)
        });

        methods.add_method("capture", |lua, this, ()| {
            ensure_running(&this.cancel)?;
            let frame = this
                .hardware
                .capture_jpeg()
                .map_err(mlua::Error::external)?;
            lua.create_string(&frame)
        });

        methods.add_method("name", |_, this, ()| Ok(this.hardware.name().to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_hardware() {
        assert!(select_hardware(None, false).is_none());
        assert!(select_hardware(Some(true), false).is_none());
        assert!(select_hardware(Some(false), true).is_none());

        let hw = select_hardware(None, true).unwrap();
        assert_eq!(hw.name(), "simulated");
    }

    #[test]
    fn test_simulated_drive_clamps_and_halts() {
        let hw = SimulatedHardware::new();
        hw.drive(150.0, -20.0).unwrap();
        assert_eq!(hw.speeds(), (100.0, -20.0));
        hw.halt().unwrap();
        assert_eq!(hw.speeds(), (0.0, 0.0));
        assert!(hw.capture_jpeg().is_err());
    }
}
