//! Lua execution sandbox.
//!
//! Each job gets its own interpreter on its own OS thread. The interpreter is
//! built with only the `table`, `string`, `math` and `utf8` libraries, and the
//! globals that reach outside the process (`load`, `dofile`, `require`, ...)
//! are removed. Scripts talk to the world through a fixed set of functions:
//!
//! | global | effect |
//! |---|---|
//! | `print(...)` | one `stdout` line per output line |
//! | `emit_text(text, widget_id)` | `widget_text` telemetry |
//! | `emit_image(bytes, widget_id)` | `widget_image` telemetry |
//! | `get_gesture([widget_id])` | latest gesture value or `nil` |
//! | `get_pid_value(widget_id)` | `p, i, d` |
//! | `get_slider_value(widget_id)` | number, or a list for multi-value sliders |
//! | `sleep(seconds)` | blocks in 50ms slices |
//! | `clock()` | seconds since the job started |
//! | `robot` | [`Hardware`] handle, `nil` without hardware |
//!
//! Stopping a job sets its cancel flag. Every function above checks the flag
//! first, and an instruction-count hook checks it while pure Lua code runs, so
//! even a busy loop is interrupted. A job that still does not exit within
//! `stop_timeout_ms` (stuck inside a hardware call, say) is reported with a
//! `stderr` warning and closed out anyway.
//!
//! Each interpreter's heap is capped at `max_memory_bytes`; an allocation
//! past the cap fails the job with a memory error.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, Value, Variadic, VmState};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use pathfinder_core::config::SandboxConfig;

use crate::error::{Result, SandboxError};
use crate::hardware::{Hardware, LuaHardware};
use crate::telemetry::AgentEvent;
use crate::widgets::{SliderValue, WidgetChannelState};

const SLEEP_SLICE: Duration = Duration::from_millis(50);
const STOPPED: &str = "execution stopped";
const REMOVED_GLOBALS: &[&str] = &["load", "loadfile", "dofile", "require", "collectgarbage"];

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Errored,
    Stopped,
}

/// Fail with a Lua error once the job has been asked to stop.
pub(crate) fn ensure_running(cancel: &AtomicBool) -> mlua::Result<()> {
    if cancel.load(Ordering::SeqCst) {
        Err(mlua::Error::RuntimeError(STOPPED.into()))
    } else {
        Ok(())
    }
}

fn truncate_line(line: &str, max_bytes: usize) -> String {
    if line.len() <= max_bytes {
        return line.to_string();
    }
    let mut end = max_bytes;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

/// State one job shares between its worker and the control loop.
struct JobContext {
    session_id: String,
    cancel: Arc<AtomicBool>,
    finished: Mutex<bool>,
    events: mpsc::UnboundedSender<AgentEvent>,
    widgets: WidgetChannelState,
    started: Instant,
    max_line_bytes: usize,
}

impl JobContext {
    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Queue an event unless the job has already finished.
    fn emit(&self, event: AgentEvent) {
        let finished = self.finished.lock().unwrap();
        if !*finished {
            let _ = self.events.send(event);
        }
    }

    fn stdout(&self, text: &str) {
        for line in text.split('\n') {
            self.emit(AgentEvent::Stdout {
                session_id: self.session_id.clone(),
                line: truncate_line(line, self.max_line_bytes),
            });
        }
    }

    fn stderr(&self, text: &str) {
        for line in text.lines() {
            self.emit(AgentEvent::Stderr {
                session_id: self.session_id.clone(),
                line: truncate_line(line, self.max_line_bytes),
            });
        }
    }

    /// Send the terminal event. Only the first call has any effect.
    fn finish(&self) -> bool {
        let mut finished = self.finished.lock().unwrap();
        if *finished {
            return false;
        }
        *finished = true;
        let _ = self.events.send(AgentEvent::Finished {
            session_id: self.session_id.clone(),
        });
        true
    }
}

struct JobHandle {
    id: u64,
    ctx: Arc<JobContext>,
    done: Option<oneshot::Receiver<JobOutcome>>,
}

struct Inner {
    config: SandboxConfig,
    widgets: WidgetChannelState,
    hardware: Option<Arc<dyn Hardware>>,
    events: mpsc::UnboundedSender<AgentEvent>,
    jobs: Mutex<HashMap<String, JobHandle>>,
    next_id: AtomicU64,
}

impl Inner {
    fn complete(&self, id: u64, ctx: &JobContext, outcome: JobOutcome) {
        if let Some(hardware) = &self.hardware {
            if let Err(e) = hardware.halt() {
                warn!(session_id = %ctx.session_id, %e, "Failed to halt motors after job");
            }
        }

        {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.get(&ctx.session_id).is_some_and(|job| job.id == id) {
                jobs.remove(&ctx.session_id);
            }
        }

        ctx.finish();
        info!(session_id = %ctx.session_id, job_id = id, ?outcome, "Job ended");
    }
}

/// Runs scripts for any number of sessions, at most one job per session.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<Inner>,
}

impl Sandbox {
    pub fn new(
        config: SandboxConfig,
        widgets: WidgetChannelState,
        hardware: Option<Arc<dyn Hardware>>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                widgets,
                hardware,
                events,
                jobs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn widgets(&self) -> &WidgetChannelState {
        &self.inner.widgets
    }

    pub fn has_hardware(&self) -> bool {
        self.inner.hardware.is_some()
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.inner.jobs.lock().unwrap().contains_key(session_id)
    }

    pub fn running_sessions(&self) -> Vec<String> {
        self.inner.jobs.lock().unwrap().keys().cloned().collect()
    }

    /// Start `code` on a new worker thread.
    ///
    /// Returns as soon as the worker is spawned; output and the final
    /// `finished` event arrive on the events channel.
    pub fn execute(&self, session_id: &str, code: &str) -> Result<()> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        if jobs.contains_key(session_id) {
            return Err(SandboxError::AlreadyRunning(session_id.to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let ctx = Arc::new(JobContext {
            session_id: session_id.to_string(),
            cancel: Arc::new(AtomicBool::new(false)),
            finished: Mutex::new(false),
            events: self.inner.events.clone(),
            widgets: self.inner.widgets.clone(),
            started: Instant::now(),
            max_line_bytes: self.inner.config.max_line_bytes.max(1),
        });
        let (done_tx, done_rx) = oneshot::channel();

        let inner = self.inner.clone();
        let worker_ctx = ctx.clone();
        let code = code.to_string();
        let short_id: String = session_id.chars().take(8).collect();
        std::thread::Builder::new()
            .name(format!("sandbox-{short_id}"))
            .spawn(move || {
                let outcome = run_job(&worker_ctx, &code, inner.hardware.clone(), &inner.config);
                inner.complete(id, &worker_ctx, outcome);
                let _ = done_tx.send(outcome);
            })?;

        jobs.insert(
            session_id.to_string(),
            JobHandle {
                id,
                ctx,
                done: Some(done_rx),
            },
        );
        info!(session_id, job_id = id, "Job started");
        Ok(())
    }

    /// Ask the session's job to stop and wait up to `stop_timeout_ms` for it.
    ///
    /// On timeout the job is reported finished and forgotten even though its
    /// thread may still be alive; anything it emits afterwards is discarded.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let (id, ctx, done) = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            let job = jobs
                .get_mut(session_id)
                .ok_or_else(|| SandboxError::NotRunning(session_id.to_string()))?;
            job.ctx.cancel.store(true, Ordering::SeqCst);
            (job.id, job.ctx.clone(), job.done.take())
        };

        // A stop is already waiting on this job.
        let Some(done) = done else {
            return Ok(());
        };

        let timeout_ms = self.inner.config.stop_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), done).await {
            Ok(outcome) => {
                debug!(session_id, ?outcome, "Job stopped");
                Ok(())
            }
            Err(_) => {
                let err = SandboxError::CancellationTimeout { timeout_ms };
                warn!(session_id, job_id = id, timeout_ms, "Job did not stop in time");
                {
                    let mut jobs = self.inner.jobs.lock().unwrap();
                    if jobs.get(session_id).is_some_and(|job| job.id == id) {
                        jobs.remove(session_id);
                    }
                }
                ctx.stderr(&format!("Warning: {err}"));
                ctx.finish();
                Err(err)
            }
        }
    }

    /// Flag every running job to stop without waiting for any of them.
    pub fn cancel_all(&self) {
        let jobs = self.inner.jobs.lock().unwrap();
        for job in jobs.values() {
            job.ctx.cancel.store(true, Ordering::SeqCst);
        }
        if !jobs.is_empty() {
            info!(count = jobs.len(), "Cancelled all running jobs");
        }
    }
}

fn run_job(
    ctx: &Arc<JobContext>,
    code: &str,
    hardware: Option<Arc<dyn Hardware>>,
    config: &SandboxConfig,
) -> JobOutcome {
    let result = catch_unwind(AssertUnwindSafe(|| -> mlua::Result<()> {
        let lua = build_environment(ctx, hardware, config)?;
        lua.load(code).set_name("=main").exec()
    }));

    match result {
        Ok(Ok(())) => JobOutcome::Completed,
        Ok(Err(_)) | Err(_) if ctx.is_cancelled() => JobOutcome::Stopped,
        Ok(Err(e)) => {
            ctx.stderr(&e.to_string());
            JobOutcome::Errored
        }
        Err(_) => {
            ctx.stderr("internal error: sandbox worker panicked");
            JobOutcome::Errored
        }
    }
}

/// Format a value the way Lua's `tostring` does.
fn lua_tostring(lua: &Lua, value: Value) -> mlua::Result<String> {
    let tostring: mlua::Function = lua.globals().get("tostring")?;
    let text: mlua::String = tostring.call(value)?;
    Ok(String::from_utf8_lossy(&text.as_bytes()).into_owned())
}

fn build_environment(
    ctx: &Arc<JobContext>,
    hardware: Option<Arc<dyn Hardware>>,
    config: &SandboxConfig,
) -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )?;
    if config.max_memory_bytes > 0 {
        lua.set_memory_limit(config.max_memory_bytes)?;
    }
    let globals = lua.globals();

    for name in REMOVED_GLOBALS {
        globals.set(*name, Value::Nil)?;
    }

    let job = ctx.clone();
    globals.set(
        "print",
        lua.create_function(move |lua, args: Variadic<Value>| {
            ensure_running(&job.cancel)?;
            let parts = args
                .into_iter()
                .map(|v| lua_tostring(lua, v))
                .collect::<mlua::Result<Vec<_>>>()?;
            job.stdout(&parts.join("\t"));
            Ok(())
        })?,
    )?;

    let job = ctx.clone();
    globals.set(
        "emit_text",
        lua.create_function(move |lua, (text, widget_id): (Value, String)| {
            ensure_running(&job.cancel)?;
            job.emit(AgentEvent::WidgetText {
                session_id: job.session_id.clone(),
                widget_id,
                text: lua_tostring(lua, text)?,
            });
            Ok(())
        })?,
    )?;

    let job = ctx.clone();
    globals.set(
        "emit_image",
        lua.create_function(move |_, (image, widget_id): (mlua::String, String)| {
            ensure_running(&job.cancel)?;
            job.emit(AgentEvent::WidgetImage {
                session_id: job.session_id.clone(),
                widget_id,
                bytes: image.as_bytes().to_vec(),
            });
            Ok(())
        })?,
    )?;

    let job = ctx.clone();
    globals.set(
        "get_gesture",
        lua.create_function(move |lua, widget_id: Option<String>| {
            ensure_running(&job.cancel)?;
            match job.widgets.gesture(&job.session_id, widget_id.as_deref()) {
                Some(value) => lua.to_value(&value),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    let job = ctx.clone();
    globals.set(
        "get_pid_value",
        lua.create_function(move |_, widget_id: String| {
            ensure_running(&job.cancel)?;
            Ok(job.widgets.pid(&job.session_id, &widget_id))
        })?,
    )?;

    let job = ctx.clone();
    globals.set(
        "get_slider_value",
        lua.create_function(move |lua, widget_id: String| {
            ensure_running(&job.cancel)?;
            match job.widgets.slider(&job.session_id, &widget_id) {
                SliderValue::Single(v) => Ok(Value::Number(v)),
                SliderValue::Many(values) => Ok(Value::Table(lua.create_sequence_from(values)?)),
            }
        })?,
    )?;

    let job = ctx.clone();
    globals.set(
        "sleep",
        lua.create_function(move |_, seconds: f64| {
            let duration = Duration::try_from_secs_f64(seconds.max(0.0))
                .map_err(|e| mlua::Error::RuntimeError(format!("sleep: {e}")))?;
            let deadline = Instant::now() + duration;
            loop {
                ensure_running(&job.cancel)?;
                let now = Instant::now();
                if now >= deadline {
                    return Ok(());
                }
                std::thread::sleep((deadline - now).min(SLEEP_SLICE));
            }
        })?,
    )?;

    let job = ctx.clone();
    globals.set(
        "clock",
        lua.create_function(move |_, ()| {
            ensure_running(&job.cancel)?;
            Ok(job.started.elapsed().as_secs_f64())
        })?,
    )?;

    if let Some(hardware) = hardware {
        globals.set(
            "robot",
            lua.create_userdata(LuaHardware::new(hardware, ctx.cancel.clone()))?,
        )?;
    }

    let cancel = ctx.cancel.clone();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(config.instruction_check_interval.max(1)),
        move |_, _| {
            ensure_running(&cancel)?;
            Ok(VmState::Continue)
        },
    );

    Ok(lua)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathfinder_core::protocol::{ControlUpdate, PidUpdate, SliderUpdate};
    use std::sync::atomic::AtomicUsize;

    fn sandbox_with(
        config: SandboxConfig,
        hardware: Option<Arc<dyn Hardware>>,
    ) -> (Sandbox, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sandbox = Sandbox::new(config, WidgetChannelState::new(), hardware, tx);
        (sandbox, rx)
    }

    fn sandbox() -> (Sandbox, mpsc::UnboundedReceiver<AgentEvent>) {
        sandbox_with(SandboxConfig::default(), None)
    }

    async fn until_finished(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for finished")
                .expect("events channel closed");
            let done = matches!(event, AgentEvent::Finished { .. });
            events.push(event);
            if done {
                return events;
            }
        }
    }

    async fn run(code: &str) -> Vec<AgentEvent> {
        let (sandbox, mut rx) = sandbox();
        sandbox.execute("s1", code).unwrap();
        until_finished(&mut rx).await
    }

    fn stdout_lines(events: &[AgentEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Stdout { line, .. } => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    fn stderr_text(events: &[AgentEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Stderr { line, .. } => Some(line.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn test_print_then_text_then_finished() {
        let events = run("print('hi'); emit_text('x', 'w1')").await;
        assert_eq!(
            events,
            vec![
                AgentEvent::Stdout {
                    session_id: "s1".into(),
                    line: "hi".into()
                },
                AgentEvent::WidgetText {
                    session_id: "s1".into(),
                    widget_id: "w1".into(),
                    text: "x".into()
                },
                AgentEvent::Finished {
                    session_id: "s1".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_print_joins_arguments_and_splits_lines() {
        let events = run("print('a', 1, true); print('two\\nlines')").await;
        assert_eq!(stdout_lines(&events), vec!["a\t1\ttrue", "two", "lines"]);
    }

    #[tokio::test]
    async fn test_error_becomes_stderr_and_single_finished() {
        let (sandbox, mut rx) = sandbox();
        sandbox.execute("s1", "print('before'); error('boom')").unwrap();
        let events = until_finished(&mut rx).await;

        assert_eq!(stdout_lines(&events), vec!["before"]);
        assert!(stderr_text(&events).contains("boom"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(!sandbox.is_running("s1"));
    }

    #[tokio::test]
    async fn test_syntax_error_is_reported() {
        let events = run("this is not lua").await;
        assert!(!stderr_text(&events).is_empty());
        assert!(matches!(events.last(), Some(AgentEvent::Finished { .. })));
    }

    #[tokio::test]
    async fn test_second_execute_rejected() {
        let (sandbox, mut rx) = sandbox();
        sandbox.execute("s1", "sleep(10)").unwrap();
        assert!(matches!(
            sandbox.execute("s1", "print('again')"),
            Err(SandboxError::AlreadyRunning(_))
        ));

        // Other sessions are independent.
        sandbox.execute("s2", "print('other')").unwrap();

        sandbox.stop("s1").await.unwrap();
        let mut finished = 0;
        while finished < 2 {
            if let AgentEvent::Finished { .. } = rx.recv().await.unwrap() {
                finished += 1;
            }
        }
        assert!(sandbox.running_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_stop_interrupts_busy_loop() {
        let (sandbox, mut rx) = sandbox();
        sandbox.execute("s1", "local n = 0 while true do n = n + 1 end").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        sandbox.stop("s1").await.unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert!(!sandbox.is_running("s1"));
    }

    #[tokio::test]
    async fn test_stop_without_job() {
        let (sandbox, _rx) = sandbox();
        assert!(matches!(
            sandbox.stop("nope").await,
            Err(SandboxError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_restricted_globals() {
        let events =
            run("print(type(io), type(os), type(load), type(require), type(dofile), type(robot))")
                .await;
        assert_eq!(stdout_lines(&events), vec!["nil\tnil\tnil\tnil\tnil\tnil"]);
    }

    #[tokio::test]
    async fn test_widget_accessors() {
        let (sandbox, mut rx) = sandbox();
        for v in [1.0, 2.0, 3.0] {
            sandbox.widgets().apply(
                "s1",
                &ControlUpdate::Slider(SliderUpdate {
                    widget_id: "speed".into(),
                    values: vec![v],
                }),
            );
        }
        sandbox.widgets().apply(
            "s1",
            &ControlUpdate::Slider(SliderUpdate {
                widget_id: "xy".into(),
                values: vec![0.25, -0.5],
            }),
        );
        sandbox.widgets().apply(
            "s1",
            &ControlUpdate::Pid(PidUpdate {
                widget_id: "pid".into(),
                p: 1.5,
                i: 0.0,
                d: 0.0,
            }),
        );

        let code = r#"
            print(get_slider_value("speed"))
            print(get_slider_value("missing"))
            local xy = get_slider_value("xy")
            print(#xy, xy[1], xy[2])
            local p, i, d = get_pid_value("pid")
            print(p, i, d)
            print(get_gesture() == nil)
        "#;
        sandbox.execute("s1", code).unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(
            stdout_lines(&events),
            vec!["3.0", "0.0", "2\t0.25\t-0.5", "1.5\t0.0\t0.0", "true"]
        );
    }

    #[tokio::test]
    async fn test_long_lines_truncated() {
        let config = SandboxConfig {
            max_line_bytes: 8,
            ..SandboxConfig::default()
        };
        let (sandbox, mut rx) = sandbox_with(config, None);
        sandbox.execute("s1", "print(string.rep('a', 20))").unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(stdout_lines(&events), vec!["aaaaaaaa..."]);
    }

    #[tokio::test]
    async fn test_memory_limit_fails_job() {
        let config = SandboxConfig {
            max_memory_bytes: 4 * 1024 * 1024,
            ..SandboxConfig::default()
        };
        let (sandbox, mut rx) = sandbox_with(config, None);
        sandbox
            .execute("s1", "t = {} while true do t[#t+1] = string.rep('x', 1e6) end")
            .unwrap();
        let events = until_finished(&mut rx).await;
        assert!(stderr_text(&events).contains("memory"));
        assert!(!sandbox.is_running("s1"));
    }

    #[derive(Default)]
    struct RecordingHardware {
        drives: Mutex<Vec<(f64, f64)>>,
        halts: AtomicUsize,
        block_ms: u64,
    }

    impl Hardware for RecordingHardware {
        fn name(&self) -> &str {
            "recording"
        }

        fn drive(&self, left: f64, right: f64) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(self.block_ms));
            self.drives.lock().unwrap().push((left, right));
            Ok(())
        }

        fn halt(&self) -> anyhow::Result<()> {
            self.halts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn distance_cm(&self) -> anyhow::Result<f64> {
            Ok(42.0)
        }

        fn capture_jpeg(&self) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0xff, 0xd8])
        }
    }

    #[tokio::test]
    async fn test_hardware_handle() {
        let hw = Arc::new(RecordingHardware::default());
        let (sandbox, mut rx) = sandbox_with(SandboxConfig::default(), Some(hw.clone()));
        assert!(sandbox.has_hardware());

        let code = r#"
            robot:drive(50, -50)
            print(robot:distance())
            emit_image(robot:capture(), "cam")
        "#;
        sandbox.execute("s1", code).unwrap();
        let events = until_finished(&mut rx).await;

        assert_eq!(stdout_lines(&events), vec!["42.0"]);
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::WidgetImage { widget_id, bytes, .. } if widget_id == "cam" && bytes == &vec![0xff, 0xd8]
        )));
        assert_eq!(*hw.drives.lock().unwrap(), vec![(50.0, -50.0)]);
        assert_eq!(hw.halts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_timeout_still_finishes_once() {
        let hw = Arc::new(RecordingHardware {
            block_ms: 600,
            ..RecordingHardware::default()
        });
        let config = SandboxConfig {
            stop_timeout_ms: 50,
            ..SandboxConfig::default()
        };
        let (sandbox, mut rx) = sandbox_with(config, Some(hw));
        sandbox
            .execute("s1", "robot:drive(10, 10) print('late')")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let result = sandbox.stop("s1").await;
        assert!(matches!(
            result,
            Err(SandboxError::CancellationTimeout { timeout_ms: 50 })
        ));
        assert!(!sandbox.is_running("s1"));

        let events = until_finished(&mut rx).await;
        assert!(stderr_text(&events).contains("did not complete"));

        // The worker eventually returns from the blocking call; nothing more is sent.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(rx.try_recv().is_err());

        sandbox.execute("s1", "print('fresh')").unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(stdout_lines(&events), vec!["fresh"]);
    }

    #[test]
    fn test_truncate_line_respects_char_boundary() {
        assert_eq!(truncate_line("short", 10), "short");
        assert_eq!(truncate_line("héllo", 2), "h...");
    }
}
