//! Trait-based engine tracing.
//!
//! Hook points fire at the engine's lifecycle events: scope push/pop, sweep
//! and vacuum passes, value finalization, script-function calls, and thrown
//! exceptions. The default [`NoopTracer`] does nothing; [`StderrTracer`]
//! writes a human-readable log; [`RecordingTracer`] captures events for
//! post-mortem inspection in tests.

use crate::rc::ResultCode;

/// One recorded trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A scope frame was pushed; `level` is the new depth.
    ScopePush { level: u32 },
    /// A scope frame was popped.
    ScopePop { level: u32 },
    /// A sweep pass reclaimed `swept` probationary values.
    Sweep { level: u32, swept: usize },
    /// A vacuum pass reclaimed `vacuumed` unreachable values.
    Vacuum { level: u32, vacuumed: usize },
    /// A script function call began; `depth` counts script frames.
    Call { name: Option<String>, depth: usize },
    /// A script function call completed.
    Return { depth: usize },
    /// An exception was thrown with this code.
    Throw { code: ResultCode },
}

/// Receiver for engine trace events. All methods default to no-ops so
/// implementations override only what they need.
pub trait EngineTracer {
    fn on_scope_push(&mut self, _level: u32) {}
    fn on_scope_pop(&mut self, _level: u32) {}
    fn on_sweep(&mut self, _level: u32, _swept: usize) {}
    fn on_vacuum(&mut self, _level: u32, _vacuumed: usize) {}
    fn on_call(&mut self, _name: Option<&str>, _depth: usize) {}
    fn on_return(&mut self, _depth: usize) {}
    fn on_throw(&mut self, _code: ResultCode) {}
}

/// The production default: does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl EngineTracer for NoopTracer {}

/// Writes one line per event to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl EngineTracer for StderrTracer {
    fn on_scope_push(&mut self, level: u32) {
        eprintln!("[sorrel] scope push -> {level}");
    }

    fn on_scope_pop(&mut self, level: u32) {
        eprintln!("[sorrel] scope pop  <- {level}");
    }

    fn on_sweep(&mut self, level: u32, swept: usize) {
        eprintln!("[sorrel] sweep @{level}: {swept} value(s)");
    }

    fn on_vacuum(&mut self, level: u32, vacuumed: usize) {
        eprintln!("[sorrel] vacuum @{level}: {vacuumed} value(s)");
    }

    fn on_call(&mut self, name: Option<&str>, depth: usize) {
        eprintln!("[sorrel] call {} (depth {depth})", name.unwrap_or("<anonymous>"));
    }

    fn on_return(&mut self, depth: usize) {
        eprintln!("[sorrel] return (depth {depth})");
    }

    fn on_throw(&mut self, code: ResultCode) {
        eprintln!("[sorrel] throw {code}");
    }
}

/// Captures every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }
}

impl EngineTracer for RecordingTracer {
    fn on_scope_push(&mut self, level: u32) {
        self.events.push(TraceEvent::ScopePush { level });
    }

    fn on_scope_pop(&mut self, level: u32) {
        self.events.push(TraceEvent::ScopePop { level });
    }

    fn on_sweep(&mut self, level: u32, swept: usize) {
        self.events.push(TraceEvent::Sweep { level, swept });
    }

    fn on_vacuum(&mut self, level: u32, vacuumed: usize) {
        self.events.push(TraceEvent::Vacuum { level, vacuumed });
    }

    fn on_call(&mut self, name: Option<&str>, depth: usize) {
        self.events.push(TraceEvent::Call {
            name: name.map(str::to_owned),
            depth,
        });
    }

    fn on_return(&mut self, depth: usize) {
        self.events.push(TraceEvent::Return { depth });
    }

    fn on_throw(&mut self, code: ResultCode) {
        self.events.push(TraceEvent::Throw { code });
    }
}
