#![doc = include_str!("../../../README.md")]
#![allow(dead_code, reason = "embedding API surface exceeds internal use")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors C arithmetic")]
#![expect(clippy::module_name_repetitions, reason = "public names read better qualified")]

mod engine;
mod error;
mod eval;
mod func;
mod heap;
mod intern;
mod io;
mod keyword;
mod object;
mod ops;
mod props;
mod proto;
mod rc;
mod resource;
mod scope;
mod token;
mod tracer;
mod value;

pub use crate::{
    engine::{Engine, EngineConfig, EngineMetrics, FeatureMask, InterruptHandle, WeakHandle},
    error::{Exception, StackFrame},
    func::{NativeCall, NativeHook},
    heap::HeapStats,
    io::{CollectStringOutputer, NullOutputer, Outputer, StdOutputer},
    object::Object,
    rc::ResultCode,
    resource::{LimitedTracker, NoLimitTracker, ResourceError, ResourceLimits, ResourceTracker},
    tracer::{EngineTracer, NoopTracer, RecordingTracer, StderrTracer, TraceEvent},
    value::TypeTag,
};
