//! The engine aggregate and the embedding API.
//!
//! An `Engine` owns one value engine (arena + interner + recycler), one scope
//! stack, the evaluator's shared state (skip level, dot-operator state, stack
//! trace), the UKWD registry, the per-type prototypes, and the pluggable
//! outputer/tracer pair. Values never travel between engines.

use std::{
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    error::{EngineError, EvalError, EvalResult, Exception, StackFrame},
    func::{FuncData, FuncKind, NativeHook, NativeRegistration, ScriptSrc},
    heap::{Array, Buffer, ContainerMeta, ExcData, HashObj, Heap, HeapData, HeapStats, Obj, RtStr, Tuple, Unique, WeakRef},
    intern::{KnownStr, StaticStr},
    io::{Outputer, StdOutputer},
    object::Object,
    props::{CONT_NO_PROTO_SET, PROP_HIDDEN},
    rc::ResultCode,
    resource::{
        DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_EVAL_DEPTH, DEFAULT_STACKTRACE_LIMIT, LimitedTracker, NoLimitTracker,
        ResourceLimits, ResourceTracker,
    },
    scope::ScopeStack,
    tracer::{EngineTracer, NoopTracer},
    value::{TypeTag, Value, key_eq, key_hash, to_display, to_repr},
};

/// Advisory feature-disable mask. The core does not enforce these bits; they
/// exist for stdlib bindings and embedder natives to consult.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureMask(u32);

impl FeatureMask {
    pub const FS_READ: Self = Self(1 << 0);
    pub const FS_WRITE: Self = Self(1 << 1);
    pub const FS_STAT: Self = Self(1 << 2);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Every Nth post-expression sweep opportunity actually sweeps.
    pub sweep_interval: u32,
    /// Every Mth executed sweep is promoted to a vacuum.
    pub vacuum_interval: u32,
    /// Deduplicate equal string contents to a single heap value.
    pub interning: bool,
    /// Cap on collected stack-trace frames; 0 disables collection.
    pub stacktrace_limit: usize,
    /// Cap on script-function call depth.
    pub max_call_depth: usize,
    /// Cap on nested evaluation constructs (paren groups excluded).
    pub max_eval_depth: usize,
    /// Scope-chain search depth for variable lookup; 0 is unbounded.
    pub var_lookup_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval: 1,
            vacuum_interval: 10,
            interning: true,
            stacktrace_limit: DEFAULT_STACKTRACE_LIMIT,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_eval_depth: DEFAULT_MAX_EVAL_DEPTH,
            var_lookup_depth: 0,
        }
    }
}

/// Counters surfaced through [`Engine::metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineMetrics {
    /// Heap values allocated over the engine's lifetime.
    pub allocations: u64,
    /// `new_string` calls satisfied by the interner.
    pub intern_hits: u64,
    /// Sweep passes executed.
    pub sweeps: u64,
    /// Vacuum passes executed.
    pub vacuums: u64,
    /// Values reclaimed by sweeps.
    pub values_swept: u64,
    /// Values reclaimed by vacuums.
    pub values_vacuumed: u64,
    /// Chunk-recycler hits and misses.
    pub chunk_hits: u64,
    pub chunk_misses: u64,
    /// Deepest scope stack seen.
    pub peak_scope_depth: u32,
    /// Script-function calls made.
    pub script_calls: u64,
}

/// Handle for cooperative interruption: toggles a sticky flag the evaluator
/// polls at safe points. Safe to trigger from another thread or a signal
/// handler.
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    /// Requests interruption of the owning engine.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether an interrupt is pending (not yet consumed by the engine).
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A weak reference to an engine value: observes the value's lifetime
/// without extending it.
///
/// Issued by [`Engine::weak_handle`] and probed with [`Engine::weak_deref`],
/// which answers `None` once the target has been finalized (by sweep,
/// vacuum, or scope teardown). Invalidation is O(1): finalizing a value
/// bumps its slot's generation, which every outstanding handle checks.
/// Handles to builtin values are immortal and always dereference.
#[derive(Debug, Clone)]
pub struct WeakHandle(WeakKind);

#[derive(Debug, Clone)]
enum WeakKind {
    /// Builtins never die; the handle carries the exported value.
    Immortal(Object),
    Slot(WeakRef),
}

/// Published state of the last property-access operator, consumed by call,
/// assignment, and unset operators to bind `this` and route mutations.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DotState {
    /// The container the property was resolved against.
    pub self_val: Value,
    /// The resolved property value.
    pub lhs: Value,
    /// The property key.
    pub key: Value,
}

/// One lightweight stack-trace frame recorded around script-function calls.
#[derive(Debug, Clone)]
pub(crate) struct RawFrame {
    pub script: Rc<str>,
    pub line: u32,
    pub col: u32,
}

/// Per-type prototype table, indexed by [`TypeTag`].
#[derive(Debug, Default)]
pub(crate) struct TypeProtos {
    slots: [Value; 15],
}

fn tag_index(tag: TypeTag) -> usize {
    match tag {
        TypeTag::Undefined => 0,
        TypeTag::Null => 1,
        TypeTag::Bool => 2,
        TypeTag::Integer => 3,
        TypeTag::Double => 4,
        TypeTag::String => 5,
        TypeTag::Array => 6,
        TypeTag::Object => 7,
        TypeTag::Hash => 8,
        TypeTag::Buffer => 9,
        TypeTag::Function => 10,
        TypeTag::Exception => 11,
        TypeTag::Native => 12,
        TypeTag::Unique => 13,
        TypeTag::Tuple => 14,
    }
}

impl TypeProtos {
    pub fn get(&self, tag: TypeTag) -> Value {
        self.slots[tag_index(tag)]
    }

    pub fn set(&mut self, tag: TypeTag, proto: Value) {
        self.slots[tag_index(tag)] = proto;
    }
}

/// A scripting engine instance.
///
/// The default tracker imposes no resource limits; use
/// [`Engine::with_limits`] for sandboxed execution.
pub struct Engine<T: ResourceTracker = NoLimitTracker> {
    pub(crate) heap: Heap<T>,
    pub(crate) scopes: ScopeStack,
    pub(crate) config: EngineConfig,
    /// Short-circuit depth: when positive, handlers produce `Undef` with no
    /// side effects.
    pub(crate) skip_level: u32,
    /// Expression nesting; sweeping is disabled while positive.
    pub(crate) expr_depth: u32,
    /// Nested evaluation constructs (guarded by `max_eval_depth`).
    pub(crate) eval_depth: u32,
    /// Script-function call depth (guarded by `max_call_depth`).
    pub(crate) call_depth: u32,
    sweep_tick: u64,
    sweeps_run: u64,
    pub(crate) dot_state: Option<DotState>,
    pub(crate) stack_frames: Vec<RawFrame>,
    /// The script currently being evaluated.
    pub(crate) script: Option<Rc<ScriptSrc>>,
    /// Current evaluation position for error reporting.
    pub(crate) cur_line: u32,
    pub(crate) cur_col: u32,
    interrupted: Arc<AtomicBool>,
    pub(crate) ukwds: crate::keyword::Ukwds,
    pub(crate) natives: Vec<NativeRegistration>,
    pub(crate) protos: TypeProtos,
    pub(crate) outputer: Box<dyn Outputer>,
    pub(crate) tracer: Box<dyn EngineTracer>,
    pub(crate) metrics: EngineMetrics,
    disabled: FeatureMask,
}

impl Engine<NoLimitTracker> {
    /// An engine with no resource limits and default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// An engine with no resource limits and custom configuration.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_tracker(NoLimitTracker, config)
    }
}

impl Default for Engine<NoLimitTracker> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<LimitedTracker> {
    /// A sandboxed engine enforcing the given resource limits.
    #[must_use]
    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self::with_tracker(LimitedTracker::new(limits), EngineConfig::default())
    }
}

impl<T: ResourceTracker> Engine<T> {
    /// An engine with a custom resource-tracking strategy.
    pub fn with_tracker(tracker: T, config: EngineConfig) -> Self {
        let mut engine = Self {
            heap: Heap::new(64, tracker, config.interning),
            scopes: ScopeStack::new(),
            config,
            skip_level: 0,
            expr_depth: 0,
            eval_depth: 0,
            call_depth: 0,
            sweep_tick: 0,
            sweeps_run: 0,
            dot_state: None,
            stack_frames: Vec::new(),
            script: None,
            cur_line: 0,
            cur_col: 0,
            interrupted: Arc::new(AtomicBool::new(false)),
            ukwds: crate::keyword::Ukwds::default(),
            natives: Vec::new(),
            protos: TypeProtos::default(),
            outputer: Box::new(StdOutputer),
            tracer: Box::new(NoopTracer),
            metrics: EngineMetrics::default(),
            disabled: FeatureMask::default(),
        };
        crate::proto::install_core_prototypes(&mut engine);
        engine
    }

    // --- Lifecycle / plumbing ---

    /// Replaces the output channel.
    pub fn set_outputer(&mut self, outputer: Box<dyn Outputer>) -> Box<dyn Outputer> {
        std::mem::replace(&mut self.outputer, outputer)
    }

    /// Replaces the tracer.
    pub fn set_tracer(&mut self, tracer: Box<dyn EngineTracer>) -> Box<dyn EngineTracer> {
        std::mem::replace(&mut self.tracer, tracer)
    }

    /// A handle that can interrupt this engine from another thread.
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.interrupted))
    }

    /// The advisory feature-disable mask.
    #[must_use]
    pub fn disabled_features(&self) -> FeatureMask {
        self.disabled
    }

    pub fn set_disabled_features(&mut self, mask: FeatureMask) {
        self.disabled = mask;
    }

    /// Engine lifetime counters.
    #[must_use]
    pub fn metrics(&self) -> EngineMetrics {
        let mut m = self.metrics;
        m.values_swept = self.scopes.swept_total;
        m.values_vacuumed = self.scopes.vacuumed_total;
        m.chunk_hits = self.heap.chunks.hits;
        m.chunk_misses = self.heap.chunks.misses;
        m
    }

    /// Point-in-time heap statistics.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Fails with `Fatal` once lifetime corruption has been detected.
    pub(crate) fn check_alive(&self) -> EvalResult<()> {
        if self.heap.is_dead() {
            Err(EvalError::Fatal(ResultCode::Fatal))
        } else {
            Ok(())
        }
    }

    /// Polls the sticky interrupt flag, consuming it when set.
    pub(crate) fn check_interrupt(&mut self) -> EvalResult<()> {
        if self.interrupted.swap(false, Ordering::Relaxed) {
            return Err(EvalError::Interrupted);
        }
        self.heap.tracker_mut().check_deadline().map_err(EvalError::from)
    }

    // --- Scope plumbing ---

    pub(crate) fn push_scope(&mut self) -> u32 {
        let level = self.scopes.push();
        self.metrics.peak_scope_depth = self.metrics.peak_scope_depth.max(level);
        self.tracer.on_scope_push(level);
        level
    }

    /// Pops the current scope, rescoping `keep` values into the parent.
    pub(crate) fn pop_scope(&mut self, keep: &[Value]) {
        let level = self.scopes.current_level();
        self.tracer.on_scope_pop(level);
        self.scopes.pop(&mut self.heap, keep);
    }

    /// Pops the current scope while an [`EvalError`] propagates, keeping its
    /// payload value alive across the pop.
    pub(crate) fn pop_scope_propagating(&mut self, err: &EvalError) {
        match err.payload() {
            Some(v) => self.pop_scope(&[v]),
            None => self.pop_scope(&[]),
        }
    }

    /// Runs the post-expression GC schedule: every Nth opportunity sweeps,
    /// and every Mth executed sweep is promoted to a vacuum.
    pub(crate) fn maybe_sweep(&mut self) {
        if self.expr_depth > 0 {
            return;
        }
        self.sweep_tick += 1;
        if self.config.sweep_interval == 0 || self.sweep_tick % u64::from(self.config.sweep_interval) != 0 {
            return;
        }
        self.sweeps_run += 1;
        if self.config.vacuum_interval != 0 && self.sweeps_run % u64::from(self.config.vacuum_interval) == 0 {
            // Vacuum is skipped while the scope carries evaluation temps.
            if self.scopes.current().eval_holder.is_empty() {
                self.vacuum();
                return;
            }
        }
        self.sweep();
    }

    /// Immediately frees the current scope's probationary temporaries.
    pub fn sweep(&mut self) -> usize {
        let swept = self.scopes.sweep(&mut self.heap);
        self.metrics.sweeps += 1;
        self.tracer.on_sweep(self.scopes.current_level(), swept);
        swept
    }

    /// Immediately frees everything in the current scope not reachable from
    /// its variables or vacuum-safe values.
    pub fn vacuum(&mut self) -> usize {
        match self.scopes.vacuum(&mut self.heap) {
            Ok(count) => {
                self.metrics.vacuums += 1;
                self.tracer.on_vacuum(self.scopes.current_level(), count);
                count
            }
            Err(_) => 0,
        }
    }

    // --- Value construction ---

    pub(crate) fn known(k: KnownStr) -> Value {
        Value::Static(StaticStr::Known(k))
    }

    pub(crate) fn alloc(&mut self, data: HeapData) -> EvalResult<Value> {
        let id = self.heap.alloc_raw(data).map_err(EvalError::from)?;
        self.scopes.adopt(&mut self.heap, id);
        self.metrics.allocations += 1;
        Ok(Value::Ref(id))
    }

    /// Creates (or interns) a string value. Builtin contents return shared
    /// immortal handles; interned hits return the existing heap value without
    /// adding a reference.
    pub(crate) fn new_string(&mut self, s: &str) -> EvalResult<Value> {
        if let Some(b) = StaticStr::for_content(s) {
            return Ok(Value::Static(b));
        }
        if let Some(id) = self.heap.interner.lookup(s) {
            self.metrics.intern_hits += 1;
            return Ok(Value::Ref(id));
        }
        let v = self.alloc(HeapData::Str(RtStr::new(s)))?;
        if let Some(id) = v.ref_id() {
            self.heap.interner.insert(s, id);
        }
        Ok(v)
    }

    /// Array from element handles; each element gets a reference.
    pub(crate) fn new_array(&mut self, items: Vec<Value>) -> EvalResult<Value> {
        for item in &items {
            self.scopes.vref(&mut self.heap, *item).map_err(EvalError::Fatal)?;
        }
        let proto = self.protos.get(TypeTag::Array);
        self.alloc(HeapData::Array(Array {
            list: items,
            meta: ContainerMeta {
                proto,
                ..ContainerMeta::default()
            },
        }))
    }

    pub(crate) fn new_object(&mut self) -> EvalResult<Value> {
        let proto = self.protos.get(TypeTag::Object);
        self.alloc(HeapData::Object(Obj {
            meta: ContainerMeta {
                proto,
                ..ContainerMeta::default()
            },
        }))
    }

    pub(crate) fn new_hash(&mut self) -> EvalResult<Value> {
        let proto = self.protos.get(TypeTag::Hash);
        self.alloc(HeapData::Hash(HashObj {
            meta: ContainerMeta {
                proto,
                ..ContainerMeta::default()
            },
            ..HashObj::default()
        }))
    }

    pub(crate) fn new_buffer(&mut self, bytes: Vec<u8>) -> EvalResult<Value> {
        let proto = self.protos.get(TypeTag::Buffer);
        self.alloc(HeapData::Buffer(Buffer {
            bytes,
            meta: ContainerMeta {
                proto,
                ..ContainerMeta::default()
            },
        }))
    }

    pub(crate) fn new_tuple(&mut self, slots: Vec<Value>) -> EvalResult<Value> {
        for item in &slots {
            self.scopes.vref(&mut self.heap, *item).map_err(EvalError::Fatal)?;
        }
        self.alloc(HeapData::Tuple(Tuple {
            slots: slots.into_boxed_slice(),
        }))
    }

    pub(crate) fn new_unique(&mut self, wrapped: Value) -> EvalResult<Value> {
        self.scopes.vref(&mut self.heap, wrapped).map_err(EvalError::Fatal)?;
        self.alloc(HeapData::Unique(Unique { wrapped }))
    }

    pub(crate) fn new_func(&mut self, data: FuncData) -> EvalResult<Value> {
        let mut data = data;
        if data.meta.proto.same(Value::Undef) {
            data.meta.proto = self.protos.get(TypeTag::Function);
        }
        self.alloc(HeapData::Function(data))
    }

    // --- Eval holder ---

    /// Current length of the active scope's eval holder, for later truncation.
    pub(crate) fn holder_mark(&self) -> usize {
        self.scopes.current().eval_holder.len()
    }

    /// Protects a value for the duration of the current expression.
    pub(crate) fn holder_push(&mut self, v: Value) -> EvalResult<()> {
        self.scopes.vref(&mut self.heap, v).map_err(EvalError::Fatal)?;
        self.scopes.current_mut().eval_holder.push(v);
        Ok(())
    }

    /// Truncates the holder back to `mark`, releasing each protected value
    /// via unhand so propagating results stay alive (re-probated).
    pub(crate) fn holder_truncate(&mut self, mark: usize) {
        while self.scopes.current().eval_holder.len() > mark {
            let v = self
                .scopes
                .current_mut()
                .eval_holder
                .pop()
                .expect("length checked above");
            self.scopes.vunhand(&mut self.heap, v);
        }
    }

    // --- Exceptions ---

    /// Builds an exception value adopting the current script position and a
    /// snapshot of the stack trace, then wraps it as a propagating error.
    /// On allocation failure the error degrades to OOM.
    pub(crate) fn throw(&mut self, code: ResultCode, message: &str) -> EvalError {
        self.tracer.on_throw(code);
        match self.new_exception(code, message) {
            Ok(v) => {
                // The payload holds one reference while it propagates.
                if self.scopes.vref(&mut self.heap, v).is_err() {
                    return EvalError::Fatal(ResultCode::Fatal);
                }
                EvalError::Exception(v)
            }
            Err(e) => e,
        }
    }

    /// Rethrows an existing exception value (no position rewriting).
    pub(crate) fn rethrow(&mut self, exc: Value) -> EvalError {
        self.tracer.on_throw(ResultCode::Exception);
        if self.scopes.vref(&mut self.heap, exc).is_err() {
            return EvalError::Fatal(ResultCode::Fatal);
        }
        EvalError::Exception(exc)
    }

    /// Creates an exception value with `code`, `message`, `script`, `line`,
    /// `column`, and `stacktrace` properties.
    pub(crate) fn new_exception(&mut self, code: ResultCode, message: &str) -> EvalResult<Value> {
        let msg_val = self.new_string(message)?;
        let proto = self.protos.get(TypeTag::Exception);
        let exc = self.alloc(HeapData::Exception(ExcData {
            code,
            meta: ContainerMeta {
                proto,
                ..ContainerMeta::default()
            },
        }))?;
        // Protect the probationary exception across the property stores.
        self.scopes.vref(&mut self.heap, exc).map_err(EvalError::Fatal)?;
        let result = self.fill_exception_props(exc, code, msg_val);
        self.scopes.vunhand(&mut self.heap, exc);
        result?;
        Ok(exc)
    }

    fn fill_exception_props(&mut self, exc: Value, code: ResultCode, msg_val: Value) -> EvalResult<()> {
        self.prop_set(exc, Self::known(KnownStr::Code), Value::Int(code.as_int()), 0)?;
        self.prop_set(exc, Self::known(KnownStr::Message), msg_val, 0)?;
        if let Some(script) = self.script.clone() {
            let name_val = self.new_string(&script.name)?;
            self.prop_set(exc, Self::known(KnownStr::Script), name_val, 0)?;
            self.prop_set(exc, Self::known(KnownStr::Line), Value::Int(i64::from(self.cur_line)), 0)?;
            self.prop_set(exc, Self::known(KnownStr::Column), Value::Int(i64::from(self.cur_col)), 0)?;
        }
        if self.config.stacktrace_limit > 0 && !self.stack_frames.is_empty() {
            let mut frames = Vec::with_capacity(self.stack_frames.len());
            for frame in self.stack_frames.clone().iter().rev() {
                let obj = self.new_object()?;
                self.scopes.vref(&mut self.heap, obj).map_err(EvalError::Fatal)?;
                let script_val = self.new_string(&frame.script)?;
                let fill = self
                    .prop_set(obj, Self::known(KnownStr::Script), script_val, 0)
                    .and_then(|()| self.prop_set(obj, Self::known(KnownStr::Line), Value::Int(i64::from(frame.line)), 0))
                    .and_then(|()| {
                        self.prop_set(obj, Self::known(KnownStr::Column), Value::Int(i64::from(frame.col)), 0)
                    });
                self.scopes.vunhand(&mut self.heap, obj);
                fill?;
                frames.push(obj);
            }
            let trace = self.new_array(frames)?;
            self.prop_set(exc, Self::known(KnownStr::Stacktrace), trace, 0)?;
        }
        Ok(())
    }

    /// Converts a pending engine-error record into a catchable exception
    /// value, consuming the record.
    pub(crate) fn engine_error_to_exception(&mut self, mut err: Box<EngineError>) -> EvalError {
        let code = err.code();
        if code.is_allocation_free() {
            return if code == ResultCode::Oom {
                EvalError::Oom
            } else {
                EvalError::Fatal(code)
            };
        }
        let line = err.line;
        let col = err.column;
        let message = std::mem::take(&mut err.message);
        let saved = (self.cur_line, self.cur_col);
        self.cur_line = line;
        self.cur_col = col;
        let out = self.throw(code, &message);
        (self.cur_line, self.cur_col) = saved;
        out
    }

    // --- Property access ---

    /// The effective prototype of a value: the container's own prototype when
    /// set, the per-type prototype otherwise.
    pub(crate) fn proto_of(&self, v: Value) -> Value {
        if let Value::Ref(id) = v
            && let Some(meta) = self.heap.get(id).meta()
            && !meta.proto.same(Value::Undef)
        {
            return meta.proto;
        }
        self.protos.get(v.type_tag(&self.heap))
    }

    /// True when `v`'s prototype chain contains `ancestor`.
    pub(crate) fn derives_from_value(&self, v: Value, ancestor: Value) -> bool {
        let mut cursor = self.proto_of(v);
        let mut hops = 0;
        while !cursor.same(Value::Undef) && hops < 64 {
            if cursor.same(ancestor) {
                return true;
            }
            let next = if let Value::Ref(id) = cursor {
                self.heap.get(id).meta().map_or(Value::Undef, |m| m.proto)
            } else {
                Value::Undef
            };
            if next.same(cursor) {
                break;
            }
            cursor = next;
            hops += 1;
        }
        false
    }

    /// Own-property lookup (no prototype chain).
    pub(crate) fn prop_get_own(&self, container: Value, key: Value) -> Option<Value> {
        let id = container.ref_id()?;
        let data = self.heap.get_if_live(id)?;
        let meta = data.meta()?;
        meta.props.get(key, |a, b| key_eq(a, b, &self.heap)).map(|s| s.value)
    }

    /// Full property lookup: own properties, then the prototype chain.
    /// Non-property-capable values go straight to their type prototype.
    pub(crate) fn prop_get(&self, container: Value, key: Value) -> Option<Value> {
        if let Some(v) = self.prop_get_own(container, key) {
            return Some(v);
        }
        let mut cursor = self.proto_of(container);
        let mut hops = 0;
        while !cursor.same(Value::Undef) && hops < 64 {
            if let Some(v) = self.prop_get_own(cursor, key) {
                return Some(v);
            }
            cursor = if let Value::Ref(id) = cursor {
                self.heap.get(id).meta().map_or(Value::Undef, |m| m.proto)
            } else {
                Value::Undef
            };
            hops += 1;
        }
        None
    }

    /// Sets an own property, enforcing key usability, container flags, and
    /// const entries, with full refcount and rescope bookkeeping.
    pub(crate) fn prop_set(&mut self, container: Value, key: Value, value: Value, flags: u16) -> EvalResult<()> {
        let Some(id) = container.ref_id() else {
            return Err(self.throw(ResultCode::Type, "value cannot hold properties"));
        };
        if !key.key_usable(&self.heap) {
            return Err(self.throw(ResultCode::Type, "buffers and tuples are not usable as property keys"));
        }
        {
            let data = self.heap.get(id);
            let Some(meta) = data.meta() else {
                return Err(self.throw(ResultCode::Type, "value cannot hold properties"));
            };
            if meta.flags & crate::props::CONT_LOCKED != 0 {
                return Err(self.throw(ResultCode::Locked, "container is locked"));
            }
            if meta.flags & crate::props::CONT_VISITING != 0 {
                return Err(self.throw(ResultCode::IsVisiting, "container is being iterated"));
            }
            if meta.flags & crate::props::CONT_NO_PROP_SET != 0 {
                return Err(self.throw(ResultCode::DisallowPropSet, "container forbids property changes"));
            }
        }
        let owner = self.heap.owner_level(id);
        self.scopes.rescope(&mut self.heap, owner, key);
        self.scopes.rescope(&mut self.heap, owner, value);

        let mut data = self.heap.take_data(id);
        let meta = data.meta_mut().expect("checked property-capable above");
        let no_new = meta.flags & crate::props::CONT_NO_NEW_PROPS != 0;
        let existing = meta.props.find(key, |a, b| key_eq(a, b, &self.heap));
        let result: Result<(Option<Value>, bool), ResultCode> = match existing {
            Some(index) => meta.props.set_at(index, value).map(|old| (Some(old), false)),
            None if no_new => Err(ResultCode::DisallowNewProperties),
            None => {
                let mut old = None;
                meta.props
                    .set(key, value, flags, |a, b| a.same(b), &mut old)
                    .map(|_| (None, true))
            }
        };
        self.heap.restore_data(id, data);
        match result {
            Ok((old, inserted)) => {
                if inserted {
                    self.scopes.vref(&mut self.heap, key).map_err(EvalError::Fatal)?;
                }
                self.scopes.vref(&mut self.heap, value).map_err(EvalError::Fatal)?;
                if let Some(old) = old {
                    self.scopes.vunref(&mut self.heap, old);
                }
                Ok(())
            }
            Err(code) => {
                let msg = match code {
                    ResultCode::ConstViolation => "assignment to const property",
                    ResultCode::DisallowNewProperties => "container forbids new properties",
                    _ => "property set refused",
                };
                Err(self.throw(code, msg))
            }
        }
    }

    /// Removes an own property. Returns whether an entry was removed.
    pub(crate) fn prop_unset(&mut self, container: Value, key: Value) -> EvalResult<bool> {
        let Some(id) = container.ref_id() else {
            return Err(self.throw(ResultCode::Type, "value cannot hold properties"));
        };
        if self.heap.get(id).meta().is_none() {
            return Err(self.throw(ResultCode::Type, "value cannot hold properties"));
        }
        let mut data = self.heap.take_data(id);
        let meta = data.meta_mut().expect("checked property-capable above");
        let removed = meta.props.remove(key, |a, b| key_eq(a, b, &self.heap));
        self.heap.restore_data(id, data);
        match removed {
            Ok(Some((k, slot))) => {
                self.scopes.vunref(&mut self.heap, k);
                self.scopes.vunref(&mut self.heap, slot.value);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(code) => Err(self.throw(code, "cannot unset const property")),
        }
    }

    // --- Hash entry access (distinct from the property side) ---

    pub(crate) fn hash_insert(&mut self, hash: Value, key: Value, value: Value) -> EvalResult<()> {
        let Some(id) = hash.ref_id() else {
            return Err(self.throw(ResultCode::Type, "hash operation on non-hash"));
        };
        if !matches!(self.heap.get(id), HeapData::Hash(_)) {
            return Err(self.throw(ResultCode::Type, "hash operation on non-hash"));
        }
        if !key.key_usable(&self.heap) {
            return Err(self.throw(ResultCode::Type, "buffers and tuples are not usable as hash keys"));
        }
        let owner = self.heap.owner_level(id);
        self.scopes.rescope(&mut self.heap, owner, key);
        self.scopes.rescope(&mut self.heap, owner, value);
        let hash_code = key_hash(key, &self.heap);
        let mut data = self.heap.take_data(id);
        let old = match &mut data {
            HeapData::Hash(h) => {
                if h.meta.flags & crate::props::CONT_VISITING != 0 {
                    self.heap.restore_data(id, data);
                    return Err(self.throw(ResultCode::IsVisitingList, "hash is being iterated"));
                }
                h.insert(hash_code, key, value, |a, b| key_eq(a, b, &self.heap))
            }
            _ => unreachable!("checked hash type above"),
        };
        self.heap.restore_data(id, data);
        match old {
            Some(old) => {
                self.scopes.vref(&mut self.heap, value).map_err(EvalError::Fatal)?;
                self.scopes.vunref(&mut self.heap, old);
            }
            None => {
                self.scopes.vref(&mut self.heap, key).map_err(EvalError::Fatal)?;
                self.scopes.vref(&mut self.heap, value).map_err(EvalError::Fatal)?;
            }
        }
        Ok(())
    }

    pub(crate) fn hash_search(&self, hash: Value, key: Value) -> Option<Value> {
        let id = hash.ref_id()?;
        let HeapData::Hash(h) = self.heap.get_if_live(id)? else {
            return None;
        };
        let hash_code = key_hash(key, &self.heap);
        h.find(hash_code, key, |a, b| key_eq(a, b, &self.heap))
            .map(|i| h.entry_value(i))
    }

    pub(crate) fn hash_remove(&mut self, hash: Value, key: Value) -> EvalResult<bool> {
        let Some(id) = hash.ref_id() else {
            return Err(self.throw(ResultCode::Type, "hash operation on non-hash"));
        };
        if !matches!(self.heap.get(id), HeapData::Hash(_)) {
            return Err(self.throw(ResultCode::Type, "hash operation on non-hash"));
        }
        let hash_code = key_hash(key, &self.heap);
        let mut data = self.heap.take_data(id);
        let removed = match &mut data {
            HeapData::Hash(h) => {
                if h.meta.flags & crate::props::CONT_VISITING != 0 {
                    self.heap.restore_data(id, data);
                    return Err(self.throw(ResultCode::IsVisitingList, "hash is being iterated"));
                }
                h.remove(hash_code, key, |a, b| key_eq(a, b, &self.heap))
            }
            _ => unreachable!("checked hash type above"),
        };
        self.heap.restore_data(id, data);
        match removed {
            Some((k, v)) => {
                self.scopes.vunref(&mut self.heap, k);
                self.scopes.vunref(&mut self.heap, v);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // --- Array element access ---

    pub(crate) fn array_get(&mut self, array: Value, index: i64) -> EvalResult<Value> {
        let Some(id) = array.ref_id() else {
            return Err(self.throw(ResultCode::Type, "index into non-array"));
        };
        match self.heap.get(id) {
            HeapData::Array(arr) => {
                if index < 0 {
                    return Err(self.throw(ResultCode::Range, "negative array index"));
                }
                Ok(arr.list.get(index as usize).copied().unwrap_or(Value::Undef))
            }
            HeapData::Tuple(t) => {
                if index < 0 || index as usize >= t.slots.len() {
                    return Err(self.throw(ResultCode::Range, "tuple index out of range"));
                }
                Ok(t.slots[index as usize])
            }
            _ => Err(self.throw(ResultCode::Type, "index into non-array")),
        }
    }

    /// Sets an array element, auto-extending with `undef` past the end.
    pub(crate) fn array_set(&mut self, array: Value, index: i64, value: Value) -> EvalResult<()> {
        let Some(id) = array.ref_id() else {
            return Err(self.throw(ResultCode::Type, "index into non-array"));
        };
        if index < 0 {
            return Err(self.throw(ResultCode::Range, "negative array index"));
        }
        if !matches!(self.heap.get(id), HeapData::Array(_)) {
            return Err(self.throw(ResultCode::Type, "index into non-array"));
        }
        let owner = self.heap.owner_level(id);
        self.scopes.rescope(&mut self.heap, owner, value);
        self.scopes.vref(&mut self.heap, value).map_err(EvalError::Fatal)?;
        let old = match self.heap.get_mut(id) {
            HeapData::Array(arr) => {
                if arr.meta.flags & crate::props::CONT_VISITING != 0 {
                    None // handled below
                } else {
                    let i = index as usize;
                    if i >= arr.list.len() {
                        arr.list.resize(i + 1, Value::Undef);
                    }
                    Some(std::mem::replace(&mut arr.list[i], value))
                }
            }
            _ => unreachable!("checked array type above"),
        };
        match old {
            Some(old) => {
                self.scopes.vunref(&mut self.heap, old);
                Ok(())
            }
            None => {
                self.scopes.vunref(&mut self.heap, value);
                Err(self.throw(ResultCode::IsVisitingList, "array is being iterated"))
            }
        }
    }

    pub(crate) fn array_push(&mut self, array: Value, value: Value) -> EvalResult<()> {
        let Some(id) = array.ref_id() else {
            return Err(self.throw(ResultCode::Type, "push onto non-array"));
        };
        let visiting = match self.heap.get(id) {
            HeapData::Array(arr) => arr.meta.flags & crate::props::CONT_VISITING != 0,
            _ => return Err(self.throw(ResultCode::Type, "push onto non-array")),
        };
        if visiting {
            return Err(self.throw(ResultCode::IsVisitingList, "array is being iterated"));
        }
        let owner = self.heap.owner_level(id);
        self.scopes.rescope(&mut self.heap, owner, value);
        self.scopes.vref(&mut self.heap, value).map_err(EvalError::Fatal)?;
        match self.heap.get_mut(id) {
            HeapData::Array(arr) => arr.list.push(value),
            _ => unreachable!("checked array type above"),
        }
        Ok(())
    }

    // --- Display helpers ---

    pub(crate) fn display_string(&self, v: Value) -> String {
        let mut out = String::new();
        to_display(v, &self.heap, &mut out);
        out
    }

    pub(crate) fn repr_string(&self, v: Value) -> String {
        let mut out = String::new();
        to_repr(v, &self.heap, &mut out, 24);
        out
    }

    // --- Export / import across the API boundary ---

    /// Deep-copies a value out of the arena. Cyclic graphs degrade to
    /// [`Object::Repr`] markers at the cycle point.
    pub(crate) fn export_value(&self, v: Value) -> Object {
        let mut seen = Vec::new();
        self.export_inner(v, &mut seen)
    }

    fn export_inner(&self, v: Value, seen: &mut Vec<crate::heap::HeapId>) -> Object {
        match v {
            Value::Undef => Object::Undef,
            Value::Null => Object::Null,
            Value::Bool(b) => Object::Bool(b),
            Value::Int(i) => Object::Int(i),
            Value::Double(d) => Object::Double(d),
            Value::Static(s) => Object::String(s.as_str().to_owned()),
            Value::Ref(id) => {
                if seen.contains(&id) {
                    return Object::Repr("<cycle>".to_owned());
                }
                let Some(data) = self.heap.get_if_live(id) else {
                    return Object::Undef;
                };
                seen.push(id);
                let out = match data {
                    HeapData::Str(s) => Object::String(s.as_str().to_owned()),
                    HeapData::Buffer(b) => Object::Buffer(b.bytes.clone()),
                    HeapData::Array(arr) => Object::Array(arr.list.iter().map(|v| self.export_inner(*v, seen)).collect()),
                    HeapData::Tuple(t) => Object::Tuple(t.slots.iter().map(|v| self.export_inner(*v, seen)).collect()),
                    HeapData::Object(o) => Object::Object(
                        o.meta
                            .props
                            .iter()
                            .filter(|(_, s)| s.flags & PROP_HIDDEN == 0)
                            .map(|(k, s)| (self.export_inner(*k, seen), self.export_inner(s.value, seen)))
                            .collect(),
                    ),
                    HeapData::Hash(h) => Object::Hash(
                        h.iter_entries()
                            .map(|(k, s)| (self.export_inner(k, seen), self.export_inner(s.value, seen)))
                            .collect(),
                    ),
                    HeapData::Unique(u) => Object::Unique(Box::new(self.export_inner(u.wrapped, seen))),
                    HeapData::Exception(e) => Object::Exception(Box::new(self.export_exception(v, e.code))),
                    HeapData::Function(_) | HeapData::Native(_) => Object::Repr(self.repr_string(v)),
                };
                seen.pop();
                out
            }
        }
    }

    /// Flattens an exception value into its public report form.
    pub(crate) fn export_exception(&self, exc: Value, code: ResultCode) -> Exception {
        let get = |k: KnownStr| self.prop_get_own(exc, Self::known(k));
        let message = get(KnownStr::Message).map(|m| self.display_string(m)).unwrap_or_default();
        let script = get(KnownStr::Script).map(|s| self.display_string(s));
        let line = get(KnownStr::Line).and_then(Value::as_int).unwrap_or(0) as u32;
        let column = get(KnownStr::Column).and_then(Value::as_int).unwrap_or(0) as u32;
        let mut stacktrace = Vec::new();
        if let Some(trace) = get(KnownStr::Stacktrace)
            && let Some(id) = trace.ref_id()
            && let Some(HeapData::Array(arr)) = self.heap.get_if_live(id)
        {
            for frame in &arr.list {
                let fget = |k: KnownStr| self.prop_get_own(*frame, Self::known(k));
                stacktrace.push(StackFrame {
                    script: fget(KnownStr::Script).map(|s| self.display_string(s)).unwrap_or_default(),
                    line: fget(KnownStr::Line).and_then(Value::as_int).unwrap_or(0) as u32,
                    column: fget(KnownStr::Column).and_then(Value::as_int).unwrap_or(0) as u32,
                });
            }
        }
        Exception {
            code,
            message,
            script,
            line,
            column,
            stacktrace,
        }
    }

    /// Converts an owned object into an engine value.
    pub(crate) fn import_object(&mut self, obj: &Object) -> EvalResult<Value> {
        match obj {
            Object::Undef => Ok(Value::Undef),
            Object::Null => Ok(Value::Null),
            Object::Bool(b) => Ok(Value::Bool(*b)),
            Object::Int(i) => Ok(Value::Int(*i)),
            Object::Double(d) => Ok(Value::Double(*d)),
            Object::String(s) | Object::Repr(s) => self.new_string(s),
            Object::Buffer(b) => self.new_buffer(b.clone()),
            Object::Array(items) => {
                let mut vals = Vec::with_capacity(items.len());
                for item in items {
                    vals.push(self.import_object(item)?);
                }
                self.new_array(vals)
            }
            Object::Tuple(items) => {
                let mut vals = Vec::with_capacity(items.len());
                for item in items {
                    vals.push(self.import_object(item)?);
                }
                self.new_tuple(vals)
            }
            Object::Object(pairs) => {
                let o = self.new_object()?;
                self.scopes.vref(&mut self.heap, o).map_err(EvalError::Fatal)?;
                let fill = self.import_pairs(o, pairs, false);
                self.scopes.vunhand(&mut self.heap, o);
                fill?;
                Ok(o)
            }
            Object::Hash(pairs) => {
                let h = self.new_hash()?;
                self.scopes.vref(&mut self.heap, h).map_err(EvalError::Fatal)?;
                let fill = self.import_pairs(h, pairs, true);
                self.scopes.vunhand(&mut self.heap, h);
                fill?;
                Ok(h)
            }
            Object::Unique(inner) => {
                let wrapped = self.import_object(inner)?;
                self.new_unique(wrapped)
            }
            Object::Exception(exc) => self.new_exception(exc.code, &exc.message),
        }
    }

    fn import_pairs(&mut self, target: Value, pairs: &[(Object, Object)], as_hash: bool) -> EvalResult<()> {
        for (k, v) in pairs {
            let key = self.import_object(k)?;
            self.scopes.vref(&mut self.heap, key).map_err(EvalError::Fatal)?;
            let value = self.import_object(v);
            self.scopes.vunhand(&mut self.heap, key);
            let value = value?;
            if as_hash {
                self.hash_insert(target, key, value)?;
            } else {
                self.prop_set(target, key, value, 0)?;
            }
        }
        Ok(())
    }

    // --- Embedding API: evaluation ---

    /// Evaluates a script named `"<eval>"`.
    pub fn eval(&mut self, src: &str) -> Result<Object, Exception> {
        self.eval_named("<eval>", src)
    }

    /// Evaluates a script with an explicit name for error reporting. The
    /// result is the value of the final non-terminated expression.
    pub fn eval_named(&mut self, script_name: &str, src: &str) -> Result<Object, Exception> {
        crate::eval::eval_script(self, script_name, src)
    }

    /// Reads and evaluates a file. The thin filesystem touch here is the only
    /// one in the core; everything else lives with the host.
    pub fn eval_file(&mut self, path: &std::path::Path) -> Result<Object, Exception> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| Exception::new(ResultCode::Io, format!("{}: {e}", path.display())))?;
        self.eval_named(&path.to_string_lossy(), &src)
    }

    // --- Embedding API: variables ---

    /// Declares a variable in the current (root, between evals) scope.
    pub fn var_decl(&mut self, name: &str, value: Object) -> Result<(), Exception> {
        self.var_decl_impl(name, value, false)
    }

    /// Declares a const variable.
    pub fn var_decl_const(&mut self, name: &str, value: Object) -> Result<(), Exception> {
        self.var_decl_impl(name, value, true)
    }

    fn var_decl_impl(&mut self, name: &str, value: Object, is_const: bool) -> Result<(), Exception> {
        let result = (|| -> EvalResult<()> {
            let name_val = self.new_string(name)?;
            let value_val = self.import_object(&value)?;
            self.scopes
                .declare(&mut self.heap, 0, name_val, value_val, is_const)
                .map_err(|code| self.throw(code, "variable already declared in this scope"))
        })();
        result.map_err(|e| self.error_to_report(e))
    }

    /// Looks a variable up through the scope chain.
    pub fn var_get(&mut self, name: &str) -> Result<Option<Object>, Exception> {
        let result = (|| -> EvalResult<Option<Value>> {
            let name_val = self.new_string(name)?;
            Ok(self
                .scopes
                .var_search(&self.heap, name_val, self.config.var_lookup_depth)
                .map(|(_, v)| v))
        })();
        match result {
            Ok(v) => Ok(v.map(|v| self.export_value(v))),
            Err(e) => Err(self.error_to_report(e)),
        }
    }

    /// Assigns an existing variable through the scope chain.
    pub fn var_set(&mut self, name: &str, value: Object) -> Result<(), Exception> {
        let result = (|| -> EvalResult<()> {
            let name_val = self.new_string(name)?;
            let value_val = self.import_object(&value)?;
            self.scopes
                .var_assign(&mut self.heap, name_val, value_val)
                .map_err(|code| match code {
                    ResultCode::NotFound => self.throw(ResultCode::UnknownIdentifier, "assignment to undeclared variable"),
                    other => self.throw(other, "assignment refused"),
                })
        })();
        result.map_err(|e| self.error_to_report(e))
    }

    // --- Embedding API: natives and keywords ---

    /// Registers a native function as a const variable in the root scope.
    pub fn register_native(&mut self, name: &str, hook: NativeHook) -> Result<(), Exception> {
        let index = u32::try_from(self.natives.len()).expect("native registration count exceeds u32");
        self.natives.push(NativeRegistration {
            name: name.to_owned(),
            hook,
        });
        let result = (|| -> EvalResult<()> {
            let f = self.new_func(FuncData {
                kind: FuncKind::Native(index),
                meta: ContainerMeta::default(),
            })?;
            let name_val = self.new_string(name)?;
            self.scopes
                .declare(&mut self.heap, 1, name_val, f, true)
                .map_err(|code| self.throw(code, "native name already declared"))
        })();
        result.map_err(|e| self.error_to_report(e))
    }

    /// Registers a user-defined keyword resolving to a fixed value.
    pub fn register_keyword(&mut self, name: &str, value: Object) -> Result<(), Exception> {
        let result = (|| -> EvalResult<()> {
            let v = self.import_object(&value)?;
            crate::keyword::register_ukwd(self, name, v)
        })();
        result.map_err(|e| self.error_to_report(e))
    }

    // --- Embedding API: prototypes ---

    /// The prototype of the value a root variable holds, exported.
    pub fn prototype_get(&mut self, var_name: &str) -> Result<Option<Object>, Exception> {
        let result = (|| -> EvalResult<Option<Value>> {
            let name_val = self.new_string(var_name)?;
            let Some((_, v)) = self.scopes.var_search(&self.heap, name_val, 0) else {
                return Ok(None);
            };
            let proto = self.proto_of(v);
            Ok((!proto.same(Value::Undef)).then_some(proto))
        })();
        match result {
            Ok(v) => Ok(v.map(|v| self.export_value(v))),
            Err(e) => Err(self.error_to_report(e)),
        }
    }

    /// Replaces the prototype of the container held by `var_name` with the
    /// container held by `proto_var`.
    pub fn prototype_set(&mut self, var_name: &str, proto_var: &str) -> Result<(), Exception> {
        let result = (|| -> EvalResult<()> {
            let name_val = self.new_string(var_name)?;
            let proto_name = self.new_string(proto_var)?;
            let Some((_, v)) = self.scopes.var_search(&self.heap, name_val, 0) else {
                return Err(self.throw(ResultCode::NotFound, "no such variable"));
            };
            let Some((_, p)) = self.scopes.var_search(&self.heap, proto_name, 0) else {
                return Err(self.throw(ResultCode::NotFound, "no such prototype variable"));
            };
            self.set_proto(v, p)
        })();
        result.map_err(|e| self.error_to_report(e))
    }

    /// Replaces a container's prototype, honoring the no-prototype-set flag.
    pub(crate) fn set_proto(&mut self, v: Value, proto: Value) -> EvalResult<()> {
        let Some(id) = v.ref_id() else {
            return Err(self.throw(ResultCode::Type, "value has a fixed prototype"));
        };
        if self.heap.get(id).meta().is_none() {
            return Err(self.throw(ResultCode::Type, "value has a fixed prototype"));
        }
        if self.derives_from_value(proto, v) || proto.same(v) {
            return Err(self.throw(ResultCode::CyclesDetected, "prototype cycle"));
        }
        let owner = self.heap.owner_level(id);
        self.scopes.rescope(&mut self.heap, owner, proto);
        self.scopes.vref(&mut self.heap, proto).map_err(EvalError::Fatal)?;
        let old = {
            let meta = self.heap.get_mut(id).meta_mut().expect("checked above");
            if meta.flags & CONT_NO_PROTO_SET != 0 {
                None
            } else {
                Some(std::mem::replace(&mut meta.proto, proto))
            }
        };
        match old {
            Some(old) => {
                self.scopes.vunref(&mut self.heap, old);
                Ok(())
            }
            None => {
                self.scopes.vunref(&mut self.heap, proto);
                Err(self.throw(ResultCode::DisallowPrototypeSet, "container forbids prototype changes"))
            }
        }
    }

    // --- Embedding API: weak references ---

    /// Issues a weak handle to the value `var_name` currently holds, or
    /// `None` when no such variable exists. The handle does not keep the
    /// value alive.
    pub fn weak_handle(&mut self, var_name: &str) -> Result<Option<WeakHandle>, Exception> {
        let result = (|| -> EvalResult<Option<WeakHandle>> {
            let name_val = self.new_string(var_name)?;
            let Some((_, v)) = self.scopes.var_search(&self.heap, name_val, 0) else {
                return Ok(None);
            };
            Ok(Some(match v.ref_id() {
                Some(id) => WeakHandle(WeakKind::Slot(self.heap.weak_ref(id))),
                None => WeakHandle(WeakKind::Immortal(self.export_value(v))),
            }))
        })();
        result.map_err(|e| self.error_to_report(e))
    }

    /// Dereferences a weak handle: the exported value while the target is
    /// alive, `None` once it has been finalized. Slot reuse by later
    /// allocations never resurrects a dead handle.
    #[must_use]
    pub fn weak_deref(&self, handle: &WeakHandle) -> Option<Object> {
        match &handle.0 {
            WeakKind::Immortal(obj) => Some(obj.clone()),
            WeakKind::Slot(weak) => self
                .heap
                .weak_get(*weak)
                .map(|id| self.export_value(Value::Ref(id))),
        }
    }

    /// Whether the value in `var_name` derives from the value in `ancestor_var`.
    pub fn derives_from(&mut self, var_name: &str, ancestor_var: &str) -> Result<bool, Exception> {
        let result = (|| -> EvalResult<bool> {
            let name_val = self.new_string(var_name)?;
            let anc_name = self.new_string(ancestor_var)?;
            let Some((_, v)) = self.scopes.var_search(&self.heap, name_val, 0) else {
                return Err(self.throw(ResultCode::NotFound, "no such variable"));
            };
            let Some((_, a)) = self.scopes.var_search(&self.heap, anc_name, 0) else {
                return Err(self.throw(ResultCode::NotFound, "no such ancestor variable"));
            };
            Ok(self.derives_from_value(v, a))
        })();
        result.map_err(|e| self.error_to_report(e))
    }

    // --- Failure conversion ---

    /// Converts any propagating error into the public report form. Flow
    /// control escaping to the API boundary is a misuse.
    pub(crate) fn error_to_report(&mut self, err: EvalError) -> Exception {
        match err {
            EvalError::Exception(v) | EvalError::Uncatchable(v) => {
                let code = match v.ref_id().map(|id| self.heap.get(id)) {
                    Some(HeapData::Exception(e)) => e.code,
                    _ => ResultCode::Exception,
                };
                let report = self.export_exception(v, code);
                self.scopes.vunhand(&mut self.heap, v);
                report
            }
            EvalError::Engine(err) => {
                let mut boxed = err;
                let mut report = boxed.take_report();
                if report.script.is_none() {
                    report.script = self.script.as_ref().map(|s| s.name.to_string());
                }
                report
            }
            EvalError::Oom => Exception::new(ResultCode::Oom, ""),
            EvalError::Fatal(code) => Exception::new(code, "fatal engine corruption"),
            EvalError::Interrupted => Exception::new(ResultCode::Interrupted, "interrupted"),
            EvalError::Exit(v) | EvalError::Return(v) | EvalError::Break(v) => {
                self.scopes.vunhand(&mut self.heap, v);
                Exception::new(ResultCode::Misuse, "flow-control code escaped its construct")
            }
            EvalError::Continue => Exception::new(ResultCode::Misuse, "flow-control code escaped its construct"),
        }
    }
}

impl<T: ResourceTracker> std::fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("scope_depth", &self.scopes.depth())
            .field("live_values", &self.heap.live_count())
            .field("skip_level", &self.skip_level)
            .finish_non_exhaustive()
    }
}
