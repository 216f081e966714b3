//! Scope stack, value ownership, and the sweep/vacuum garbage passes.
//!
//! Every heap value is owned by exactly one scope: the oldest scope that ever
//! referenced it. Ownership only ever moves upward (toward older scopes).
//! Each scope keeps its owned slots in one of four sets: plain-old-data,
//! containers, refcount-0 probationary, and vacuum-safe. A value is in exactly
//! one set at a time.
//!
//! Finalization is re-entrancy safe: while a destruction pass is running,
//! values whose refcount reaches zero are queued and flushed when the
//! outermost pass completes, which makes cycle teardown safe without
//! recursion.

use ahash::AHashSet;

use crate::{
    heap::{Heap, HeapId},
    props::{PROP_CONST, Props, SetOutcome},
    rc::ResultCode,
    resource::ResourceTracker,
    value::{Value, key_eq},
};

/// One scope frame.
#[derive(Debug, Default)]
pub(crate) struct Scope {
    /// Monotonic depth, root = 1.
    pub level: u32,
    /// The scope's variables.
    pub vars: Props,
    /// Owned non-container values (strings).
    pod: AHashSet<HeapId>,
    /// Owned container values.
    containers: AHashSet<HeapId>,
    /// Owned refcount-0 probationary values, eligible for sweep.
    probation: AHashSet<HeapId>,
    /// Owned values explicitly protected from vacuum.
    vacuum_safe: AHashSet<HeapId>,
    /// Strong references protecting evaluation temporaries; truncated to the
    /// pre-expression length when each expression completes.
    pub eval_holder: Vec<Value>,
    /// True while a vacuum pass runs in this scope (vacuum is not reentrant).
    vacuuming: bool,
}

impl Scope {
    fn reset(&mut self, level: u32) {
        self.level = level;
        self.vars = Props::new();
        self.pod.clear();
        self.containers.clear();
        self.probation.clear();
        self.vacuum_safe.clear();
        self.eval_holder.clear();
        self.vacuuming = false;
    }

    fn owns(&self, id: HeapId) -> bool {
        self.pod.contains(&id)
            || self.containers.contains(&id)
            || self.probation.contains(&id)
            || self.vacuum_safe.contains(&id)
    }

    fn remove_everywhere(&mut self, id: HeapId) {
        self.pod.remove(&id);
        self.containers.remove(&id);
        self.probation.remove(&id);
        self.vacuum_safe.remove(&id);
    }

    /// Number of values owned by this scope (all four sets).
    pub fn owned_count(&self) -> usize {
        self.pod.len() + self.containers.len() + self.probation.len() + self.vacuum_safe.len()
    }
}

/// Which set a value belongs to, for rescoping moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnSet {
    Pod,
    Containers,
    Probation,
    VacuumSafe,
}

/// The stack of scopes plus the shared finalization machinery.
#[derive(Debug, Default)]
pub(crate) struct ScopeStack {
    frames: Vec<Scope>,
    recycled: Vec<Scope>,
    /// Deferred-finalization queue, flushed when the outermost destruction
    /// pass completes.
    gc_queue: Vec<HeapId>,
    destruction_depth: u32,
    /// Reused scratch for child traversal, kept to avoid allocation storms
    /// during vacuum and teardown.
    scratch: Vec<Value>,
    mark_scratch: AHashSet<HeapId>,
    /// Counters reported through the engine's metrics.
    pub swept_total: u64,
    pub vacuumed_total: u64,
}

impl ScopeStack {
    pub fn new() -> Self {
        let mut stack = Self::default();
        stack.push();
        stack
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current_level(&self) -> u32 {
        self.frames.last().map_or(0, |s| s.level)
    }

    pub fn current(&self) -> &Scope {
        self.frames.last().expect("scope stack is never empty")
    }

    pub fn current_mut(&mut self) -> &mut Scope {
        self.frames.last_mut().expect("scope stack is never empty")
    }

    pub fn frame(&self, level: u32) -> &Scope {
        &self.frames[(level - 1) as usize]
    }

    fn frame_mut(&mut self, level: u32) -> &mut Scope {
        &mut self.frames[(level - 1) as usize]
    }

    /// Pushes a scope frame, reusing a recycled frame when available.
    pub fn push(&mut self) -> u32 {
        let level = self.frames.len() as u32 + 1;
        let mut frame = self.recycled.pop().unwrap_or_default();
        frame.reset(level);
        self.frames.push(frame);
        level
    }

    /// Registers a freshly allocated value with the current scope.
    pub fn adopt<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, id: HeapId) {
        let level = self.current_level();
        heap.set_owner_level(id, level);
        self.current_mut().probation.insert(id);
    }

    /// Adds a reference. For probationary values this is the moment they move
    /// to their scope's pod/container set.
    pub fn vref<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, v: Value) -> Result<(), ResultCode> {
        let Some(id) = v.ref_id() else { return Ok(()) };
        if heap.is_probationary(id) {
            let is_container = heap.get(id).is_container();
            let level = heap.owner_level(id);
            let frame = self.frame_mut(level);
            if frame.probation.remove(&id) {
                if is_container {
                    frame.containers.insert(id);
                } else {
                    frame.pod.insert(id);
                }
            }
        }
        heap.inc_ref(id).map_err(|()| ResultCode::Fatal)
    }

    /// Drops a reference; finalizes the value when the count reaches zero.
    /// A probationary (refcount-0) value is finalized outright.
    pub fn vunref<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, v: Value) {
        let Some(id) = v.ref_id() else { return };
        if !heap.is_live(id) {
            heap.mark_dead();
            return;
        }
        if heap.refcount(id) == 0 || heap.dec_ref_raw(id) == 0 {
            self.finalize(heap, id);
        }
    }

    /// Drops a reference without ever finalizing: a value whose count reaches
    /// zero is re-probated into its scope's sweep list instead. Used to
    /// release a local hold while the value propagates outward.
    pub fn vunhand<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, v: Value) -> Value {
        let Some(id) = v.ref_id() else { return v };
        if !heap.is_live(id) {
            heap.mark_dead();
            return Value::Undef;
        }
        if heap.refcount(id) > 0 && heap.dec_ref_raw(id) == 0 {
            self.reprobate(heap, id);
        }
        v
    }

    /// Explicit re-probation: a refcount-0 value re-enters its scope's sweep
    /// list so a later sweep can reclaim it.
    fn reprobate<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, id: HeapId) {
        heap.set_probation(id, true);
        let level = heap.owner_level(id);
        let frame = self.frame_mut(level);
        frame.remove_everywhere(id);
        frame.probation.insert(id);
    }

    /// Moves a value between its scope's normal and vacuum-safe lists.
    pub fn make_vacuum_proof<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, v: Value, flag: bool) {
        let Some(id) = v.ref_id() else { return };
        if heap.is_vacuum_proof(id) == flag {
            return;
        }
        heap.set_vacuum_proof(id, flag);
        let is_container = heap.get(id).is_container();
        let probation = heap.is_probationary(id);
        let level = heap.owner_level(id);
        let frame = self.frame_mut(level);
        frame.remove_everywhere(id);
        if flag {
            frame.vacuum_safe.insert(id);
        } else if probation {
            frame.probation.insert(id);
        } else if is_container {
            frame.containers.insert(id);
        } else {
            frame.pod.insert(id);
        }
    }

    /// Finalizes a value now, or queues it when a destruction pass is already
    /// running (cycle-safe teardown).
    fn finalize<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, id: HeapId) {
        if self.destruction_depth > 0 {
            self.gc_queue.push(id);
            return;
        }
        self.destruction_depth = 1;
        self.finalize_now(heap, id);
        self.flush_gc_queue(heap);
        self.destruction_depth = 0;
    }

    fn flush_gc_queue<T: ResourceTracker>(&mut self, heap: &mut Heap<T>) {
        while let Some(id) = self.gc_queue.pop() {
            if heap.is_live(id) {
                self.finalize_now(heap, id);
            }
        }
    }

    /// The actual teardown of one slot: detach from its scope, release the
    /// payload, and unref children (which may enqueue further finalizations).
    fn finalize_now<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, id: HeapId) {
        let level = heap.owner_level(id);
        if level >= 1 && (level as usize) <= self.frames.len() {
            self.frame_mut(level).remove_everywhere(id);
        }
        let data = heap.free_slot(id);
        let mut children = std::mem::take(&mut self.scratch);
        children.clear();
        data.collect_children(&mut children);
        drop(data);
        for child in children.drain(..) {
            if let Some(cid) = child.ref_id() {
                if !heap.is_live(cid) {
                    continue;
                }
                if heap.refcount(cid) == 0 || heap.dec_ref_raw(cid) == 0 {
                    self.gc_queue.push(cid);
                }
            }
        }
        self.scratch = children;
    }

    /// Pops the current scope. Values listed in `keep` are rescoped into the
    /// parent first so propagating results and exceptions survive the pop.
    /// Root is never popped.
    pub fn pop<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, keep: &[Value]) {
        if self.frames.len() <= 1 {
            return;
        }
        let parent_level = self.current_level() - 1;
        for v in keep {
            self.rescope(heap, parent_level, *v);
        }
        let mut frame = self.frames.pop().expect("checked depth above");

        // Scope variables hold one reference on each key and value.
        self.destruction_depth += 1;
        for (key, slot) in frame.vars.drain_all() {
            self.release_during_destruction(heap, key);
            self.release_during_destruction(heap, slot.value);
        }
        for v in frame.eval_holder.drain(..) {
            self.release_during_destruction(heap, v);
        }
        // Everything still owned by the popped scope is unreachable from
        // older scopes (ownership invariant): tear it all down.
        let owned: Vec<HeapId> = frame
            .probation
            .drain()
            .chain(frame.pod.drain())
            .chain(frame.containers.drain())
            .chain(frame.vacuum_safe.drain())
            .collect();
        for id in owned {
            if heap.is_live(id) {
                self.finalize_now(heap, id);
            }
        }
        self.destruction_depth -= 1;
        if self.destruction_depth == 0 {
            self.flush_gc_queue(heap);
        }
        self.recycled.push(frame);
    }

    fn release_during_destruction<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, v: Value) {
        if let Some(id) = v.ref_id() {
            if !heap.is_live(id) {
                return;
            }
            if heap.refcount(id) == 0 || heap.dec_ref_raw(id) == 0 {
                self.gc_queue.push(id);
            }
        }
    }

    /// Moves `v` (and transitively its referents) up to `target_level` when it
    /// is currently owned by a newer scope. Rescoping never moves downward.
    pub fn rescope<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, target_level: u32, v: Value) {
        let Some(id) = v.ref_id() else { return };
        if target_level == 0 || !heap.is_live(id) || heap.owner_level(id) <= target_level {
            return;
        }
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            if !heap.is_live(id) || heap.owner_level(id) <= target_level {
                continue;
            }
            let from_level = heap.owner_level(id);
            let set = {
                let frame = self.frame_mut(from_level);
                let set = if frame.probation.contains(&id) {
                    OwnSet::Probation
                } else if frame.containers.contains(&id) {
                    OwnSet::Containers
                } else if frame.vacuum_safe.contains(&id) {
                    OwnSet::VacuumSafe
                } else {
                    OwnSet::Pod
                };
                frame.remove_everywhere(id);
                set
            };
            let target = self.frame_mut(target_level);
            match set {
                OwnSet::Pod => {
                    target.pod.insert(id);
                }
                OwnSet::Containers => {
                    target.containers.insert(id);
                }
                OwnSet::Probation => {
                    target.probation.insert(id);
                }
                OwnSet::VacuumSafe => {
                    target.vacuum_safe.insert(id);
                }
            }
            heap.set_owner_level(id, target_level);
            let mut children = std::mem::take(&mut self.scratch);
            children.clear();
            heap.get(id).collect_children(&mut children);
            for child in children.drain(..) {
                if let Some(cid) = child.ref_id()
                    && heap.is_live(cid)
                    && heap.owner_level(cid) > target_level
                {
                    work.push(cid);
                }
            }
            self.scratch = children;
        }
    }

    /// Frees the current scope's probationary values. Returns how many were
    /// reclaimed.
    pub fn sweep<T: ResourceTracker>(&mut self, heap: &mut Heap<T>) -> usize {
        let ids: Vec<HeapId> = self.current_mut().probation.drain().collect();
        let mut swept = 0;
        for id in ids {
            if heap.is_live(id) && heap.refcount(id) == 0 {
                self.finalize(heap, id);
                swept += 1;
            }
        }
        self.swept_total += swept as u64;
        swept
    }

    /// Frees every value in the current scope not reachable from the scope's
    /// variables, its eval holder, or its vacuum-safe list. Equivalent to the
    /// twin-scope shuffle, implemented as reachability marking with reused
    /// scratch storage. Returns how many values were reclaimed, or `Misuse`
    /// when invoked recursively.
    pub fn vacuum<T: ResourceTracker>(&mut self, heap: &mut Heap<T>) -> Result<usize, ResultCode> {
        if self.current().vacuuming {
            return Err(ResultCode::Misuse);
        }
        self.current_mut().vacuuming = true;
        let level = self.current_level();

        let mut marked = std::mem::take(&mut self.mark_scratch);
        marked.clear();
        let mut work = std::mem::take(&mut self.scratch);
        work.clear();
        {
            let frame = self.current();
            frame.vars.collect_children(&mut work);
            work.extend_from_slice(&frame.eval_holder);
            for &id in &frame.vacuum_safe {
                work.push(Value::Ref(id));
            }
        }
        while let Some(v) = work.pop() {
            let Some(id) = v.ref_id() else { continue };
            if !heap.is_live(id) || !marked.insert(id) {
                continue;
            }
            heap.get(id).collect_children(&mut work);
        }

        let victims: Vec<HeapId> = {
            let frame = self.current();
            frame
                .pod
                .iter()
                .chain(frame.containers.iter())
                .chain(frame.probation.iter())
                .copied()
                .filter(|id| !marked.contains(id))
                .collect()
        };
        let count = victims.len();
        self.destruction_depth += 1;
        for id in victims {
            if heap.is_live(id) {
                self.finalize_now(heap, id);
            }
        }
        self.destruction_depth -= 1;
        if self.destruction_depth == 0 {
            self.flush_gc_queue(heap);
        }

        self.scratch = work;
        self.mark_scratch = marked;
        self.vacuumed_total += count as u64;
        let frame = self.frame_mut(level);
        frame.vacuuming = false;
        Ok(count)
    }

    // --- Scope variables ---

    /// Declares a variable in the scope at `level` (current scope when 0).
    /// Fails with `AlreadyExists` when the name is present in that scope.
    pub fn declare<T: ResourceTracker>(
        &mut self,
        heap: &mut Heap<T>,
        level: u32,
        name: Value,
        value: Value,
        is_const: bool,
    ) -> Result<(), ResultCode> {
        let level = if level == 0 { self.current_level() } else { level };
        {
            let frame = self.frame(level);
            if frame.vars.find(name, |a, b| key_eq(a, b, heap)).is_some() {
                return Err(ResultCode::AlreadyExists);
            }
        }
        self.rescope(heap, level, name);
        self.rescope(heap, level, value);
        self.vref(heap, name)?;
        self.vref(heap, value)?;
        let flags = if is_const { PROP_CONST } else { 0 };
        let mut old = None;
        let frame = self.frame_mut(level);
        // Absence was verified with the full loose comparison above, so an
        // identity comparison cannot match and this always inserts.
        let outcome = frame
            .vars
            .set(name, value, flags, |a, b| a.same(b), &mut old)
            .expect("fresh declaration cannot hit a const entry");
        debug_assert_eq!(outcome, SetOutcome::Inserted, "presence was checked above");
        Ok(())
    }

    /// Searches the scope chain (innermost first) for `name`, up to
    /// `max_depth` frames (0 = unbounded).
    pub fn var_search<T: ResourceTracker>(
        &self,
        heap: &Heap<T>,
        name: Value,
        max_depth: usize,
    ) -> Option<(u32, Value)> {
        for (walked, frame) in self.frames.iter().rev().enumerate() {
            if max_depth > 0 && walked >= max_depth {
                return None;
            }
            if let Some(slot) = frame.vars.get(name, |a, b| key_eq(a, b, heap)) {
                return Some((frame.level, slot.value));
            }
        }
        None
    }

    /// Removes a variable found via scope-chain search, releasing its key and
    /// value. Returns whether anything was removed; const variables refuse.
    pub fn var_unset<T: ResourceTracker>(&mut self, heap: &mut Heap<T>, name: Value) -> Result<bool, ResultCode> {
        let mut found = None;
        for frame in self.frames.iter().rev() {
            if frame.vars.find(name, |a, b| key_eq(a, b, heap)).is_some() {
                found = Some(frame.level);
                break;
            }
        }
        let Some(level) = found else { return Ok(false) };
        let removed = self.frames[(level - 1) as usize]
            .vars
            .remove(name, |a, b| key_eq(a, b, heap))?;
        if let Some((k, slot)) = removed {
            self.vunref(heap, k);
            self.vunref(heap, slot.value);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Assigns to an existing variable found via scope-chain search.
    /// `NotFound` when undeclared, `ConstViolation` for const variables.
    pub fn var_assign<T: ResourceTracker>(
        &mut self,
        heap: &mut Heap<T>,
        name: Value,
        value: Value,
    ) -> Result<(), ResultCode> {
        let mut found = None;
        for frame in self.frames.iter().rev() {
            if let Some(index) = frame.vars.find(name, |a, b| key_eq(a, b, heap)) {
                found = Some((frame.level, index));
                break;
            }
        }
        let Some((level, index)) = found else {
            return Err(ResultCode::NotFound);
        };
        self.rescope(heap, level, value);
        self.vref(heap, value)?;
        match self.frame_mut(level).vars.set_at(index, value) {
            Ok(old) => {
                self.vunref(heap, old);
                Ok(())
            }
            Err(code) => {
                self.vunref(heap, value);
                Err(code)
            }
        }
    }
}
