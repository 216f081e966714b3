//! The arena backing all heap-allocated values.
//!
//! Slots are reused through a free list, variable-length byte storage goes
//! through a size-classed chunk recycler, and string contents are deduplicated
//! by the interner. Reference counts live here; scope ownership bookkeeping
//! (which scope owns which slot, probation, vacuum-proofing) is split between
//! per-slot fields on [`HeapValue`] and the per-scope id sets in `scope`.
//!
//! Lifetime misuse (operating on a freed slot) is an internal invariant
//! violation: debug builds panic at the access site, release builds set the
//! heap's dead flag, after which the engine's entry points refuse to run.

use std::collections::BTreeMap;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    func::FuncData,
    intern::Interner,
    props::{PropSlot, Props},
    resource::{ResourceError, ResourceTracker},
    value::{TypeTag, Value},
};

/// Index of a heap slot. Stable for the lifetime of the value; reused (with a
/// bumped weak generation) after the value is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).expect("heap index exceeds u32"))
    }
}

/// A weak reference: a slot plus the generation it was issued against.
/// Dereferencing fails once the slot has been finalized or reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WeakRef {
    id: HeapId,
    generation: u32,
}

/// Shared container bookkeeping: property list, prototype, container flags.
#[derive(Debug, Default)]
pub(crate) struct ContainerMeta {
    pub props: Props,
    /// `Value::Undef` means "no explicit prototype"; the engine then falls
    /// back to the per-type prototype table.
    pub proto: Value,
    pub flags: u16,
}

impl ContainerMeta {
    pub fn collect_children(&self, out: &mut Vec<Value>) {
        self.props.collect_children(out);
        out.push(self.proto);
    }
}

/// Immutable UTF-8 string payload with a cached is-ASCII flag.
#[derive(Debug)]
pub(crate) struct RtStr {
    bytes: Box<str>,
    is_ascii: bool,
}

impl RtStr {
    pub fn new(s: impl Into<Box<str>>) -> Self {
        let bytes = s.into();
        let is_ascii = bytes.is_ascii();
        Self { bytes, is_ascii }
    }

    pub fn as_str(&self) -> &str {
        &self.bytes
    }

    pub fn is_ascii(&self) -> bool {
        self.is_ascii
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Character length: byte length for ASCII, code-point count otherwise.
    pub fn char_len(&self) -> usize {
        if self.is_ascii {
            self.bytes.len()
        } else {
            self.bytes.chars().count()
        }
    }
}

/// Array payload: an ordered list plus the container property side.
#[derive(Debug, Default)]
pub(crate) struct Array {
    pub list: Vec<Value>,
    pub meta: ContainerMeta,
}

/// Plain object payload.
#[derive(Debug, Default)]
pub(crate) struct Obj {
    pub meta: ContainerMeta,
}

/// Hash payload: a real hashtable over entry slots, plus the object-side
/// property list every property-capable container carries.
#[derive(Debug, Default)]
pub(crate) struct HashObj {
    pub(crate) buckets: AHashMap<u64, SmallVec<[u32; 1]>>,
    pub(crate) entries: Vec<Option<(Value, PropSlot)>>,
    pub(crate) live: usize,
    pub meta: ContainerMeta,
}

impl HashObj {
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Finds the entry index for `key` under the caller-supplied hash and
    /// equality (the engine's key semantics).
    pub fn find(&self, hash: u64, key: Value, eq: impl Fn(Value, Value) -> bool) -> Option<u32> {
        self.buckets
            .get(&hash)?
            .iter()
            .copied()
            .find(|&i| self.entries[i as usize].as_ref().is_some_and(|(k, _)| eq(*k, key)))
    }

    pub fn entry_value(&self, index: u32) -> Value {
        self.entries[index as usize]
            .as_ref()
            .expect("HashObj::entry_value: dead entry")
            .1
            .value
    }

    /// Inserts or replaces. Returns the previous value when replacing, for
    /// the caller's refcount fixup.
    pub fn insert(
        &mut self,
        hash: u64,
        key: Value,
        value: Value,
        eq: impl Fn(Value, Value) -> bool,
    ) -> Option<Value> {
        if let Some(i) = self.find(hash, key, &eq) {
            let slot = self.entries[i as usize].as_mut().expect("live entry");
            let old = slot.1.value;
            slot.1.value = value;
            return Some(old);
        }
        let index = u32::try_from(self.entries.len()).expect("hash entry count exceeds u32");
        self.entries.push(Some((key, PropSlot { value, flags: 0 })));
        self.buckets.entry(hash).or_default().push(index);
        self.live += 1;
        None
    }

    /// Removes the entry, returning its key and value for the caller to unref.
    pub fn remove(&mut self, hash: u64, key: Value, eq: impl Fn(Value, Value) -> bool) -> Option<(Value, Value)> {
        let i = self.find(hash, key, &eq)?;
        let bucket = self.buckets.get_mut(&hash).expect("bucket exists for found entry");
        bucket.retain(|e| *e != i);
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        let (k, slot) = self.entries[i as usize].take().expect("live entry");
        self.live -= 1;
        Some((k, slot.value))
    }

    /// Raw slot count, including tombstones (stable during iteration).
    pub fn raw_len(&self) -> usize {
        self.entries.len()
    }

    /// The live entry at a raw slot index, if any.
    pub fn entry_at(&self, index: usize) -> Option<(Value, PropSlot)> {
        self.entries.get(index)?.as_ref().map(|(k, s)| (*k, *s))
    }

    /// Live entries in insertion order.
    pub fn iter_entries(&self) -> impl Iterator<Item = (Value, PropSlot)> + '_ {
        self.entries.iter().filter_map(|e| e.as_ref().map(|(k, s)| (*k, *s)))
    }

    /// Drains every entry for finalization.
    pub fn drain_entries(&mut self) -> Vec<(Value, PropSlot)> {
        self.buckets.clear();
        self.live = 0;
        self.entries.drain(..).flatten().collect()
    }

    pub fn collect_children(&self, out: &mut Vec<Value>) {
        for (k, s) in self.iter_entries() {
            out.push(k);
            out.push(s.value);
        }
        self.meta.collect_children(out);
    }
}

/// Mutable byte buffer payload.
#[derive(Debug, Default)]
pub(crate) struct Buffer {
    pub bytes: Vec<u8>,
    pub meta: ContainerMeta,
}

/// Exception payload: a result code plus the usual property side
/// (`message`, `script`, `line`, `column`, `stacktrace` live in the props).
#[derive(Debug)]
pub(crate) struct ExcData {
    pub code: crate::rc::ResultCode,
    pub meta: ContainerMeta,
}

/// Host-opaque native payload.
pub(crate) struct NativeData {
    pub type_name: &'static str,
    pub data: std::rc::Rc<dyn std::any::Any>,
    pub meta: ContainerMeta,
}

impl std::fmt::Debug for NativeData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeData").field("type_name", &self.type_name).finish()
    }
}

/// Unique payload: an identity-carrying wrapper around one value, used for
/// enum entries. Not property-capable.
#[derive(Debug)]
pub(crate) struct Unique {
    pub wrapped: Value,
}

/// Tuple payload: fixed slots, no properties.
#[derive(Debug, Default)]
pub(crate) struct Tuple {
    pub slots: Box<[Value]>,
}

/// The concrete storage for each heap value kind.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(RtStr),
    Array(Array),
    Object(Obj),
    Hash(HashObj),
    Buffer(Buffer),
    Function(FuncData),
    Exception(ExcData),
    Native(NativeData),
    Unique(Unique),
    Tuple(Tuple),
}

impl HeapData {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::Str(_) => TypeTag::String,
            Self::Array(_) => TypeTag::Array,
            Self::Object(_) => TypeTag::Object,
            Self::Hash(_) => TypeTag::Hash,
            Self::Buffer(_) => TypeTag::Buffer,
            Self::Function(_) => TypeTag::Function,
            Self::Exception(_) => TypeTag::Exception,
            Self::Native(_) => TypeTag::Native,
            Self::Unique(_) => TypeTag::Unique,
            Self::Tuple(_) => TypeTag::Tuple,
        }
    }

    /// Static variant name for stats breakdowns.
    pub fn kind_name(&self) -> &'static str {
        self.type_tag().into()
    }

    /// True for kinds that may hold references to other values.
    pub fn is_container(&self) -> bool {
        !matches!(self, Self::Str(_))
    }

    /// True for kinds that carry a property list.
    pub fn is_property_capable(&self) -> bool {
        !matches!(self, Self::Str(_) | Self::Tuple(_) | Self::Unique(_))
    }

    pub fn meta(&self) -> Option<&ContainerMeta> {
        match self {
            Self::Array(v) => Some(&v.meta),
            Self::Object(v) => Some(&v.meta),
            Self::Hash(v) => Some(&v.meta),
            Self::Buffer(v) => Some(&v.meta),
            Self::Function(v) => Some(&v.meta),
            Self::Exception(v) => Some(&v.meta),
            Self::Native(v) => Some(&v.meta),
            Self::Str(_) | Self::Unique(_) | Self::Tuple(_) => None,
        }
    }

    pub fn meta_mut(&mut self) -> Option<&mut ContainerMeta> {
        match self {
            Self::Array(v) => Some(&mut v.meta),
            Self::Object(v) => Some(&mut v.meta),
            Self::Hash(v) => Some(&mut v.meta),
            Self::Buffer(v) => Some(&mut v.meta),
            Self::Function(v) => Some(&mut v.meta),
            Self::Exception(v) => Some(&mut v.meta),
            Self::Native(v) => Some(&mut v.meta),
            Self::Str(_) | Self::Unique(_) | Self::Tuple(_) => None,
        }
    }

    /// Appends every directly referenced value handle to `out`.
    pub fn collect_children(&self, out: &mut Vec<Value>) {
        match self {
            Self::Str(_) => {}
            Self::Array(a) => {
                out.extend_from_slice(&a.list);
                a.meta.collect_children(out);
            }
            Self::Object(o) => o.meta.collect_children(out),
            Self::Hash(h) => h.collect_children(out),
            Self::Buffer(b) => b.meta.collect_children(out),
            Self::Function(f) => f.collect_children(out),
            Self::Exception(e) => e.meta.collect_children(out),
            Self::Native(n) => n.meta.collect_children(out),
            Self::Unique(u) => out.push(u.wrapped),
            Self::Tuple(t) => out.extend_from_slice(&t.slots),
        }
    }

    /// Rough byte estimate for resource tracking.
    pub fn estimate_size(&self) -> usize {
        let payload = match self {
            Self::Str(s) => s.byte_len(),
            Self::Array(a) => a.list.capacity() * size_of::<Value>(),
            Self::Hash(h) => h.entries.capacity() * size_of::<Option<(Value, PropSlot)>>(),
            Self::Buffer(b) => b.bytes.capacity(),
            Self::Tuple(t) => t.slots.len() * size_of::<Value>(),
            Self::Object(_) | Self::Function(_) | Self::Exception(_) | Self::Native(_) | Self::Unique(_) => 0,
        };
        let props = self.meta().map_or(0, |m| m.props.len() * size_of::<(Value, PropSlot)>());
        size_of::<HeapValue>() + payload + props
    }
}

/// One arena slot: refcount plus scope-ownership bookkeeping plus payload.
///
/// `data` is an `Option` to support the take/restore borrowing discipline:
/// operations that need both the payload and the heap move the payload out,
/// work, and put it back, leaving the refcount and ownership fields reachable.
#[derive(Debug)]
pub(crate) struct HeapValue {
    refcount: u32,
    /// Level of the owning scope (root = 1).
    owner: u32,
    /// True until the first `ref`; probationary values are swept.
    probation: bool,
    /// True for values moved to their scope's vacuum-safe list.
    vacuum_proof: bool,
    data: Option<HeapData>,
}

/// Size-classed recycler for variable-length byte storage.
///
/// Buffers and string-building scratch return their backing stores here; new
/// requests are served from the matching class when possible. Per-class depth
/// is capped so the pool cannot grow without bound.
#[derive(Debug, Default)]
pub(crate) struct ChunkPool {
    classes: [Vec<Vec<u8>>; Self::CLASS_COUNT],
    pub hits: u64,
    pub misses: u64,
}

impl ChunkPool {
    const CLASS_SIZES: [usize; 5] = [64, 256, 1024, 4096, 16384];
    const CLASS_COUNT: usize = 5;
    const MAX_PER_CLASS: usize = 16;

    fn class_for(capacity: usize) -> Option<usize> {
        Self::CLASS_SIZES.iter().position(|&s| capacity <= s)
    }

    /// Takes a cleared chunk with at least `min_capacity` bytes of capacity.
    pub fn take(&mut self, min_capacity: usize) -> Vec<u8> {
        if let Some(class) = Self::class_for(min_capacity)
            && let Some(mut chunk) = self.classes[class].pop()
        {
            chunk.clear();
            self.hits += 1;
            return chunk;
        }
        self.misses += 1;
        Vec::with_capacity(min_capacity)
    }

    /// Returns a chunk to the pool; oversized or overflowing chunks drop.
    pub fn put(&mut self, chunk: Vec<u8>) {
        if chunk.capacity() == 0 {
            return;
        }
        if let Some(class) = Self::class_for(chunk.capacity())
            && self.classes[class].len() < Self::MAX_PER_CLASS
        {
            self.classes[class].push(chunk);
        }
    }
}

/// Snapshot of heap state at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Total number of live values on the heap.
    pub live_values: usize,
    /// Number of free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total arena capacity (live + free).
    pub total_slots: usize,
    /// Breakdown of live values by type-tag name.
    pub values_by_type: BTreeMap<&'static str, usize>,
    /// Number of dynamically interned strings.
    pub interned_strings: usize,
    /// Live allocation count, when the resource tracker keeps one.
    pub tracker_allocations: Option<usize>,
    /// Tracked memory bytes, when the resource tracker keeps one.
    pub tracker_memory_bytes: Option<usize>,
}

/// The arena. Generic over the resource-tracking strategy so the unlimited
/// case compiles to no-ops.
#[derive(Debug)]
pub(crate) struct Heap<T: ResourceTracker> {
    entries: Vec<Option<HeapValue>>,
    free_list: Vec<HeapId>,
    /// Per-slot reuse counters backing the weak-reference registry.
    generations: Vec<u32>,
    tracker: T,
    pub interner: Interner,
    pub chunks: ChunkPool,
    /// Set on detected lifetime corruption; checked by engine entry points.
    dead: bool,
}

impl<T: ResourceTracker> Heap<T> {
    pub fn new(capacity: usize, tracker: T, interning: bool) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            generations: Vec::with_capacity(capacity),
            tracker,
            interner: Interner::new(interning),
            chunks: ChunkPool::default(),
            dead: false,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn mark_dead(&mut self) {
        debug_assert!(false, "heap corruption detected");
        self.dead = true;
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Allocates a slot for `data` with refcount 0 (probationary) and no
    /// owner; the scope layer records ownership immediately afterwards.
    pub fn alloc_raw(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.tracker.on_allocate(|| data.estimate_size())?;
        let entry = HeapValue {
            refcount: 0,
            owner: 0,
            probation: true,
            vacuum_proof: false,
            data: Some(data),
        };
        let id = if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId::from_index(self.entries.len());
            self.entries.push(Some(entry));
            self.generations.push(0);
            id
        };
        Ok(id)
    }

    fn slot(&self, id: HeapId, what: &'static str) -> &HeapValue {
        match self.entries.get(id.index()).and_then(Option::as_ref) {
            Some(v) => v,
            None => panic!("Heap::{what}: slot {} missing or freed", id.index()),
        }
    }

    fn slot_mut(&mut self, id: HeapId, what: &'static str) -> &mut HeapValue {
        match self.entries.get_mut(id.index()).and_then(Option::as_mut) {
            Some(v) => v,
            None => panic!("Heap::{what}: slot {} missing or freed", id.index()),
        }
    }

    pub fn get(&self, id: HeapId) -> &HeapData {
        self.slot(id, "get").data.as_ref().expect("Heap::get: data borrowed")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.slot_mut(id, "get_mut")
            .data
            .as_mut()
            .expect("Heap::get_mut: data borrowed")
    }

    pub fn get_if_live(&self, id: HeapId) -> Option<&HeapData> {
        self.entries.get(id.index())?.as_ref()?.data.as_ref()
    }

    /// String content of a slot, tolerant of borrowed or freed slots.
    pub fn str_if_live(&self, id: HeapId) -> Option<&str> {
        match self.get_if_live(id)? {
            HeapData::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_live(&self, id: HeapId) -> bool {
        self.entries.get(id.index()).is_some_and(Option::is_some)
    }

    /// Moves the payload out for a heap-and-payload operation.
    pub fn take_data(&mut self, id: HeapId) -> HeapData {
        self.slot_mut(id, "take_data")
            .data
            .take()
            .expect("Heap::take_data: data already borrowed")
    }

    pub fn restore_data(&mut self, id: HeapId, data: HeapData) {
        let slot = self.slot_mut(id, "restore_data");
        debug_assert!(slot.data.is_none(), "Heap::restore_data: data not taken");
        slot.data = Some(data);
    }

    pub fn refcount(&self, id: HeapId) -> u32 {
        self.slot(id, "refcount").refcount
    }

    /// Increments the refcount and clears probation. Overflow is fatal.
    pub fn inc_ref(&mut self, id: HeapId) -> Result<(), ()> {
        let slot = self.slot_mut(id, "inc_ref");
        match slot.refcount.checked_add(1) {
            Some(rc) => {
                slot.refcount = rc;
                slot.probation = false;
                Ok(())
            }
            None => {
                self.mark_dead();
                Err(())
            }
        }
    }

    /// Decrements the refcount without freeing. Returns the new count.
    /// A decrement at zero is the caller's signal to finalize.
    pub fn dec_ref_raw(&mut self, id: HeapId) -> u32 {
        let slot = self.slot_mut(id, "dec_ref_raw");
        slot.refcount = slot.refcount.saturating_sub(1);
        slot.refcount
    }

    pub fn owner_level(&self, id: HeapId) -> u32 {
        self.slot(id, "owner_level").owner
    }

    pub fn set_owner_level(&mut self, id: HeapId, level: u32) {
        self.slot_mut(id, "set_owner_level").owner = level;
    }

    pub fn is_probationary(&self, id: HeapId) -> bool {
        self.slot(id, "is_probationary").probation
    }

    /// Explicit re-probation (used when a propagated temp is handed back to
    /// the sweep discipline).
    pub fn set_probation(&mut self, id: HeapId, flag: bool) {
        self.slot_mut(id, "set_probation").probation = flag;
    }

    pub fn is_vacuum_proof(&self, id: HeapId) -> bool {
        self.slot(id, "is_vacuum_proof").vacuum_proof
    }

    pub fn set_vacuum_proof(&mut self, id: HeapId, flag: bool) {
        self.slot_mut(id, "set_vacuum_proof").vacuum_proof = flag;
    }

    /// Releases the slot, returning the payload for child-unref processing.
    ///
    /// Bumps the weak generation (O(1) invalidation of all weak refs to this
    /// slot), removes interned string entries, notifies the tracker, and adds
    /// the slot to the free list.
    pub fn free_slot(&mut self, id: HeapId) -> HeapData {
        let slot = self
            .entries
            .get_mut(id.index())
            .expect("Heap::free_slot: slot missing")
            .take()
            .expect("Heap::free_slot: already freed");
        self.generations[id.index()] = self.generations[id.index()].wrapping_add(1);
        let data = slot.data.expect("Heap::free_slot: data borrowed during finalization");
        self.tracker.on_free(|| data.estimate_size());
        if let HeapData::Str(s) = &data {
            self.interner.remove(s.as_str());
        }
        self.free_list.push(id);
        data
    }

    /// Issues a weak reference to a live slot.
    pub fn weak_ref(&self, id: HeapId) -> WeakRef {
        WeakRef {
            id,
            generation: self.generations[id.index()],
        }
    }

    /// Dereferences a weak reference; `None` once the target was finalized.
    pub fn weak_get(&self, weak: WeakRef) -> Option<HeapId> {
        (self.generations.get(weak.id.index()) == Some(&weak.generation) && self.is_live(weak.id)).then_some(weak.id)
    }

    /// Iterates all live slot ids. Used by vacuum marking and stats.
    pub fn live_ids(&self) -> impl Iterator<Item = HeapId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| HeapId::from_index(i))
    }

    pub fn live_count(&self) -> usize {
        self.entries.len() - self.free_list.len()
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> HeapStats {
        let mut values_by_type = BTreeMap::new();
        for entry in self.entries.iter().flatten() {
            if let Some(data) = &entry.data {
                *values_by_type.entry(data.kind_name()).or_insert(0) += 1;
            }
        }
        HeapStats {
            live_values: self.live_count(),
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
            values_by_type,
            interned_strings: self.interner.len(),
            tracker_allocations: self.tracker.allocations(),
            tracker_memory_bytes: self.tracker.memory_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(4, NoLimitTracker, true)
    }

    #[test]
    fn alloc_starts_probationary_at_refcount_zero() {
        let mut heap = heap();
        let id = heap.alloc_raw(HeapData::Str(RtStr::new("hi"))).unwrap();
        assert_eq!(heap.refcount(id), 0);
        assert!(heap.is_probationary(id));
    }

    #[test]
    fn inc_ref_clears_probation_permanently() {
        let mut heap = heap();
        let id = heap.alloc_raw(HeapData::Str(RtStr::new("hi"))).unwrap();
        heap.inc_ref(id).unwrap();
        assert!(!heap.is_probationary(id));
        assert_eq!(heap.dec_ref_raw(id), 0);
        assert!(!heap.is_probationary(id), "probation never returns implicitly");
    }

    #[test]
    fn free_slot_recycles_and_invalidates_weak_refs() {
        let mut heap = heap();
        let id = heap.alloc_raw(HeapData::Object(Obj::default())).unwrap();
        let weak = heap.weak_ref(id);
        assert_eq!(heap.weak_get(weak), Some(id));
        heap.free_slot(id);
        assert_eq!(heap.weak_get(weak), None, "finalization must invalidate weak refs");
        let reused = heap.alloc_raw(HeapData::Object(Obj::default())).unwrap();
        assert_eq!(reused, id, "slot should be reused from the free list");
        assert_eq!(heap.weak_get(weak), None, "reuse must not resurrect old weak refs");
    }

    #[test]
    fn interned_string_entry_removed_on_free() {
        let mut heap = heap();
        let id = heap.alloc_raw(HeapData::Str(RtStr::new("shared"))).unwrap();
        heap.interner.insert("shared", id);
        assert_eq!(heap.interner.lookup("shared"), Some(id));
        heap.free_slot(id);
        assert_eq!(heap.interner.lookup("shared"), None);
    }

    #[test]
    fn chunk_pool_round_trips_capacity() {
        let mut pool = ChunkPool::default();
        let chunk = pool.take(100);
        assert!(chunk.capacity() >= 100);
        assert_eq!(pool.misses, 1);
        pool.put(chunk);
        let again = pool.take(100);
        assert_eq!(pool.hits, 1);
        assert!(again.is_empty(), "recycled chunks come back cleared");
    }

    #[test]
    fn hash_obj_insert_find_remove() {
        let mut h = HashObj::default();
        let eq = |a: Value, b: Value| a.same(b);
        assert!(h.insert(7, Value::Int(1), Value::Int(10), eq).is_none());
        let old = h.insert(7, Value::Int(1), Value::Int(20), eq).unwrap();
        assert!(old.same(Value::Int(10)));
        assert_eq!(h.len(), 1);
        let found = h.find(7, Value::Int(1), eq).unwrap();
        assert!(h.entry_value(found).same(Value::Int(20)));
        let (k, v) = h.remove(7, Value::Int(1), eq).unwrap();
        assert!(k.same(Value::Int(1)) && v.same(Value::Int(20)));
        assert_eq!(h.len(), 0);
    }

    #[test]
    fn stats_counts_by_type() {
        let mut heap = heap();
        heap.alloc_raw(HeapData::Str(RtStr::new("a1"))).unwrap();
        heap.alloc_raw(HeapData::Str(RtStr::new("b2"))).unwrap();
        heap.alloc_raw(HeapData::Array(Array::default())).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.live_values, 3);
        assert_eq!(stats.values_by_type.get("string"), Some(&2));
        assert_eq!(stats.values_by_type.get("array"), Some(&1));
    }
}
