//! The value handle type and its comparison, coercion, and display semantics.
//!
//! `Value` is a small `Copy` handle. Builtin values (undef, null, bools, ints,
//! doubles, and the shared static strings) are stored inline and are immortal:
//! every lifetime operation on them is a no-op. Everything else lives in the
//! arena and is referenced by `Ref(HeapId)`.
//!
//! Because handles are `Copy`, reference counting is explicit: a caller that
//! stores a handle beyond the current expression must `ref` it (or insert it
//! into a container, which refs on its behalf). The eval holder does this for
//! every value on the evaluation stack.

use std::cmp::Ordering;

use crate::{
    heap::{Heap, HeapData, HeapId},
    intern::StaticStr,
    resource::ResourceTracker,
};

/// Script-visible type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum TypeTag {
    Undefined,
    Null,
    Bool,
    Integer,
    Double,
    String,
    Array,
    Object,
    Hash,
    Buffer,
    Function,
    Exception,
    Native,
    Unique,
    Tuple,
}

/// A value handle: either an inline builtin or an arena reference.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) enum Value {
    #[default]
    Undef,
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    /// A builtin shared string (empty, length-1 ASCII, or well-known name).
    Static(StaticStr),
    /// A heap-allocated value.
    Ref(HeapId),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl Value {
    /// True for values not subject to refcounting or scope ownership.
    #[inline]
    pub fn is_builtin(self) -> bool {
        !matches!(self, Self::Ref(_))
    }

    /// The arena slot, for heap values.
    #[inline]
    pub fn ref_id(self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(id),
            _ => None,
        }
    }

    /// Identity: same builtin or same arena slot. This is `===` for
    /// containers and the `is`-style check used by internal bookkeeping.
    pub fn same(self, other: Self) -> bool {
        match (self, other) {
            (Self::Undef, Self::Undef) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::Static(a), Self::Static(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    pub fn type_tag(self, heap: &Heap<impl ResourceTracker>) -> TypeTag {
        match self {
            Self::Undef => TypeTag::Undefined,
            Self::Null => TypeTag::Null,
            Self::Bool(_) => TypeTag::Bool,
            Self::Int(_) => TypeTag::Integer,
            Self::Double(_) => TypeTag::Double,
            Self::Static(_) => TypeTag::String,
            Self::Ref(id) => heap.get(id).type_tag(),
        }
    }

    /// True for the container kinds (anything that may hold value references).
    pub fn is_container(self, heap: &Heap<impl ResourceTracker>) -> bool {
        match self {
            Self::Ref(id) => heap.get(id).is_container(),
            _ => false,
        }
    }

    /// Boolean interpretation: undef/null are false, numbers are false at
    /// zero, strings are false when empty, containers are always true.
    pub fn truthy(self, heap: &Heap<impl ResourceTracker>) -> bool {
        match self {
            Self::Undef | Self::Null => false,
            Self::Bool(b) => b,
            Self::Int(i) => i != 0,
            Self::Double(d) => d != 0.0,
            Self::Static(s) => !s.as_str().is_empty(),
            Self::Ref(id) => match heap.get(id) {
                HeapData::Str(s) => !s.as_str().is_empty(),
                _ => true,
            },
        }
    }

    /// String content, for string-typed values. Tolerates slots whose data is
    /// temporarily borrowed (take/restore) by answering `None` for them.
    pub fn as_str(self, heap: &Heap<impl ResourceTracker>) -> Option<&str> {
        match self {
            Self::Static(s) => Some(s.as_str()),
            Self::Ref(id) => heap.str_if_live(id),
            _ => None,
        }
    }

    /// Exact integer content (no coercion).
    pub fn as_int(self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i),
            _ => None,
        }
    }

    /// True for int- and double-typed values.
    pub fn is_number(self) -> bool {
        matches!(self, Self::Int(_) | Self::Double(_))
    }

    /// Numeric interpretation used by arithmetic: ints and doubles pass
    /// through, bools become 0/1, numeric-looking strings parse, everything
    /// else is `None`.
    pub fn coerce_double(self, heap: &Heap<impl ResourceTracker>) -> Option<f64> {
        match self {
            Self::Int(i) => Some(i as f64),
            Self::Double(d) => Some(d),
            Self::Bool(b) => Some(f64::from(b)),
            _ => self.as_str(heap).and_then(|s| s.trim().parse::<f64>().ok()),
        }
    }

    /// Integer interpretation used by shift/bitwise and index contexts.
    pub fn coerce_int(self, heap: &Heap<impl ResourceTracker>) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i),
            Self::Double(d) => Some(d as i64),
            Self::Bool(b) => Some(i64::from(b)),
            _ => {
                let s = self.as_str(heap)?;
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|d| d as i64))
            }
        }
    }

    /// Usable as a property key: everything except buffers and tuples, whose
    /// equivalence compares mutable content.
    pub fn key_usable(self, heap: &Heap<impl ResourceTracker>) -> bool {
        match self {
            Self::Ref(id) => !matches!(heap.get(id), HeapData::Buffer(_) | HeapData::Tuple(_)),
            _ => true,
        }
    }
}

/// Type-loose equality (`==`): numbers compare numerically across int/double/
/// bool, a number and a string compare by parsing the string, null and undef
/// are mutually equal, strings compare by content, containers by identity.
pub(crate) fn loose_eq(a: Value, b: Value, heap: &Heap<impl ResourceTracker>) -> bool {
    if a.same(b) {
        return true;
    }
    match (a, b) {
        (Value::Undef | Value::Null, Value::Undef | Value::Null) => true,
        _ => {
            if let (Some(x), Some(y)) = (string_content(a, heap), string_content(b, heap)) {
                return x == y;
            }
            if a.is_number() || b.is_number() || matches!(a, Value::Bool(_)) || matches!(b, Value::Bool(_)) {
                if let (Some(x), Some(y)) = (a.coerce_double(heap), b.coerce_double(heap)) {
                    return x == y;
                }
            }
            false
        }
    }
}

/// Strict equality (`===`): same type, and content equality for strings and
/// numbers, identity for containers.
pub(crate) fn strict_eq(a: Value, b: Value, heap: &Heap<impl ResourceTracker>) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Double(x), Value::Double(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Undef, Value::Undef) | (Value::Null, Value::Null) => true,
        _ => match (string_content(a, heap), string_content(b, heap)) {
            (Some(x), Some(y)) => x == y,
            (None, None) => a.same(b),
            _ => false,
        },
    }
}

/// Property-key equivalence: type-loose, except boolean keys which are strict.
pub(crate) fn key_eq(a: Value, b: Value, heap: &Heap<impl ResourceTracker>) -> bool {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Bool(_), _) | (_, Value::Bool(_)) => false,
        _ => loose_eq(a, b, heap),
    }
}

/// Hash of a property key, consistent with [`key_eq`]: values that compare
/// key-equal hash identically (int `1` and string `"1"` share a bucket).
pub(crate) fn key_hash(v: Value, heap: &Heap<impl ResourceTracker>) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = ahash::AHasher::default();
    match v {
        Value::Undef => 0u8.hash(&mut hasher),
        Value::Null => 1u8.hash(&mut hasher),
        Value::Bool(b) => (2u8, b).hash(&mut hasher),
        Value::Int(i) => (3u8, i).hash(&mut hasher),
        Value::Double(d) => {
            // Integral doubles must collide with the equal int.
            if d.fract() == 0.0 && d >= i64::MIN as f64 && d <= i64::MAX as f64 {
                (3u8, d as i64).hash(&mut hasher);
            } else {
                (4u8, d.to_bits()).hash(&mut hasher);
            }
        }
        _ => {
            if let Some(s) = string_content(v, heap) {
                // Numeric-looking strings must collide with the equal number.
                if let Ok(i) = s.trim().parse::<i64>() {
                    (3u8, i).hash(&mut hasher);
                } else if let Ok(d) = s.trim().parse::<f64>() {
                    if d.fract() == 0.0 && d >= i64::MIN as f64 && d <= i64::MAX as f64 {
                        (3u8, d as i64).hash(&mut hasher);
                    } else {
                        (4u8, d.to_bits()).hash(&mut hasher);
                    }
                } else {
                    (5u8, s.as_bytes()).hash(&mut hasher);
                }
            } else if let Value::Ref(id) = v {
                (6u8, id.index()).hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}

/// Relational comparison for `<`, `<=`, `>`, `>=`: numbers numerically,
/// strings bytewise, a number and a string by numeric coercion.
pub(crate) fn compare(a: Value, b: Value, heap: &Heap<impl ResourceTracker>) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (string_content(a, heap), string_content(b, heap)) {
        return Some(x.as_bytes().cmp(y.as_bytes()));
    }
    let x = a.coerce_double(heap)?;
    let y = b.coerce_double(heap)?;
    x.partial_cmp(&y)
}

fn string_content(v: Value, heap: &Heap<impl ResourceTracker>) -> Option<&str> {
    v.as_str(heap)
}

/// Depth cap for container display; deeper structures render as `...`.
const DISPLAY_DEPTH_MAX: u16 = 24;

/// Appends the display form of `v` to `out`. Top-level strings render raw;
/// nested values render in repr form.
pub(crate) fn to_display(v: Value, heap: &Heap<impl ResourceTracker>, out: &mut String) {
    if let Some(s) = v.as_str(heap) {
        out.push_str(s);
    } else {
        to_repr(v, heap, out, DISPLAY_DEPTH_MAX);
    }
}

/// Appends the repr form of `v` (strings quoted, containers bracketed).
pub(crate) fn to_repr(v: Value, heap: &Heap<impl ResourceTracker>, out: &mut String, depth: u16) {
    if depth == 0 {
        out.push_str("...");
        return;
    }
    match v {
        Value::Undef => out.push_str("undefined"),
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(i) => {
            use std::fmt::Write;
            let _ = write!(out, "{i}");
        }
        Value::Double(d) => format_double(d, out),
        Value::Static(s) => quote_str(s.as_str(), out),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => quote_str(s.as_str(), out),
            HeapData::Array(arr) => {
                out.push('[');
                for (i, item) in arr.list.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    to_repr(*item, heap, out, depth - 1);
                }
                out.push(']');
            }
            HeapData::Tuple(t) => {
                out.push_str("[#");
                for (i, item) in t.slots.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    to_repr(*item, heap, out, depth - 1);
                }
                out.push(']');
            }
            HeapData::Object(o) => repr_props(o.meta.props.iter().map(|(k, s)| (*k, s.value, s.flags)), heap, out, depth),
            HeapData::Hash(h) => {
                out.push_str("hash");
                repr_props(h.iter_entries().map(|(k, s)| (k, s.value, s.flags)), heap, out, depth);
            }
            HeapData::Buffer(b) => {
                use std::fmt::Write;
                let _ = write!(out, "buffer({} bytes)", b.bytes.len());
            }
            HeapData::Function(f) => {
                use std::fmt::Write;
                match f.name_str(heap) {
                    Some(name) => {
                        let _ = write!(out, "function {name}()");
                    }
                    None => out.push_str("function()"),
                }
            }
            HeapData::Exception(e) => {
                use std::fmt::Write;
                let _ = write!(out, "exception({})", e.code);
            }
            HeapData::Native(n) => {
                use std::fmt::Write;
                let _ = write!(out, "native<{}>", n.type_name);
            }
            HeapData::Unique(u) => {
                out.push_str("unique(");
                to_repr(u.wrapped, heap, out, depth - 1);
                out.push(')');
            }
        },
    }
}

fn repr_props<'a>(
    entries: impl Iterator<Item = (Value, Value, u16)>,
    heap: &'a Heap<impl ResourceTracker>,
    out: &mut String,
    depth: u16,
) {
    out.push('{');
    let mut first = true;
    for (k, v, flags) in entries {
        if flags & crate::props::PROP_HIDDEN != 0 {
            continue;
        }
        if !first {
            out.push_str(", ");
        }
        first = false;
        to_repr(k, heap, out, depth - 1);
        out.push_str(": ");
        to_repr(v, heap, out, depth - 1);
    }
    out.push('}');
}

/// Shortest round-tripping text for a double. Infinities and NaN use the
/// script-level identifier forms.
pub(crate) fn format_double(d: f64, out: &mut String) {
    if d.is_nan() {
        out.push_str("NaN");
    } else if d.is_infinite() {
        out.push_str(if d > 0.0 { "Infinity" } else { "-Infinity" });
    } else {
        let mut buf = ryu::Buffer::new();
        out.push_str(buf.format(d));
    }
}

fn quote_str(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{heap::RtStr, resource::NoLimitTracker};

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(8, NoLimitTracker, true)
    }

    #[test]
    fn loose_eq_crosses_types() {
        let heap = heap();
        assert!(loose_eq(Value::Int(1), Value::Double(1.0), &heap));
        assert!(loose_eq(Value::Null, Value::Undef, &heap));
        assert!(loose_eq(Value::Bool(true), Value::Int(1), &heap));
        assert!(!loose_eq(Value::Int(1), Value::Int(2), &heap));
    }

    #[test]
    fn loose_eq_number_vs_string() {
        let mut heap = heap();
        let s = heap.alloc_raw(HeapData::Str(RtStr::new("1"))).unwrap();
        assert!(loose_eq(Value::Int(1), Value::Ref(s), &heap));
        assert!(!strict_eq(Value::Int(1), Value::Ref(s), &heap), "=== must not coerce");
    }

    #[test]
    fn bool_keys_are_strict() {
        let heap = heap();
        assert!(!key_eq(Value::Bool(true), Value::Int(1), &heap));
        assert!(key_eq(Value::Int(1), Value::Double(1.0), &heap));
    }

    #[test]
    fn key_hash_consistent_with_key_eq() {
        let mut heap = heap();
        let s = heap.alloc_raw(HeapData::Str(RtStr::new("42"))).unwrap();
        assert_eq!(
            key_hash(Value::Int(42), &heap),
            key_hash(Value::Ref(s), &heap),
            "int 42 and string \"42\" must share a hash bucket"
        );
    }

    #[test]
    fn double_round_trip_format() {
        let mut out = String::new();
        format_double(0.1, &mut out);
        assert_eq!(out.parse::<f64>().unwrap(), 0.1);
    }

    #[test]
    fn string_compare_is_bytewise() {
        let heap = heap();
        use crate::intern::StaticStr;
        let a = Value::Static(StaticStr::for_content("a").unwrap());
        let b = Value::Static(StaticStr::for_content("b").unwrap());
        assert_eq!(compare(a, b, &heap), Some(Ordering::Less));
    }
}
