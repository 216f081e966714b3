//! Builtin shared strings and the dynamic string-interning table.
//!
//! Two layers exist. [`StaticStr`] covers the immortal builtins: the empty
//! string, the 128 length-1 ASCII strings, and the well-known property names
//! the engine stashes at startup (`"prototype"`, `"this"`, `"argv"`, ...).
//! These are shared, not refcounted, and not owned by any scope.
//!
//! The [`Interner`] deduplicates dynamically created string contents to a
//! single heap value. Lookup does not imply a reference: the caller must `ref`
//! an interned hit exactly as if the string were freshly allocated. The entry
//! is removed when the backing heap value is finalized.

use std::sync::LazyLock;

use ahash::AHashMap;
use strum::{EnumString, FromRepr, IntoStaticStr};

use crate::heap::HeapId;

/// Longest string content the interner will deduplicate. Longer strings are
/// allocated directly; deduplicating large bodies costs more than it saves.
pub(crate) const INTERN_MAX_LEN: usize = 64;

/// Static single-character strings for all 128 ASCII bytes.
///
/// Built once on first access; the 128 one-byte leaks are intentional and
/// bounded, and buy `'static` lifetimes for every builtin char string.
static ASCII_STRS: LazyLock<[&'static str; 128]> = LazyLock::new(|| {
    std::array::from_fn(|i| {
        let s = char::from(u8::try_from(i).expect("index below 128")).to_string();
        &*Box::leak(s.into_boxed_str())
    })
});

/// Well-known names known at compile time.
///
/// These are the keys the engine stashes for `this`/`argv`/prototype plumbing
/// plus the operator-overload method names consulted by the stack machine.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumString, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub(crate) enum KnownStr {
    #[strum(serialize = "")]
    Empty,
    Prototype,
    This,
    Argv,
    Script,
    Line,
    Column,
    Stacktrace,
    Message,
    Code,
    Name,
    Value,
    #[strum(serialize = "__new")]
    CtorNew,
    #[strum(serialize = "__typename")]
    TypeName,
    #[strum(serialize = "operator+")]
    OpAdd,
    #[strum(serialize = "operator-")]
    OpSub,
    #[strum(serialize = "operator*")]
    OpMul,
    #[strum(serialize = "operator/")]
    OpDiv,
    #[strum(serialize = "operator%")]
    OpMod,
    #[strum(serialize = "operator==")]
    OpCmpEq,
    #[strum(serialize = "operator!=")]
    OpCmpNeq,
    #[strum(serialize = "operator<")]
    OpCmpLt,
    #[strum(serialize = "operator<=")]
    OpCmpLe,
    #[strum(serialize = "operator>")]
    OpCmpGt,
    #[strum(serialize = "operator>=")]
    OpCmpGe,
    #[strum(serialize = "operator=~")]
    OpContains,
    #[strum(serialize = "enumEntryCount")]
    EnumEntryCount,
}

impl KnownStr {
    /// The string content of this name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// A builtin, immortal string: the empty string, one ASCII character, or a
/// well-known name. Lifetime operations on these are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum StaticStr {
    /// One ASCII byte (`b < 128`).
    Char(u8),
    /// A compile-time well-known name, including the empty string.
    Known(KnownStr),
}

impl StaticStr {
    /// Returns the builtin for the given content, if there is one.
    #[must_use]
    pub fn for_content(s: &str) -> Option<Self> {
        match s.len() {
            0 => Some(Self::Known(KnownStr::Empty)),
            1 if s.as_bytes()[0] < 128 => Some(Self::Char(s.as_bytes()[0])),
            _ => s.parse::<KnownStr>().ok().map(Self::Known),
        }
    }

    /// The string content.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Char(b) => ASCII_STRS[b as usize],
            Self::Known(k) => k.as_str(),
        }
    }
}

/// Content-keyed table of interned heap strings.
///
/// Keys own a copy of the content; values are arena slots. The heap removes
/// the entry in its string finalizer, so a hit here is always live.
#[derive(Debug, Default)]
pub(crate) struct Interner {
    table: AHashMap<Box<str>, HeapId>,
    /// When false, `lookup` always misses and `insert` is a no-op.
    enabled: bool,
}

impl Interner {
    pub fn new(enabled: bool) -> Self {
        Self {
            table: AHashMap::new(),
            enabled,
        }
    }

    /// Whether the given content is eligible for interning at all.
    pub fn wants(&self, s: &str) -> bool {
        self.enabled && s.len() <= INTERN_MAX_LEN
    }

    pub fn lookup(&self, s: &str) -> Option<HeapId> {
        if !self.enabled {
            return None;
        }
        self.table.get(s).copied()
    }

    pub fn insert(&mut self, s: &str, id: HeapId) {
        if self.wants(s) {
            self.table.insert(Box::from(s), id);
        }
    }

    /// Called from the string finalizer on last unref.
    pub fn remove(&mut self, s: &str) {
        self.table.remove(s);
    }

    /// Number of dynamically interned strings (excludes builtins).
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_for_empty_and_ascii() {
        assert_eq!(StaticStr::for_content("").unwrap().as_str(), "");
        assert_eq!(StaticStr::for_content("a").unwrap().as_str(), "a");
        assert_eq!(StaticStr::for_content("\n").unwrap().as_str(), "\n");
        assert!(StaticStr::for_content("ab").is_none(), "two-byte content is not builtin");
        assert!(StaticStr::for_content("é").is_none(), "non-ASCII single char is not builtin");
    }

    #[test]
    fn well_known_names_resolve() {
        assert_eq!(StaticStr::for_content("prototype").unwrap().as_str(), "prototype");
        assert_eq!(StaticStr::for_content("__new").unwrap().as_str(), "__new");
        assert_eq!(StaticStr::for_content("operator+").unwrap().as_str(), "operator+");
        assert!(StaticStr::for_content("not-a-known-name").is_none());
    }

    #[test]
    fn interner_respects_enable_flag() {
        let mut off = Interner::new(false);
        off.insert("abc", HeapId::from_index(1));
        assert_eq!(off.lookup("abc"), None);

        let mut on = Interner::new(true);
        on.insert("abc", HeapId::from_index(1));
        assert_eq!(on.lookup("abc"), Some(HeapId::from_index(1)));
        on.remove("abc");
        assert_eq!(on.lookup("abc"), None);
    }

    #[test]
    fn interner_skips_oversized_content() {
        let mut interner = Interner::new(true);
        let big = "x".repeat(INTERN_MAX_LEN + 1);
        interner.insert(&big, HeapId::from_index(2));
        assert_eq!(interner.lookup(&big), None, "oversized strings must not be interned");
    }
}
