//! Function payloads: script functions, core prototype methods, and
//! embedder-registered natives.
//!
//! A script function keeps its source text alive through an `Rc` so that a
//! `proc` defined inside an `eval`'d string stays callable after the original
//! tokenizer is gone. Parameter defaults are stored as byte ranges into that
//! source and re-evaluated at each call. `using` captures are resolved at
//! definition time and declared as locals in the call scope; symbol lookup is
//! otherwise dynamic against the call-time scope chain.

use std::rc::Rc;

use crate::{
    error::Exception,
    heap::{ContainerMeta, Heap},
    object::Object,
    resource::ResourceTracker,
    value::Value,
};

/// A script's name and full source text, shared by every function defined in it.
#[derive(Debug)]
pub(crate) struct ScriptSrc {
    pub name: Rc<str>,
    pub text: Rc<str>,
}

/// One declared parameter: its name value and the byte range of its default
/// expression, when present.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Param {
    pub name: Value,
    pub default: Option<(usize, usize)>,
}

/// A `proc` value's callable state.
#[derive(Debug)]
pub(crate) struct ScriptFunc {
    pub src: Rc<ScriptSrc>,
    /// The function's name as a string value, or `Undef` for anonymous procs.
    pub name: Value,
    pub params: Vec<Param>,
    /// Inner byte range of the body brace group.
    pub body: (usize, usize),
    /// `using (...)` captures: (name, value) pairs, both referenced.
    pub using: Vec<(Value, Value)>,
}

/// The closed set of native methods installed on the core prototypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoreFn {
    // Base object prototype (inherited by every property-capable container).
    ValToString,
    ValTypeName,
    // Array
    ArrayLength,
    ArrayPush,
    ArrayPop,
    ArrayJoin,
    ArrayIndexOf,
    ArraySlice,
    ArrayReverse,
    // String
    StrLength,
    StrByteLength,
    StrIsAscii,
    StrCharAt,
    StrIndexOf,
    StrConcat,
    StrToUpper,
    StrToLower,
    StrSplit,
    StrSubstr,
    StrTrim,
    // Object
    ObjSet,
    ObjGet,
    ObjUnset,
    ObjHasOwn,
    ObjPropertyKeys,
    ObjWithThis,
    // Hash
    HashInsert,
    HashSearch,
    HashRemove,
    HashSize,
    HashEntryKeys,
    HashHasEntry,
    // Buffer
    BufLength,
    BufCapacity,
    BufAppend,
    BufToString,
    BufReset,
    // Function
    FuncApply,
    FuncCall,
    FuncSource,
    // Exception
    ExcCodeString,
    // Tuple
    TupleLength,
    TupleJoin,
    // Unique
    UniqueValue,
    // Free functions installed as scope variables.
    Print,
}

impl CoreFn {
    /// The script-visible method name.
    pub fn name(self) -> &'static str {
        match self {
            Self::ValToString => "toString",
            Self::ValTypeName => "typeName",
            Self::ArrayLength | Self::StrLength | Self::BufLength | Self::TupleLength => "length",
            Self::ArrayPush => "push",
            Self::ArrayPop => "pop",
            Self::ArrayJoin | Self::TupleJoin => "join",
            Self::ArrayIndexOf | Self::StrIndexOf => "indexOf",
            Self::ArraySlice => "slice",
            Self::ArrayReverse => "reverse",
            Self::StrByteLength => "byteLength",
            Self::StrIsAscii => "isAscii",
            Self::StrCharAt => "charAt",
            Self::StrConcat => "concat",
            Self::StrToUpper => "toUpper",
            Self::StrToLower => "toLower",
            Self::StrSplit => "split",
            Self::StrSubstr => "substr",
            Self::StrTrim => "trim",
            Self::ObjSet => "set",
            Self::ObjGet => "get",
            Self::ObjUnset => "unset",
            Self::ObjHasOwn => "hasOwnProperty",
            Self::ObjPropertyKeys => "propertyKeys",
            Self::ObjWithThis => "withThis",
            Self::HashInsert => "insert",
            Self::HashSearch => "search",
            Self::HashRemove => "remove",
            Self::HashSize => "size",
            Self::HashEntryKeys => "entryKeys",
            Self::HashHasEntry => "containsEntry",
            Self::BufCapacity => "capacity",
            Self::BufAppend => "append",
            Self::BufToString => "toString",
            Self::BufReset => "reset",
            Self::FuncApply => "apply",
            Self::FuncCall => "call",
            Self::FuncSource => "sourceCode",
            Self::ExcCodeString => "codeString",
            Self::UniqueValue => "value",
            Self::Print => "print",
        }
    }
}

/// Arguments handed to an embedder-registered native function.
#[derive(Debug, Clone)]
pub struct NativeCall {
    /// The bound `this`, already exported.
    pub this: Object,
    /// Positional arguments, already exported.
    pub args: Vec<Object>,
}

/// An embedder-registered native: receives exported arguments, returns an
/// exported result or a raised exception.
pub type NativeHook = Rc<dyn Fn(&NativeCall) -> Result<Object, Exception>>;

pub(crate) struct NativeRegistration {
    pub name: String,
    pub hook: NativeHook,
}

impl std::fmt::Debug for NativeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegistration").field("name", &self.name).finish()
    }
}

/// How a function value is implemented.
#[derive(Debug)]
pub(crate) enum FuncKind {
    Script(ScriptFunc),
    Core(CoreFn),
    /// Index into the engine's native registration table.
    Native(u32),
}

/// Heap payload for function values.
#[derive(Debug)]
pub(crate) struct FuncData {
    pub kind: FuncKind,
    pub meta: ContainerMeta,
}

impl FuncData {
    pub fn core(f: CoreFn) -> Self {
        Self {
            kind: FuncKind::Core(f),
            meta: ContainerMeta::default(),
        }
    }

    /// The function's display name, when one is known.
    pub fn name_str<'h>(&self, heap: &'h Heap<impl ResourceTracker>) -> Option<&'h str> {
        match &self.kind {
            FuncKind::Script(s) => s.name.as_str(heap),
            FuncKind::Core(c) => Some(c.name()),
            FuncKind::Native(_) => None,
        }
    }

    pub fn collect_children(&self, out: &mut Vec<Value>) {
        if let FuncKind::Script(s) = &self.kind {
            out.push(s.name);
            for p in &s.params {
                out.push(p.name);
            }
            for (k, v) in &s.using {
                out.push(*k);
                out.push(*v);
            }
        }
        self.meta.collect_children(out);
    }
}
