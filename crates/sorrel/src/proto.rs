//! The core per-type prototypes and their native methods.
//!
//! These are the methods the object model itself depends on (property
//! manipulation, container sizing, `apply`/`call`, exception inspection),
//! installed at engine construction as vacuum-proof root-scope values.
//! Convenience stdlib bindings beyond this set live with the host.

use crate::{
    engine::Engine,
    error::{EvalError, EvalResult},
    func::{CoreFn, FuncData},
    heap::{HeapData, HeapId},
    rc::ResultCode,
    resource::ResourceTracker,
    value::{TypeTag, Value, loose_eq},
};

/// Builds every core prototype and the global `print` binding.
///
/// Called once from engine construction; a resource tracker too strict to
/// allow the bootstrap allocations makes the engine unusable, so failures
/// here are surfaced as a panic with a clear message.
pub(crate) fn install_core_prototypes<T: ResourceTracker>(engine: &mut Engine<T>) {
    install(engine).expect("engine bootstrap: prototype allocation failed (resource limits too strict)");
}

fn install<T: ResourceTracker>(engine: &mut Engine<T>) -> EvalResult<()> {
    // The base object prototype, shared (directly or via chains) by all
    // property-capable values and the boxed primitives.
    let base = bare_object(engine)?;
    add_methods(
        engine,
        base,
        &[
            CoreFn::ValToString,
            CoreFn::ValTypeName,
            CoreFn::ObjSet,
            CoreFn::ObjGet,
            CoreFn::ObjUnset,
            CoreFn::ObjHasOwn,
            CoreFn::ObjPropertyKeys,
            CoreFn::ObjWithThis,
        ],
    )?;
    engine.protos.set(TypeTag::Object, base);
    engine.protos.set(TypeTag::Integer, base);
    engine.protos.set(TypeTag::Double, base);
    engine.protos.set(TypeTag::Bool, base);
    engine.protos.set(TypeTag::Native, base);

    let array = derived_object(engine, base)?;
    add_methods(
        engine,
        array,
        &[
            CoreFn::ArrayLength,
            CoreFn::ArrayPush,
            CoreFn::ArrayPop,
            CoreFn::ArrayJoin,
            CoreFn::ArrayIndexOf,
            CoreFn::ArraySlice,
            CoreFn::ArrayReverse,
        ],
    )?;
    engine.protos.set(TypeTag::Array, array);

    let string = derived_object(engine, base)?;
    add_methods(
        engine,
        string,
        &[
            CoreFn::StrLength,
            CoreFn::StrByteLength,
            CoreFn::StrIsAscii,
            CoreFn::StrCharAt,
            CoreFn::StrIndexOf,
            CoreFn::StrConcat,
            CoreFn::StrToUpper,
            CoreFn::StrToLower,
            CoreFn::StrSplit,
            CoreFn::StrSubstr,
            CoreFn::StrTrim,
        ],
    )?;
    engine.protos.set(TypeTag::String, string);

    let hash = derived_object(engine, base)?;
    add_methods(
        engine,
        hash,
        &[
            CoreFn::HashInsert,
            CoreFn::HashSearch,
            CoreFn::HashRemove,
            CoreFn::HashSize,
            CoreFn::HashEntryKeys,
            CoreFn::HashHasEntry,
        ],
    )?;
    engine.protos.set(TypeTag::Hash, hash);

    let buffer = derived_object(engine, base)?;
    add_methods(
        engine,
        buffer,
        &[
            CoreFn::BufLength,
            CoreFn::BufCapacity,
            CoreFn::BufAppend,
            CoreFn::BufToString,
            CoreFn::BufReset,
        ],
    )?;
    engine.protos.set(TypeTag::Buffer, buffer);

    let function = derived_object(engine, base)?;
    add_methods(engine, function, &[CoreFn::FuncApply, CoreFn::FuncCall, CoreFn::FuncSource])?;
    engine.protos.set(TypeTag::Function, function);

    let exception = derived_object(engine, base)?;
    add_methods(engine, exception, &[CoreFn::ExcCodeString])?;
    engine.protos.set(TypeTag::Exception, exception);

    let tuple = derived_object(engine, base)?;
    add_methods(engine, tuple, &[CoreFn::TupleLength, CoreFn::TupleJoin])?;
    engine.protos.set(TypeTag::Tuple, tuple);

    let unique = derived_object(engine, base)?;
    add_methods(engine, unique, &[CoreFn::UniqueValue])?;
    engine.protos.set(TypeTag::Unique, unique);

    // The global `print`.
    let print = engine.new_func(FuncData::core(CoreFn::Print))?;
    let print_name = engine.new_string("print")?;
    engine
        .scopes
        .declare(&mut engine.heap, 1, print_name, print, true)
        .map_err(EvalError::Fatal)?;
    Ok(())
}

/// A prototype object with no prototype of its own, pinned as an
/// engine-owned root.
fn bare_object<T: ResourceTracker>(engine: &mut Engine<T>) -> EvalResult<Value> {
    let v = engine.alloc(HeapData::Object(crate::heap::Obj::default()))?;
    engine.scopes.vref(&mut engine.heap, v).map_err(EvalError::Fatal)?;
    engine.scopes.make_vacuum_proof(&mut engine.heap, v, true);
    Ok(v)
}

fn derived_object<T: ResourceTracker>(engine: &mut Engine<T>, base: Value) -> EvalResult<Value> {
    let v = bare_object(engine)?;
    engine.set_proto(v, base)?;
    Ok(v)
}

fn add_methods<T: ResourceTracker>(engine: &mut Engine<T>, proto: Value, fns: &[CoreFn]) -> EvalResult<()> {
    for f in fns {
        let fval = engine.new_func(FuncData::core(*f))?;
        let name = engine.new_string(f.name())?;
        engine.prop_set(proto, name, fval, 0)?;
    }
    Ok(())
}

// --- Dispatch ---

/// Invokes one core method. `this` is the bound receiver, `args` the
/// positional arguments (already referenced by the caller).
pub(crate) fn call_core<T: ResourceTracker>(
    engine: &mut Engine<T>,
    f: CoreFn,
    this: Value,
    args: &[Value],
) -> EvalResult<Value> {
    match f {
        CoreFn::Print => {
            let mut out = String::new();
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                crate::value::to_display(*arg, &engine.heap, &mut out);
            }
            out.push('\n');
            if let Err(exc) = engine.outputer.output(&out) {
                let msg = exc.message.clone();
                return Err(engine.throw(ResultCode::Io, &msg));
            }
            Ok(Value::Undef)
        }
        CoreFn::ValToString => {
            let s = engine.display_string(this);
            engine.new_string(&s)
        }
        CoreFn::ValTypeName => {
            let name: &'static str = this.type_tag(&engine.heap).into();
            engine.new_string(name)
        }

        // --- Array ---
        CoreFn::ArrayLength => {
            let id = want_array(engine, this)?;
            let len = match engine.heap.get(id) {
                HeapData::Array(a) => a.list.len(),
                _ => 0,
            };
            Ok(Value::Int(len as i64))
        }
        CoreFn::ArrayPush => {
            for arg in args {
                engine.array_push(this, *arg)?;
            }
            Ok(args.last().copied().unwrap_or(Value::Undef))
        }
        CoreFn::ArrayPop => {
            let id = want_array(engine, this)?;
            let popped = match engine.heap.get_mut(id) {
                HeapData::Array(a) => {
                    if a.meta.flags & crate::props::CONT_VISITING != 0 {
                        None
                    } else {
                        Some(a.list.pop())
                    }
                }
                _ => Some(None),
            };
            match popped {
                None => Err(engine.throw(ResultCode::IsVisitingList, "array is being iterated")),
                Some(None) => Ok(Value::Undef),
                Some(Some(v)) => {
                    // The array's reference transfers to the caller via unhand.
                    engine.scopes.vunhand(&mut engine.heap, v);
                    Ok(v)
                }
            }
        }
        CoreFn::ArrayJoin => {
            let id = want_array(engine, this)?;
            let sep = args.first().map_or_else(String::new, |s| engine.display_string(*s));
            let len = match engine.heap.get(id) {
                HeapData::Array(a) => a.list.len(),
                _ => 0,
            };
            let mut out = String::new();
            for i in 0..len {
                if i > 0 {
                    out.push_str(&sep);
                }
                let element = match engine.heap.get(id) {
                    HeapData::Array(a) => a.list[i],
                    _ => Value::Undef,
                };
                crate::value::to_display(element, &engine.heap, &mut out);
            }
            engine.new_string(&out)
        }
        CoreFn::ArrayIndexOf => {
            let id = want_array(engine, this)?;
            let needle = args.first().copied().unwrap_or(Value::Undef);
            let found = match engine.heap.get(id) {
                HeapData::Array(a) => a.list.iter().position(|v| loose_eq(*v, needle, &engine.heap)),
                _ => None,
            };
            Ok(Value::Int(found.map_or(-1, |i| i as i64)))
        }
        CoreFn::ArraySlice => {
            let id = want_array(engine, this)?;
            let begin = int_arg(engine, args, 0).unwrap_or(0).max(0) as usize;
            let count = int_arg(engine, args, 1);
            let items: Vec<Value> = match engine.heap.get(id) {
                HeapData::Array(a) => {
                    let end = count.map_or(a.list.len(), |c| (begin + c.max(0) as usize).min(a.list.len()));
                    a.list.get(begin..end.max(begin)).unwrap_or(&[]).to_vec()
                }
                _ => Vec::new(),
            };
            engine.new_array(items)
        }
        CoreFn::ArrayReverse => {
            let id = want_array(engine, this)?;
            let ok = match engine.heap.get_mut(id) {
                HeapData::Array(a) => {
                    if a.meta.flags & crate::props::CONT_VISITING != 0 {
                        false
                    } else {
                        a.list.reverse();
                        true
                    }
                }
                _ => true,
            };
            if ok {
                Ok(this)
            } else {
                Err(engine.throw(ResultCode::IsVisitingList, "array is being iterated"))
            }
        }

        // --- String ---
        CoreFn::StrLength
        | CoreFn::StrByteLength
        | CoreFn::StrIsAscii
        | CoreFn::StrCharAt
        | CoreFn::StrIndexOf
        | CoreFn::StrConcat
        | CoreFn::StrToUpper
        | CoreFn::StrToLower
        | CoreFn::StrSplit
        | CoreFn::StrSubstr
        | CoreFn::StrTrim => call_string_method(engine, f, this, args),

        // --- Object ---
        CoreFn::ObjSet => {
            let key = args.first().copied().unwrap_or(Value::Undef);
            let value = args.get(1).copied().unwrap_or(Value::Undef);
            engine.prop_set(this, key, value, 0)?;
            Ok(this)
        }
        CoreFn::ObjGet => {
            let key = args.first().copied().unwrap_or(Value::Undef);
            Ok(engine.prop_get(this, key).unwrap_or(Value::Undef))
        }
        CoreFn::ObjUnset => {
            let key = args.first().copied().unwrap_or(Value::Undef);
            engine.prop_unset(this, key).map(Value::Bool)
        }
        CoreFn::ObjHasOwn => {
            let key = args.first().copied().unwrap_or(Value::Undef);
            Ok(Value::Bool(engine.prop_get_own(this, key).is_some()))
        }
        CoreFn::ObjPropertyKeys => {
            let Some(id) = this.ref_id() else {
                return Err(engine.throw(ResultCode::Type, "value cannot hold properties"));
            };
            let keys: Vec<Value> = match engine.heap.get(id).meta() {
                Some(meta) => meta.props.visible_keys().collect(),
                None => return Err(engine.throw(ResultCode::Type, "value cannot hold properties")),
            };
            engine.new_array(keys)
        }
        CoreFn::ObjWithThis => {
            let func = args.first().copied().unwrap_or(Value::Undef);
            crate::eval::call_function(engine, func, this, &args.get(1..).unwrap_or(&[]).to_vec())
        }

        // --- Hash ---
        CoreFn::HashInsert => {
            let key = args.first().copied().unwrap_or(Value::Undef);
            let value = args.get(1).copied().unwrap_or(Value::Undef);
            engine.hash_insert(this, key, value)?;
            Ok(value)
        }
        CoreFn::HashSearch => {
            let key = args.first().copied().unwrap_or(Value::Undef);
            Ok(engine.hash_search(this, key).unwrap_or(Value::Undef))
        }
        CoreFn::HashRemove => {
            let key = args.first().copied().unwrap_or(Value::Undef);
            engine.hash_remove(this, key).map(Value::Bool)
        }
        CoreFn::HashSize => {
            let id = want_hash(engine, this)?;
            let len = match engine.heap.get(id) {
                HeapData::Hash(h) => h.len(),
                _ => 0,
            };
            Ok(Value::Int(len as i64))
        }
        CoreFn::HashEntryKeys => {
            let id = want_hash(engine, this)?;
            let keys: Vec<Value> = match engine.heap.get(id) {
                HeapData::Hash(h) => h.iter_entries().map(|(k, _)| k).collect(),
                _ => Vec::new(),
            };
            engine.new_array(keys)
        }
        CoreFn::HashHasEntry => {
            let key = args.first().copied().unwrap_or(Value::Undef);
            Ok(Value::Bool(engine.hash_search(this, key).is_some()))
        }

        // --- Buffer ---
        CoreFn::BufLength | CoreFn::BufCapacity => {
            let id = want_buffer(engine, this)?;
            let n = match engine.heap.get(id) {
                HeapData::Buffer(b) => {
                    if f == CoreFn::BufLength {
                        b.bytes.len()
                    } else {
                        b.bytes.capacity()
                    }
                }
                _ => 0,
            };
            Ok(Value::Int(n as i64))
        }
        CoreFn::BufAppend => {
            let id = want_buffer(engine, this)?;
            let mut chunk = String::new();
            for arg in args {
                crate::value::to_display(*arg, &engine.heap, &mut chunk);
            }
            match engine.heap.get_mut(id) {
                HeapData::Buffer(b) => b.bytes.extend_from_slice(chunk.as_bytes()),
                _ => unreachable!("checked buffer type above"),
            }
            Ok(this)
        }
        CoreFn::BufToString => {
            let id = want_buffer(engine, this)?;
            let text = match engine.heap.get(id) {
                HeapData::Buffer(b) => String::from_utf8_lossy(&b.bytes).into_owned(),
                _ => String::new(),
            };
            engine.new_string(&text)
        }
        CoreFn::BufReset => {
            let id = want_buffer(engine, this)?;
            let mut data = engine.heap.take_data(id);
            if let HeapData::Buffer(b) = &mut data {
                // The old backing store goes back to the chunk recycler.
                let old = std::mem::take(&mut b.bytes);
                engine.heap.chunks.put(old);
            }
            engine.heap.restore_data(id, data);
            Ok(this)
        }

        // --- Function ---
        CoreFn::FuncApply => {
            let this_arg = args.first().copied().unwrap_or(Value::Undef);
            let list = args.get(1).copied().unwrap_or(Value::Undef);
            let call_args: Vec<Value> = match list.ref_id().map(|id| engine.heap.get(id)) {
                Some(HeapData::Array(a)) => a.list.clone(),
                Some(HeapData::Tuple(t)) => t.slots.to_vec(),
                None if matches!(list, Value::Undef) => Vec::new(),
                _ => return Err(engine.throw(ResultCode::Type, "apply needs an array of arguments")),
            };
            crate::eval::call_function(engine, this, this_arg, &call_args)
        }
        CoreFn::FuncCall => {
            let this_arg = args.first().copied().unwrap_or(Value::Undef);
            let rest = args.get(1..).unwrap_or(&[]).to_vec();
            crate::eval::call_function(engine, this, this_arg, &rest)
        }
        CoreFn::FuncSource => {
            let Some(id) = this.ref_id() else {
                return Err(engine.throw(ResultCode::Type, "not a function"));
            };
            let source = match engine.heap.get(id) {
                HeapData::Function(fd) => match &fd.kind {
                    crate::func::FuncKind::Script(s) => Some((std::rc::Rc::clone(&s.src), s.body)),
                    _ => None,
                },
                _ => return Err(engine.throw(ResultCode::Type, "not a function")),
            };
            match source {
                Some((src, (begin, end))) => {
                    let text = src.text[begin..end].to_owned();
                    engine.new_string(&text)
                }
                None => Ok(Value::Undef),
            }
        }

        // --- Exception ---
        CoreFn::ExcCodeString => {
            let Some(id) = this.ref_id() else {
                return Err(engine.throw(ResultCode::Type, "not an exception"));
            };
            let code = match engine.heap.get(id) {
                HeapData::Exception(e) => e.code,
                _ => return Err(engine.throw(ResultCode::Type, "not an exception")),
            };
            let name: &'static str = code.into();
            engine.new_string(name)
        }

        // --- Tuple ---
        CoreFn::TupleLength => {
            let Some(id) = this.ref_id() else {
                return Err(engine.throw(ResultCode::Type, "not a tuple"));
            };
            match engine.heap.get(id) {
                HeapData::Tuple(t) => Ok(Value::Int(t.slots.len() as i64)),
                _ => Err(engine.throw(ResultCode::Type, "not a tuple")),
            }
        }
        CoreFn::TupleJoin => {
            let Some(id) = this.ref_id() else {
                return Err(engine.throw(ResultCode::Type, "not a tuple"));
            };
            let sep = args.first().map_or_else(String::new, |s| engine.display_string(*s));
            let len = match engine.heap.get(id) {
                HeapData::Tuple(t) => t.slots.len(),
                _ => return Err(engine.throw(ResultCode::Type, "not a tuple")),
            };
            let mut out = String::new();
            for i in 0..len {
                if i > 0 {
                    out.push_str(&sep);
                }
                let element = match engine.heap.get(id) {
                    HeapData::Tuple(t) => t.slots[i],
                    _ => Value::Undef,
                };
                crate::value::to_display(element, &engine.heap, &mut out);
            }
            engine.new_string(&out)
        }

        // --- Unique ---
        CoreFn::UniqueValue => {
            let Some(id) = this.ref_id() else {
                return Err(engine.throw(ResultCode::Type, "not a unique value"));
            };
            match engine.heap.get(id) {
                HeapData::Unique(u) => Ok(u.wrapped),
                _ => Err(engine.throw(ResultCode::Type, "not a unique value")),
            }
        }
    }
}

fn call_string_method<T: ResourceTracker>(
    engine: &mut Engine<T>,
    f: CoreFn,
    this: Value,
    args: &[Value],
) -> EvalResult<Value> {
    let Some(s) = this.as_str(&engine.heap) else {
        return Err(engine.throw(ResultCode::Type, "not a string"));
    };
    // Methods that can answer without allocating a new string first.
    match f {
        CoreFn::StrLength => return Ok(Value::Int(s.chars().count() as i64)),
        CoreFn::StrByteLength => return Ok(Value::Int(s.len() as i64)),
        CoreFn::StrIsAscii => return Ok(Value::Bool(s.is_ascii())),
        _ => {}
    }
    let s = s.to_owned();
    match f {
        CoreFn::StrCharAt => {
            let i = int_arg(engine, args, 0).unwrap_or(0);
            let ch = if i >= 0 { s.chars().nth(i as usize) } else { None };
            match ch {
                Some(c) => {
                    let mut buf = [0u8; 4];
                    engine.new_string(c.encode_utf8(&mut buf))
                }
                None => Ok(Value::Undef),
            }
        }
        CoreFn::StrIndexOf => {
            let needle = args.first().map_or_else(String::new, |a| engine.display_string(*a));
            match s.find(&needle) {
                Some(byte_pos) => Ok(Value::Int(s[..byte_pos].chars().count() as i64)),
                None => Ok(Value::Int(-1)),
            }
        }
        CoreFn::StrConcat => {
            let mut out = s;
            for arg in args {
                crate::value::to_display(*arg, &engine.heap, &mut out);
            }
            engine.new_string(&out)
        }
        CoreFn::StrToUpper => {
            let out = s.to_uppercase();
            engine.new_string(&out)
        }
        CoreFn::StrToLower => {
            let out = s.to_lowercase();
            engine.new_string(&out)
        }
        CoreFn::StrSplit => {
            let sep = args.first().map_or_else(String::new, |a| engine.display_string(*a));
            let parts: Vec<String> = if sep.is_empty() {
                s.chars().map(String::from).collect()
            } else {
                s.split(&sep).map(str::to_owned).collect()
            };
            let mut items = Vec::with_capacity(parts.len());
            for part in &parts {
                let v = engine.new_string(part)?;
                engine.holder_push(v)?;
                items.push(v);
            }
            engine.new_array(items)
        }
        CoreFn::StrSubstr => {
            let begin = int_arg(engine, args, 0).unwrap_or(0).max(0) as usize;
            let count = int_arg(engine, args, 1);
            let out: String = match count {
                Some(c) => s.chars().skip(begin).take(c.max(0) as usize).collect(),
                None => s.chars().skip(begin).collect(),
            };
            engine.new_string(&out)
        }
        CoreFn::StrTrim => {
            let out = s.trim().to_owned();
            engine.new_string(&out)
        }
        _ => unreachable!("routed string methods only"),
    }
}

fn int_arg<T: ResourceTracker>(engine: &Engine<T>, args: &[Value], index: usize) -> Option<i64> {
    args.get(index).and_then(|v| v.coerce_int(&engine.heap))
}

fn want_array<T: ResourceTracker>(engine: &mut Engine<T>, v: Value) -> EvalResult<HeapId> {
    match v.ref_id() {
        Some(id) if matches!(engine.heap.get(id), HeapData::Array(_)) => Ok(id),
        _ => Err(engine.throw(ResultCode::Type, "not an array")),
    }
}

fn want_hash<T: ResourceTracker>(engine: &mut Engine<T>, v: Value) -> EvalResult<HeapId> {
    match v.ref_id() {
        Some(id) if matches!(engine.heap.get(id), HeapData::Hash(_)) => Ok(id),
        _ => Err(engine.throw(ResultCode::Type, "not a hash")),
    }
}

fn want_buffer<T: ResourceTracker>(engine: &mut Engine<T>, v: Value) -> EvalResult<HeapId> {
    match v.ref_id() {
        Some(id) if matches!(engine.heap.get(id), HeapData::Buffer(_)) => Ok(id),
        _ => Err(engine.throw(ResultCode::Type, "not a buffer")),
    }
}
