//! Keywords, control-flow constructs, and user-defined keywords.
//!
//! Keyword lookup is a closed, length-filtered match over the identifier
//! bytes. Names that miss fall through to the UKWD registry, whose fast path
//! is a per-length shortlist in front of a hashtable.
//!
//! Every handler honors skip mode: while the engine's skip level is positive
//! it consumes exactly the tokens it would normally consume and produces
//! `undef` without side effects, which is what makes `false && var x = 1`
//! both parse and do nothing.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::{
    engine::Engine,
    error::{EvalError, EvalResult},
    eval::{EvalFlags, StackTok, call_function, enter_nested, eval_expr, eval_object_literal, eval_statements,
           leave_nested},
    func::{FuncData, FuncKind, Param, ScriptFunc},
    heap::HeapData,
    intern::KnownStr,
    props::{CONT_NO_NEW_PROPS, CONT_NO_PROP_SET, CONT_VISITING, PROP_CONST, PROP_HIDDEN},
    rc::ResultCode,
    resource::ResourceTracker,
    token::{OpSym, TokType, Token, Tokenizer},
    value::{TypeTag, Value},
};

/// The closed keyword set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Keyword {
    Var,
    Const,
    If,
    Else,
    While,
    Do,
    For,
    Foreach,
    Break,
    Continue,
    Return,
    Exit,
    Throw,
    Catch,
    Assert,
    Affirm,
    Proc,
    Scope,
    Eval,
    New,
    Unset,
    Typeinfo,
    Pragma,
    Class,
    Enum,
    True,
    False,
    Null,
    Undefined,
    This,
    Using,
    Inherits,
}

impl Keyword {
    /// Length-filtered closed lookup over the identifier bytes.
    pub fn lookup(text: &str) -> Option<Self> {
        let kw = match text.len() {
            2 => match text {
                "if" => Self::If,
                "do" => Self::Do,
                _ => return None,
            },
            3 => match text {
                "var" => Self::Var,
                "for" => Self::For,
                "new" => Self::New,
                _ => return None,
            },
            4 => match text {
                "else" => Self::Else,
                "exit" => Self::Exit,
                "proc" => Self::Proc,
                "eval" => Self::Eval,
                "enum" => Self::Enum,
                "true" => Self::True,
                "null" => Self::Null,
                "this" => Self::This,
                _ => return None,
            },
            5 => match text {
                "const" => Self::Const,
                "while" => Self::While,
                "break" => Self::Break,
                "throw" => Self::Throw,
                "catch" => Self::Catch,
                "scope" => Self::Scope,
                "unset" => Self::Unset,
                "class" => Self::Class,
                "false" => Self::False,
                "using" => Self::Using,
                _ => return None,
            },
            6 => match text {
                "return" => Self::Return,
                "assert" => Self::Assert,
                "affirm" => Self::Affirm,
                "pragma" => Self::Pragma,
                _ => return None,
            },
            7 => match text {
                "foreach" => Self::Foreach,
                _ => return None,
            },
            8 => match text {
                "continue" => Self::Continue,
                "typeinfo" => Self::Typeinfo,
                "inherits" => Self::Inherits,
                _ => return None,
            },
            9 => match text {
                "undefined" => Self::Undefined,
                _ => return None,
            },
            _ => return None,
        };
        Some(kw)
    }
}

// --- User-defined keywords ---

/// The UKWD registry: a name-keyed table plus per-length sorted shortlists
/// so misses are rejected on length alone.
#[derive(Debug, Default)]
pub(crate) struct Ukwds {
    table: AHashMap<String, Value>,
    by_len: BTreeMap<usize, Vec<String>>,
}

impl Ukwds {
    fn contains(&self, name: &str) -> bool {
        self.by_len
            .get(&name.len())
            .is_some_and(|bucket| bucket.binary_search_by(|n| n.as_str().cmp(name)).is_ok())
    }

    fn get(&self, name: &str) -> Option<Value> {
        if !self.contains(name) {
            return None;
        }
        self.table.get(name).copied()
    }

    fn insert(&mut self, name: String, value: Value) {
        let bucket = self.by_len.entry(name.len()).or_default();
        if let Err(pos) = bucket.binary_search(&name) {
            bucket.insert(pos, name.clone());
        }
        self.table.insert(name, value);
    }
}

fn is_legal_identifier(name: &str) -> bool {
    let bytes = name.as_bytes();
    let Some(&first) = bytes.first() else { return false };
    if !(first.is_ascii_alphabetic() || first == b'_' || first >= 0x80) {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80)
}

/// Registers a user-defined keyword. Entries are immutable once installed.
pub(crate) fn register_ukwd<T: ResourceTracker>(engine: &mut Engine<T>, name: &str, value: Value) -> EvalResult<()> {
    if !is_legal_identifier(name) {
        return Err(engine.throw(ResultCode::Misuse, "keyword name is not a legal identifier"));
    }
    if Keyword::lookup(name).is_some() {
        return Err(engine.throw(ResultCode::AlreadyExists, "name is a built-in keyword"));
    }
    if engine.ukwds.contains(name) {
        return Err(engine.throw(ResultCode::AlreadyExists, "keyword is already registered"));
    }
    if matches!(value, Value::Undef | Value::Null) {
        return Err(engine.throw(ResultCode::Misuse, "keyword value may not be null or undefined"));
    }
    // Keyword values are engine-owned roots: referenced and vacuum-proof.
    engine.scopes.vref(&mut engine.heap, value).map_err(EvalError::Fatal)?;
    engine.scopes.make_vacuum_proof(&mut engine.heap, value, true);
    engine.ukwds.insert(name.to_owned(), value);
    Ok(())
}

/// The tokenizer-phase UKWD resolution.
pub(crate) fn ukwd_lookup<T: ResourceTracker>(engine: &Engine<T>, name: &str) -> Option<Value> {
    engine.ukwds.get(name)
}

// --- Dispatch ---

/// Evaluates one keyword construct beginning at `tok` and returns its value.
pub(crate) fn dispatch<T: ResourceTracker>(
    engine: &mut Engine<T>,
    toker: &mut Tokenizer<'_>,
    kw: Keyword,
    tok: &Token,
) -> EvalResult<StackTok> {
    let at = (tok.line, tok.col);
    match kw {
        Keyword::True => Ok(StackTok::rvalue(Value::Bool(true), at.0, at.1)),
        Keyword::False => Ok(StackTok::rvalue(Value::Bool(false), at.0, at.1)),
        Keyword::Null => Ok(StackTok::rvalue(Value::Null, at.0, at.1)),
        Keyword::Undefined => Ok(StackTok::rvalue(Value::Undef, at.0, at.1)),
        Keyword::This => {
            let key = Engine::<T>::known(KnownStr::This);
            let v = engine
                .scopes
                .var_search(&engine.heap, key, 0)
                .map_or(Value::Undef, |(_, v)| v);
            Ok(StackTok::rvalue(v, at.0, at.1))
        }
        Keyword::Var => kw_var(engine, toker, at, false),
        Keyword::Const => kw_var(engine, toker, at, true),
        Keyword::If => kw_if(engine, toker, at),
        Keyword::While => kw_while(engine, toker, at),
        Keyword::Do => kw_do(engine, toker, at),
        Keyword::For => kw_for(engine, toker, at),
        Keyword::Foreach => kw_foreach(engine, toker, at),
        Keyword::Break => kw_flow_with_payload(engine, toker, at, FlowKind::Break),
        Keyword::Continue => {
            if engine.skip_level > 0 {
                return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
            }
            Err(EvalError::Continue)
        }
        Keyword::Return => kw_flow_with_payload(engine, toker, at, FlowKind::Return),
        Keyword::Exit => kw_flow_with_payload(engine, toker, at, FlowKind::Exit),
        Keyword::Throw => kw_throw(engine, toker, at),
        Keyword::Catch => kw_catch(engine, toker, at),
        Keyword::Assert => kw_assert(engine, toker, at, false),
        Keyword::Affirm => kw_assert(engine, toker, at, true),
        Keyword::Proc => kw_proc(engine, toker, at),
        Keyword::Scope => kw_scope(engine, toker, at),
        Keyword::Eval => kw_eval(engine, toker, at),
        Keyword::New => kw_new(engine, toker, at),
        Keyword::Unset => kw_unset(engine, toker, at),
        Keyword::Typeinfo => kw_typeinfo(engine, toker, at),
        Keyword::Pragma => kw_pragma(engine, toker, at),
        Keyword::Class => kw_class(engine, toker, at),
        Keyword::Enum => kw_enum(engine, toker, at),
        Keyword::Else | Keyword::Using | Keyword::Inherits => {
            Err(syntax(engine, at, "keyword is not valid here"))
        }
    }
}

fn syntax<T: ResourceTracker>(engine: &mut Engine<T>, at: (u32, u32), msg: &str) -> EvalError {
    let mut err = crate::error::EngineError::default();
    err.set(ResultCode::Syntax, at.0, at.1, msg);
    err.script = engine.script.as_ref().map(|s| s.name.to_string());
    EvalError::Engine(Box::new(err))
}

fn expect_group<T: ResourceTracker>(
    engine: &mut Engine<T>,
    toker: &mut Tokenizer<'_>,
    ttype: TokType,
    msg: &str,
) -> EvalResult<Token> {
    let tok = toker.next_sig();
    if tok.ttype != ttype {
        return Err(syntax(engine, (tok.line, tok.col), msg));
    }
    Ok(tok)
}

/// Evaluates a brace-group body in a fresh scope, yielding its last value.
fn eval_body_scoped<T: ResourceTracker>(engine: &mut Engine<T>, toker: &Tokenizer<'_>, body: &Token) -> EvalResult<Value> {
    enter_nested(engine)?;
    engine.push_scope();
    let mut sub = toker.sub(body.adj_begin, body.adj_end);
    let outcome = eval_statements(engine, &mut sub);
    let result = match outcome {
        Ok(v) => {
            engine.pop_scope(&[v]);
            Ok(v)
        }
        Err(e) => {
            engine.pop_scope_propagating(&e);
            Err(e)
        }
    };
    leave_nested(engine);
    result
}

/// Evaluates the condition group of `if`/`while`/`do` from scratch.
fn eval_cond_group<T: ResourceTracker>(engine: &mut Engine<T>, toker: &Tokenizer<'_>, group: &Token) -> EvalResult<bool> {
    enter_nested(engine)?;
    let result = (|| {
        let mut sub = toker.sub(group.adj_begin, group.adj_end);
        let st = eval_expr(engine, &mut sub, EvalFlags::default())?;
        Ok(st.map_or(false, |st| st.val.truthy(&engine.heap)))
    })();
    leave_nested(engine);
    result
}

// --- var / const ---

fn kw_var<T: ResourceTracker>(
    engine: &mut Engine<T>,
    toker: &mut Tokenizer<'_>,
    at: (u32, u32),
    is_const: bool,
) -> EvalResult<StackTok> {
    let mut last = Value::Undef;
    loop {
        let name_tok = toker.next_sig();
        if name_tok.ttype != TokType::Ident {
            return Err(syntax(engine, (name_tok.line, name_tok.col), "expected a variable name"));
        }
        let text = toker.text(&name_tok);
        if Keyword::lookup(text).is_some() {
            return Err(syntax(engine, (name_tok.line, name_tok.col), "keyword is not a valid variable name"));
        }
        let name = engine.new_string(text)?;
        engine.holder_push(name)?;
        let mut value = Value::Undef;
        let next = toker.peek_sig();
        if next.ttype == TokType::Op(OpSym::Assign) {
            toker.next_sig();
            let Some(st) = eval_expr(engine, toker, EvalFlags::comma_stops())? else {
                return Err(syntax(engine, (next.line, next.col), "expected an initializer"));
            };
            value = st.val;
            engine.holder_push(value)?;
        } else if is_const {
            return Err(syntax(engine, (name_tok.line, name_tok.col), "const requires an initializer"));
        }
        if engine.skip_level == 0 {
            engine
                .scopes
                .declare(&mut engine.heap, 0, name, value, is_const)
                .map_err(|code| {
                    let msg = format!("'{text}' is already declared in this scope");
                    engine.throw(code, &msg)
                })?;
        }
        last = value;
        let sep = toker.peek_sig();
        if sep.ttype == TokType::Op(OpSym::Comma) {
            toker.next_sig();
            continue;
        }
        break;
    }
    Ok(StackTok::rvalue(last, at.0, at.1))
}

// --- if / else ---

fn kw_if<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let cond_group = expect_group(engine, toker, TokType::ParenGroup, "expected '(condition)' after 'if'")?;
    let mut ran = false;
    let truthy = if engine.skip_level > 0 {
        false
    } else {
        eval_cond_group(engine, toker, &cond_group)?
    };
    consume_branch(engine, toker, truthy && engine.skip_level == 0)?;
    ran |= truthy;
    // else / else if chains.
    loop {
        let next = toker.peek_sig();
        if next.ttype != TokType::Ident || toker.text(&next) != "else" {
            break;
        }
        toker.next_sig();
        let after = toker.peek_sig();
        if after.ttype == TokType::Ident && toker.text(&after) == "if" {
            toker.next_sig();
            let cond = expect_group(engine, toker, TokType::ParenGroup, "expected '(condition)' after 'else if'")?;
            let truthy = if ran || engine.skip_level > 0 {
                false
            } else {
                eval_cond_group(engine, toker, &cond)?
            };
            consume_branch(engine, toker, truthy && engine.skip_level == 0)?;
            ran |= truthy;
        } else {
            consume_branch(engine, toker, !ran && engine.skip_level == 0)?;
            break;
        }
    }
    Ok(StackTok::rvalue(Value::Bool(ran), at.0, at.1))
}

/// Consumes one branch body, evaluating it only when `live`.
fn consume_branch<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, live: bool) -> EvalResult<()> {
    let body = toker.next_sig();
    if body.ttype == TokType::BraceGroup {
        if live {
            eval_body_scoped(engine, toker, &body)?;
        }
        return Ok(());
    }
    // Expression branch: put the token back and evaluate (dead branches run
    // in skip mode so they parse without side effects).
    toker.putback();
    if live {
        eval_expr(engine, toker, EvalFlags::default())?;
    } else {
        engine.skip_level += 1;
        let result = eval_expr(engine, toker, EvalFlags::default());
        engine.skip_level -= 1;
        result?;
    }
    Ok(())
}

// --- Loops ---

/// Digests a loop-body outcome: `Ok(None)` keeps looping, `Ok(Some(v))`
/// breaks with payload `v`.
fn loop_body_result<T: ResourceTracker>(engine: &mut Engine<T>, outcome: EvalResult<Value>) -> EvalResult<Option<Value>> {
    match outcome {
        Ok(_) => Ok(None),
        Err(EvalError::Continue) => Ok(None),
        Err(EvalError::Break(v)) => {
            engine.scopes.vunhand(&mut engine.heap, v);
            Ok(Some(v))
        }
        Err(other) => Err(other),
    }
}

fn kw_while<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let cond = expect_group(engine, toker, TokType::ParenGroup, "expected '(condition)' after 'while'")?;
    let body = expect_group(engine, toker, TokType::BraceGroup, "expected '{...}' loop body")?;
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    let mut result = Value::Undef;
    loop {
        engine.check_interrupt()?;
        if !eval_cond_group(engine, toker, &cond)? {
            break;
        }
        let outcome = eval_body_scoped(engine, toker, &body);
        if let Some(v) = loop_body_result(engine, outcome)? {
            result = v;
            break;
        }
    }
    Ok(StackTok::rvalue(result, at.0, at.1))
}

fn kw_do<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let body = expect_group(engine, toker, TokType::BraceGroup, "expected '{...}' after 'do'")?;
    let kw = toker.next_sig();
    if kw.ttype != TokType::Ident || toker.text(&kw) != "while" {
        return Err(syntax(engine, (kw.line, kw.col), "expected 'while' after do-body"));
    }
    let cond = expect_group(engine, toker, TokType::ParenGroup, "expected '(condition)' after 'while'")?;
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    let mut result = Value::Undef;
    loop {
        engine.check_interrupt()?;
        let outcome = eval_body_scoped(engine, toker, &body);
        if let Some(v) = loop_body_result(engine, outcome)? {
            result = v;
            break;
        }
        if !eval_cond_group(engine, toker, &cond)? {
            break;
        }
    }
    Ok(StackTok::rvalue(result, at.0, at.1))
}

fn kw_for<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let head = expect_group(engine, toker, TokType::ParenGroup, "expected '(init; cond; incr)' after 'for'")?;
    let body = expect_group(engine, toker, TokType::BraceGroup, "expected '{...}' loop body")?;
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    enter_nested(engine)?;
    engine.push_scope();
    let outcome = (|| -> EvalResult<Value> {
        let mut head_toker = toker.sub(head.adj_begin, head.adj_end);
        // init
        eval_expr(engine, &mut head_toker, EvalFlags::default())?;
        let sep = head_toker.next_sig();
        if sep.ttype != TokType::Eox {
            return Err(syntax(engine, (sep.line, sep.col), "expected ';' after for-initializer"));
        }
        let cond_begin = head_toker.pos();
        // Scan past the condition once to find the increment segment.
        eval_in_skip_mode(engine, &mut head_toker)?;
        let sep = head_toker.next_sig();
        if sep.ttype != TokType::Eox {
            return Err(syntax(engine, (sep.line, sep.col), "expected ';' after for-condition"));
        }
        let incr_begin = head_toker.pos();
        let head_end = head.adj_end;

        let mut result = Value::Undef;
        loop {
            engine.check_interrupt()?;
            let mut cond_toker = toker.sub(cond_begin, head_end);
            let proceed = match eval_expr(engine, &mut cond_toker, EvalFlags::default())? {
                Some(st) => st.val.truthy(&engine.heap),
                None => true,
            };
            if !proceed {
                break;
            }
            let body_outcome = eval_body_scoped(engine, toker, &body);
            if let Some(v) = loop_body_result(engine, body_outcome)? {
                result = v;
                break;
            }
            let mut incr_toker = toker.sub(incr_begin, head_end);
            eval_expr(engine, &mut incr_toker, EvalFlags::default())?;
        }
        Ok(result)
    })();
    let result = match outcome {
        Ok(v) => {
            engine.pop_scope(&[v]);
            Ok(StackTok::rvalue(v, at.0, at.1))
        }
        Err(e) => {
            engine.pop_scope_propagating(&e);
            Err(e)
        }
    };
    leave_nested(engine);
    result
}

/// Parses one expression without executing it (for-head scanning).
fn eval_in_skip_mode<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>) -> EvalResult<()> {
    engine.skip_level += 1;
    let result = eval_expr(engine, toker, EvalFlags::default());
    engine.skip_level -= 1;
    result.map(|_| ())
}

fn kw_foreach<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let head = expect_group(engine, toker, TokType::ParenGroup, "expected '(container => key, value)' after 'foreach'")?;
    let body = expect_group(engine, toker, TokType::BraceGroup, "expected '{...}' loop body")?;
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    enter_nested(engine)?;
    let result = (|| -> EvalResult<Value> {
        let mut head_toker = toker.sub(head.adj_begin, head.adj_end);
        let Some(container_st) = eval_expr(
            engine,
            &mut head_toker,
            EvalFlags {
                stop_on_comma: false,
                stop_on_fat_arrow: true,
            },
        )?
        else {
            return Err(syntax(engine, at, "foreach needs a container"));
        };
        let container = container_st.val;
        engine.holder_push(container)?;
        let arrow = head_toker.next_sig();
        if arrow.ttype != TokType::Op(OpSym::FatArrow) {
            return Err(syntax(engine, (arrow.line, arrow.col), "expected '=>' in foreach"));
        }
        let key_tok = head_toker.next_sig();
        if key_tok.ttype != TokType::Ident {
            return Err(syntax(engine, (key_tok.line, key_tok.col), "expected a key name"));
        }
        let key_name = engine.new_string(head_toker.text(&key_tok))?;
        engine.holder_push(key_name)?;
        let mut val_name = None;
        let sep = head_toker.peek_sig();
        if sep.ttype == TokType::Op(OpSym::Comma) {
            head_toker.next_sig();
            let val_tok = head_toker.next_sig();
            if val_tok.ttype != TokType::Ident {
                return Err(syntax(engine, (val_tok.line, val_tok.col), "expected a value name"));
            }
            let name = engine.new_string(head_toker.text(&val_tok))?;
            engine.holder_push(name)?;
            val_name = Some(name);
        }
        iterate_container(engine, toker, &body, container, key_name, val_name)
    })();
    leave_nested(engine);
    result.map(|v| StackTok::rvalue(v, at.0, at.1))
}

/// Drives foreach iteration over every iterable kind, locking containers
/// against structural mutation for the duration.
fn iterate_container<T: ResourceTracker>(
    engine: &mut Engine<T>,
    toker: &Tokenizer<'_>,
    body: &Token,
    container: Value,
    key_name: Value,
    val_name: Option<Value>,
) -> EvalResult<Value> {
    // Strings iterate over a snapshot of their characters.
    if let Some(s) = container.as_str(&engine.heap) {
        let chars: Vec<char> = s.chars().collect();
        let mut result = Value::Undef;
        for (i, c) in chars.into_iter().enumerate() {
            engine.check_interrupt()?;
            let mut buf = [0u8; 4];
            let ch = engine.new_string(c.encode_utf8(&mut buf))?;
            let outcome = run_foreach_body(engine, toker, body, key_name, Value::Int(i as i64), val_name, ch);
            if let Some(v) = loop_body_result(engine, outcome)? {
                result = v;
                break;
            }
        }
        return Ok(result);
    }
    let Some(id) = container.ref_id() else {
        return Err(engine.throw(ResultCode::Type, "value is not iterable"));
    };
    enum Shape {
        List(usize),
        Props(usize),
        Hash(usize),
    }
    let shape = match engine.heap.get(id) {
        HeapData::Array(a) => Shape::List(a.list.len()),
        HeapData::Tuple(t) => Shape::List(t.slots.len()),
        HeapData::Object(o) => Shape::Props(o.meta.props.len()),
        HeapData::Exception(e) => Shape::Props(e.meta.props.len()),
        HeapData::Hash(h) => Shape::Hash(h.raw_len()),
        _ => return Err(engine.throw(ResultCode::Type, "value is not iterable")),
    };
    set_visiting(engine, id, true);
    let iteration = (|| -> EvalResult<Value> {
        match shape {
            Shape::List(len) => {
                for i in 0..len {
                    engine.check_interrupt()?;
                    let element = match engine.heap.get(id) {
                        HeapData::Array(a) => a.list.get(i).copied().unwrap_or(Value::Undef),
                        HeapData::Tuple(t) => t.slots.get(i).copied().unwrap_or(Value::Undef),
                        _ => Value::Undef,
                    };
                    let outcome =
                        run_foreach_body(engine, toker, body, key_name, Value::Int(i as i64), val_name, element);
                    if let Some(v) = loop_body_result(engine, outcome)? {
                        return Ok(v);
                    }
                }
                Ok(Value::Undef)
            }
            Shape::Props(len) => {
                for i in 0..len {
                    engine.check_interrupt()?;
                    let entry = match engine.heap.get(id).meta() {
                        Some(meta) => meta.props.entry_at(i).map(|(k, s)| (*k, *s)),
                        None => None,
                    };
                    let Some((k, slot)) = entry else { continue };
                    if slot.flags & PROP_HIDDEN != 0 {
                        continue;
                    }
                    let outcome = run_foreach_body(engine, toker, body, key_name, k, val_name, slot.value);
                    if let Some(v) = loop_body_result(engine, outcome)? {
                        return Ok(v);
                    }
                }
                Ok(Value::Undef)
            }
            Shape::Hash(len) => {
                for i in 0..len {
                    engine.check_interrupt()?;
                    let entry = match engine.heap.get(id) {
                        HeapData::Hash(h) => h.entry_at(i),
                        _ => None,
                    };
                    let Some((k, slot)) = entry else { continue };
                    let outcome = run_foreach_body(engine, toker, body, key_name, k, val_name, slot.value);
                    if let Some(v) = loop_body_result(engine, outcome)? {
                        return Ok(v);
                    }
                }
                Ok(Value::Undef)
            }
        }
    })();
    set_visiting(engine, id, false);
    iteration
}

fn set_visiting<T: ResourceTracker>(engine: &mut Engine<T>, id: crate::heap::HeapId, on: bool) {
    if let Some(meta) = engine.heap.get_mut(id).meta_mut() {
        if on {
            meta.flags |= CONT_VISITING;
        } else {
            meta.flags &= !CONT_VISITING;
        }
    }
}

/// One foreach iteration: fresh scope, key/value locals, body.
fn run_foreach_body<T: ResourceTracker>(
    engine: &mut Engine<T>,
    toker: &Tokenizer<'_>,
    body: &Token,
    key_name: Value,
    key: Value,
    val_name: Option<Value>,
    value: Value,
) -> EvalResult<Value> {
    engine.push_scope();
    let outcome = (|| -> EvalResult<Value> {
        engine
            .scopes
            .declare(&mut engine.heap, 0, key_name, key, false)
            .map_err(|code| engine.throw(code, "foreach key name collision"))?;
        if let Some(vn) = val_name {
            engine
                .scopes
                .declare(&mut engine.heap, 0, vn, value, false)
                .map_err(|code| engine.throw(code, "foreach value name collision"))?;
        }
        let mut sub = toker.sub(body.adj_begin, body.adj_end);
        eval_statements(engine, &mut sub)
    })();
    match outcome {
        Ok(v) => {
            engine.pop_scope(&[v]);
            Ok(v)
        }
        Err(e) => {
            engine.pop_scope_propagating(&e);
            Err(e)
        }
    }
}

// --- Flow control with payloads ---

enum FlowKind {
    Break,
    Return,
    Exit,
}

fn kw_flow_with_payload<T: ResourceTracker>(
    engine: &mut Engine<T>,
    toker: &mut Tokenizer<'_>,
    at: (u32, u32),
    kind: FlowKind,
) -> EvalResult<StackTok> {
    let payload = maybe_expr(engine, toker)?;
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    let v = payload.unwrap_or(Value::Undef);
    // The payload carries one reference while it propagates.
    engine.scopes.vref(&mut engine.heap, v).map_err(EvalError::Fatal)?;
    Err(match kind {
        FlowKind::Break => EvalError::Break(v),
        FlowKind::Return => EvalError::Return(v),
        FlowKind::Exit => EvalError::Exit(v),
    })
}

/// Parses an optional expression (none when the statement ends immediately).
fn maybe_expr<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>) -> EvalResult<Option<Value>> {
    let next = toker.peek_sig();
    if matches!(next.ttype, TokType::Eof | TokType::Eox) {
        return Ok(None);
    }
    Ok(eval_expr(engine, toker, EvalFlags::default())?.map(|st| st.val))
}

// --- throw / catch / assert / affirm ---

fn kw_throw<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let Some(st) = eval_expr(engine, toker, EvalFlags::default())? else {
        return Err(syntax(engine, at, "'throw' needs a value"));
    };
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    let v = st.val;
    // Rethrow exception values as-is to keep their location and trace.
    if matches!(v.ref_id().map(|id| engine.heap.get(id)), Some(HeapData::Exception(_))) {
        return Err(engine.rethrow(v));
    }
    let exc = engine.new_exception(ResultCode::Exception, "")?;
    engine.prop_set(exc, Engine::<T>::known(KnownStr::Message), v, 0)?;
    Err(engine.rethrow(exc))
}

fn kw_catch<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let body = toker.next_sig();
    let outcome: EvalResult<Value> = if body.ttype == TokType::BraceGroup {
        if engine.skip_level > 0 {
            return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
        }
        eval_body_scoped(engine, toker, &body)
    } else {
        toker.putback();
        if engine.skip_level > 0 {
            eval_in_skip_mode(engine, toker)?;
            return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
        }
        eval_expr(engine, toker, EvalFlags::default()).map(|st| st.map_or(Value::Undef, |st| st.val))
    };
    match outcome {
        Ok(_) => Ok(StackTok::rvalue(Value::Undef, at.0, at.1)),
        Err(EvalError::Exception(v)) => {
            engine.holder_push(v)?;
            engine.scopes.vunhand(&mut engine.heap, v);
            Ok(StackTok::rvalue(v, at.0, at.1))
        }
        Err(EvalError::Engine(err)) => {
            // Structured errors become catchable exception values here, at
            // the feature boundary.
            match engine.engine_error_to_exception(err) {
                EvalError::Exception(v) => {
                    engine.holder_push(v)?;
                    engine.scopes.vunhand(&mut engine.heap, v);
                    Ok(StackTok::rvalue(v, at.0, at.1))
                }
                other => Err(other),
            }
        }
        Err(other) => Err(other),
    }
}

fn kw_assert<T: ResourceTracker>(
    engine: &mut Engine<T>,
    toker: &mut Tokenizer<'_>,
    at: (u32, u32),
    catchable: bool,
) -> EvalResult<StackTok> {
    let expr_begin = toker.pos();
    let Some(st) = eval_expr(engine, toker, EvalFlags::default())? else {
        return Err(syntax(engine, at, "'assert' needs an expression"));
    };
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    if st.val.truthy(&engine.heap) {
        return Ok(StackTok::rvalue(Value::Bool(true), at.0, at.1));
    }
    let expr_text = toker.src()[expr_begin..toker.pos()].trim().trim_end_matches(';').trim_end();
    let msg = format!("assertion failed: {expr_text}");
    let exc = engine.new_exception(ResultCode::Assert, &msg)?;
    engine.scopes.vref(&mut engine.heap, exc).map_err(EvalError::Fatal)?;
    engine.tracer.on_throw(ResultCode::Assert);
    Err(if catchable {
        EvalError::Exception(exc)
    } else {
        EvalError::Uncatchable(exc)
    })
}

// --- proc ---

fn kw_proc<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    // Optional name.
    let mut name_text: Option<String> = None;
    let next = toker.peek_sig();
    if next.ttype == TokType::Ident && Keyword::lookup(toker.text(&next)).is_none() {
        toker.next_sig();
        name_text = Some(toker.text(&next).to_owned());
    }
    let params_group = expect_group(engine, toker, TokType::ParenGroup, "expected '(params)' after 'proc'")?;
    // Optional using-clause.
    let mut using_names: Vec<String> = Vec::new();
    let peek = toker.peek_sig();
    if peek.ttype == TokType::Ident && toker.text(&peek) == "using" {
        toker.next_sig();
        let group = expect_group(engine, toker, TokType::ParenGroup, "expected '(names)' after 'using'")?;
        let mut sub = toker.sub(group.adj_begin, group.adj_end);
        loop {
            let tok = sub.next_sig();
            match tok.ttype {
                TokType::Eof => break,
                TokType::Ident => using_names.push(sub.text(&tok).to_owned()),
                TokType::Op(OpSym::Comma) => {}
                _ => return Err(syntax(engine, (tok.line, tok.col), "expected a capture name")),
            }
        }
    }
    let body_group = expect_group(engine, toker, TokType::BraceGroup, "expected '{...}' function body")?;
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }

    // Parameter list: names with optional default-expression ranges.
    let mut params: Vec<Param> = Vec::new();
    {
        let mut sub = toker.sub(params_group.adj_begin, params_group.adj_end);
        loop {
            let tok = sub.next_sig();
            match tok.ttype {
                TokType::Eof => break,
                TokType::Ident => {
                    let name = engine.new_string(sub.text(&tok))?;
                    engine.holder_push(name)?;
                    let mut default = None;
                    let peek = sub.peek_sig();
                    if peek.ttype == TokType::Op(OpSym::Assign) {
                        sub.next_sig();
                        let begin = sub.pos();
                        // Scan the default to the next top-level comma.
                        let mut end = begin;
                        loop {
                            let t = sub.next_sig();
                            match t.ttype {
                                TokType::Eof | TokType::Op(OpSym::Comma) => break,
                                _ => end = t.end,
                            }
                        }
                        if end == begin {
                            return Err(syntax(engine, (peek.line, peek.col), "expected a default value"));
                        }
                        default = Some((begin, end));
                        params.push(Param { name, default });
                        continue;
                    }
                    params.push(Param { name, default });
                }
                TokType::Op(OpSym::Comma) => {}
                _ => return Err(syntax(engine, (tok.line, tok.col), "expected a parameter name")),
            }
        }
    }

    // Resolve using-captures now, against the defining scope chain.
    let mut using = Vec::with_capacity(using_names.len());
    for cap in &using_names {
        let cap_name = engine.new_string(cap)?;
        engine.holder_push(cap_name)?;
        let Some((_, v)) = engine.scopes.var_search(&engine.heap, cap_name, 0) else {
            let msg = format!("unknown 'using' symbol '{cap}'");
            return Err(engine.throw(ResultCode::UnknownIdentifier, &msg));
        };
        using.push((cap_name, v));
    }

    let name_val = match &name_text {
        Some(n) => engine.new_string(n)?,
        None => Value::Undef,
    };
    engine.holder_push(name_val)?;

    let src = engine
        .script
        .clone()
        .expect("script functions are created during script evaluation");

    // The function value takes a reference on every child it stores.
    engine.scopes.vref(&mut engine.heap, name_val).map_err(EvalError::Fatal)?;
    for p in &params {
        engine.scopes.vref(&mut engine.heap, p.name).map_err(EvalError::Fatal)?;
    }
    for (k, v) in &using {
        engine.scopes.vref(&mut engine.heap, *k).map_err(EvalError::Fatal)?;
        engine.scopes.vref(&mut engine.heap, *v).map_err(EvalError::Fatal)?;
    }
    let func = engine.new_func(FuncData {
        kind: FuncKind::Script(ScriptFunc {
            src,
            name: name_val,
            params,
            body: (body_group.adj_begin, body_group.adj_end),
            using,
        }),
        meta: crate::heap::ContainerMeta::default(),
    })?;
    if let Some(n) = name_text {
        engine.holder_push(func)?;
        let name_key = engine.new_string(&n)?;
        engine
            .scopes
            .declare(&mut engine.heap, 0, name_key, func, false)
            .map_err(|code| {
                let msg = format!("'{n}' is already declared in this scope");
                engine.throw(code, &msg)
            })?;
    }
    Ok(StackTok::rvalue(func, at.0, at.1))
}

// --- scope / eval ---

fn kw_scope<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let body = expect_group(engine, toker, TokType::BraceGroup, "expected '{...}' after 'scope'")?;
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    let v = eval_body_scoped(engine, toker, &body)?;
    Ok(StackTok::rvalue(v, at.0, at.1))
}

fn kw_eval<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let next = toker.next_sig();
    if next.ttype == TokType::BraceGroup {
        if engine.skip_level > 0 {
            return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
        }
        // `eval {}` runs in the current scope, unlike `scope {}`.
        enter_nested(engine)?;
        let mut sub = toker.sub(next.adj_begin, next.adj_end);
        let result = eval_statements(engine, &mut sub);
        leave_nested(engine);
        return Ok(StackTok::rvalue(result?, at.0, at.1));
    }
    toker.putback();
    let st = eval_expr(engine, toker, EvalFlags::default())?;
    Ok(StackTok::rvalue(st.map_or(Value::Undef, |st| st.val), at.0, at.1))
}

// --- new ---

fn kw_new<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    // Parse the constructor reference: an identifier, optionally dotted.
    let first = toker.next_sig();
    if first.ttype != TokType::Ident {
        return Err(syntax(engine, (first.line, first.col), "expected a constructor name after 'new'"));
    }
    let mut ctor_target = if engine.skip_level > 0 {
        Value::Undef
    } else {
        let name = engine.new_string(toker.text(&first))?;
        match engine.scopes.var_search(&engine.heap, name, 0) {
            Some((_, v)) => v,
            None => {
                let msg = format!("unknown identifier '{}'", toker.text(&first));
                return Err(engine.throw(ResultCode::UnknownIdentifier, &msg));
            }
        }
    };
    loop {
        let peek = toker.peek_sig();
        if peek.ttype != TokType::Op(OpSym::Dot) {
            break;
        }
        toker.next_sig();
        let key_tok = toker.next_sig();
        if key_tok.ttype != TokType::Ident {
            return Err(syntax(engine, (key_tok.line, key_tok.col), "expected a property name"));
        }
        if engine.skip_level == 0 {
            let key = engine.new_string(toker.text(&key_tok))?;
            ctor_target = engine.prop_get(ctor_target, key).unwrap_or(Value::Undef);
        }
    }
    let args_group = expect_group(engine, toker, TokType::ParenGroup, "expected '(args)' after constructor")?;
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    if !ctor_target.is_container(&engine.heap) {
        return Err(engine.throw(ResultCode::Type, "'new' needs a container constructor"));
    }

    enter_nested(engine)?;
    let result = (|| -> EvalResult<Value> {
        // Arguments.
        let mut args = Vec::new();
        let mut sub = toker.sub(args_group.adj_begin, args_group.adj_end);
        loop {
            let Some(st) = eval_expr(engine, &mut sub, EvalFlags::comma_stops())? else {
                break;
            };
            args.push(st.val);
            engine.holder_push(st.val)?;
            let next = sub.next_sig();
            match next.ttype {
                TokType::Op(OpSym::Comma) => {}
                TokType::Eof => break,
                _ => return Err(syntax(engine, (next.line, next.col), "expected ',' in argument list")),
            }
        }
        let obj = engine.new_object()?;
        engine.holder_push(obj)?;
        engine.set_proto(obj, ctor_target)?;
        let ctor_key = Engine::<T>::known(KnownStr::CtorNew);
        if let Some(ctor) = engine.prop_get(ctor_target, ctor_key) {
            let ctor_result = call_function(engine, ctor, obj, &args)?;
            // A container result from the constructor replaces the instance.
            if ctor_result.is_container(&engine.heap) && !ctor_result.same(obj) {
                return Ok(ctor_result);
            }
        }
        Ok(obj)
    })();
    leave_nested(engine);
    result.map(|v| StackTok::rvalue(v, at.0, at.1))
}

// --- unset ---

fn kw_unset<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    loop {
        let Some(st) = eval_expr(engine, toker, EvalFlags::comma_stops())? else {
            return Err(syntax(engine, at, "'unset' needs a target"));
        };
        if engine.skip_level == 0 {
            match st.lv {
                crate::eval::Lvalue::Var(name) => {
                    match engine.scopes.var_unset(&mut engine.heap, name) {
                        Ok(_) => {}
                        Err(code) => return Err(engine.throw(code, "cannot unset const variable")),
                    }
                }
                crate::eval::Lvalue::Prop { target, key } => {
                    engine.prop_unset(target, key)?;
                }
                crate::eval::Lvalue::HashEntry { target, key } => {
                    engine.hash_remove(target, key)?;
                }
                crate::eval::Lvalue::Index { target, index } => {
                    engine.array_set(target, index, Value::Undef)?;
                }
                _ => return Err(syntax(engine, (st.line, st.col), "target cannot be unset")),
            }
        }
        let sep = toker.peek_sig();
        if sep.ttype == TokType::Op(OpSym::Comma) {
            toker.next_sig();
            continue;
        }
        break;
    }
    Ok(StackTok::rvalue(Value::Undef, at.0, at.1))
}

// --- typeinfo ---

fn kw_typeinfo<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let group = expect_group(engine, toker, TokType::ParenGroup, "expected '(tag expr)' after 'typeinfo'")?;
    let mut sub = toker.sub(group.adj_begin, group.adj_end);
    let tag_tok = sub.next_sig();
    if tag_tok.ttype != TokType::Ident {
        return Err(syntax(engine, (tag_tok.line, tag_tok.col), "expected a typeinfo tag"));
    }
    let tag = sub.text(&tag_tok).to_owned();

    // isdeclared inspects the identifier without resolving it.
    if tag == "isdeclared" {
        let ident = sub.next_sig();
        if ident.ttype != TokType::Ident {
            return Err(syntax(engine, (ident.line, ident.col), "expected an identifier"));
        }
        if engine.skip_level > 0 {
            return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
        }
        let name = engine.new_string(sub.text(&ident))?;
        let declared = engine.scopes.var_search(&engine.heap, name, 0).is_some();
        return Ok(StackTok::rvalue(Value::Bool(declared), at.0, at.1));
    }

    let Some(st) = eval_expr(engine, &mut sub, EvalFlags::default())? else {
        return Err(syntax(engine, (tag_tok.line, tag_tok.col), "expected an expression"));
    };
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    let v = st.val;
    let tag_of = v.type_tag(&engine.heap);
    let result = match tag.as_str() {
        "name" => {
            let name: &'static str = tag_of.into();
            engine.new_string(name)?
        }
        "isarray" => Value::Bool(tag_of == TypeTag::Array),
        "isobject" => Value::Bool(tag_of == TypeTag::Object),
        "ishash" => Value::Bool(tag_of == TypeTag::Hash),
        "isstring" => Value::Bool(tag_of == TypeTag::String),
        "isint" => Value::Bool(tag_of == TypeTag::Integer),
        "isdouble" => Value::Bool(tag_of == TypeTag::Double),
        "isnumber" => Value::Bool(matches!(tag_of, TypeTag::Integer | TypeTag::Double)),
        "isbool" => Value::Bool(tag_of == TypeTag::Bool),
        "isfunction" => Value::Bool(tag_of == TypeTag::Function),
        "isexception" => Value::Bool(tag_of == TypeTag::Exception),
        "isbuffer" => Value::Bool(tag_of == TypeTag::Buffer),
        "istuple" => Value::Bool(tag_of == TypeTag::Tuple),
        "isunique" => Value::Bool(tag_of == TypeTag::Unique),
        "isnull" => Value::Bool(tag_of == TypeTag::Null),
        "isundef" => Value::Bool(tag_of == TypeTag::Undefined),
        "isnative" => Value::Bool(tag_of == TypeTag::Native),
        "iscontainer" => Value::Bool(v.is_container(&engine.heap)),
        "hasprototype" => Value::Bool(!engine.proto_of(v).same(Value::Undef)),
        _ => {
            let msg = format!("unknown typeinfo tag '{tag}'");
            return Err(engine.throw(ResultCode::Misuse, &msg));
        }
    };
    Ok(StackTok::rvalue(result, at.0, at.1))
}

// --- pragma ---

fn kw_pragma<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let group = expect_group(engine, toker, TokType::ParenGroup, "expected '(command)' after 'pragma'")?;
    let mut sub = toker.sub(group.adj_begin, group.adj_end);
    let cmd_tok = sub.next_sig();
    if cmd_tok.ttype != TokType::Ident {
        return Err(syntax(engine, (cmd_tok.line, cmd_tok.col), "expected a pragma command"));
    }
    let cmd = sub.text(&cmd_tok).to_owned();
    if engine.skip_level > 0 {
        // Consume the remainder without effect.
        while !matches!(sub.next_sig().ttype, TokType::Eof) {}
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    let result = match cmd.as_str() {
        "sweepInterval" | "vacuumInterval" | "stackTraceLimit" => {
            let old = match cmd.as_str() {
                "sweepInterval" => i64::from(engine.config.sweep_interval),
                "vacuumInterval" => i64::from(engine.config.vacuum_interval),
                _ => engine.config.stacktrace_limit as i64,
            };
            if let Some(st) = eval_expr(engine, &mut sub, EvalFlags::default())? {
                let Some(n) = st.val.coerce_int(&engine.heap) else {
                    return Err(engine.throw(ResultCode::Type, "pragma needs an integer argument"));
                };
                if n < 0 {
                    return Err(engine.throw(ResultCode::Range, "pragma argument must be non-negative"));
                }
                match cmd.as_str() {
                    "sweepInterval" => engine.config.sweep_interval = n as u32,
                    "vacuumInterval" => engine.config.vacuum_interval = n as u32,
                    _ => engine.config.stacktrace_limit = n as usize,
                }
            }
            Value::Int(old)
        }
        "refcount" => {
            let Some(st) = eval_expr(engine, &mut sub, EvalFlags::default())? else {
                return Err(engine.throw(ResultCode::Misuse, "pragma(refcount) needs an expression"));
            };
            match st.val.ref_id() {
                Some(id) => Value::Int(i64::from(engine.heap.refcount(id))),
                None => Value::Int(0),
            }
        }
        "sweep" => Value::Int(engine.sweep() as i64),
        "vacuum" => Value::Int(engine.vacuum() as i64),
        _ => {
            let msg = format!("unknown pragma '{cmd}'");
            return Err(engine.throw(ResultCode::Misuse, &msg));
        }
    };
    Ok(StackTok::rvalue(result, at.0, at.1))
}

// --- class / enum ---

fn kw_class<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let name_tok = toker.next_sig();
    if name_tok.ttype != TokType::Ident || Keyword::lookup(toker.text(&name_tok)).is_some() {
        return Err(syntax(engine, (name_tok.line, name_tok.col), "expected a class name"));
    }
    let name_text = toker.text(&name_tok).to_owned();
    // Optional `extends Base.Path`.
    let mut parent = Value::Undef;
    let peek = toker.peek_sig();
    if peek.ttype == TokType::Ident && toker.text(&peek) == "extends" {
        toker.next_sig();
        let base_tok = toker.next_sig();
        if base_tok.ttype != TokType::Ident {
            return Err(syntax(engine, (base_tok.line, base_tok.col), "expected a base class name"));
        }
        if engine.skip_level == 0 {
            let base_name = engine.new_string(toker.text(&base_tok))?;
            let Some((_, v)) = engine.scopes.var_search(&engine.heap, base_name, 0) else {
                let msg = format!("unknown identifier '{}'", toker.text(&base_tok));
                return Err(engine.throw(ResultCode::UnknownIdentifier, &msg));
            };
            parent = v;
        }
    }
    let body = expect_group(engine, toker, TokType::BraceGroup, "expected '{...}' class body")?;
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    enter_nested(engine)?;
    let result = (|| -> EvalResult<Value> {
        let class_obj = eval_object_literal(engine, toker, &body)?;
        engine.holder_push(class_obj)?;
        if !parent.same(Value::Undef) {
            engine.set_proto(class_obj, parent)?;
        }
        let name_key = engine.new_string(&name_text)?;
        let type_name = engine.new_string(&name_text)?;
        engine.prop_set(class_obj, Engine::<T>::known(KnownStr::TypeName), type_name, PROP_HIDDEN)?;
        engine
            .scopes
            .declare(&mut engine.heap, 0, name_key, class_obj, true)
            .map_err(|code| {
                let msg = format!("'{name_text}' is already declared in this scope");
                engine.throw(code, &msg)
            })?;
        Ok(class_obj)
    })();
    leave_nested(engine);
    result.map(|v| StackTok::rvalue(v, at.0, at.1))
}

fn kw_enum<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>, at: (u32, u32)) -> EvalResult<StackTok> {
    let name_tok = toker.next_sig();
    if name_tok.ttype != TokType::Ident || Keyword::lookup(toker.text(&name_tok)).is_some() {
        return Err(syntax(engine, (name_tok.line, name_tok.col), "expected an enum name"));
    }
    let name_text = toker.text(&name_tok).to_owned();
    let body = expect_group(engine, toker, TokType::BraceGroup, "expected '{...}' enum body")?;
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, at.0, at.1));
    }
    enter_nested(engine)?;
    let result = (|| -> EvalResult<Value> {
        let obj = engine.new_object()?;
        engine.holder_push(obj)?;
        let mut sub = toker.sub(body.adj_begin, body.adj_end);
        let mut count: i64 = 0;
        loop {
            let entry_tok = sub.next_sig();
            match entry_tok.ttype {
                TokType::Eof => break,
                TokType::Ident => {
                    let entry_name = engine.new_string(sub.text(&entry_tok))?;
                    engine.holder_push(entry_name)?;
                    let mut payload = Value::Undef;
                    let peek = sub.peek_sig();
                    if peek.ttype == TokType::Op(OpSym::Colon) {
                        sub.next_sig();
                        let Some(st) = eval_expr(engine, &mut sub, EvalFlags::comma_stops())? else {
                            return Err(syntax(engine, (peek.line, peek.col), "expected an entry value"));
                        };
                        payload = st.val;
                        engine.holder_push(payload)?;
                    }
                    let unique = engine.new_unique(payload)?;
                    engine.holder_push(unique)?;
                    engine.prop_set(obj, entry_name, unique, PROP_CONST)?;
                    // Reverse mapping, hidden: unique -> entry name.
                    engine.prop_set(obj, unique, entry_name, PROP_CONST | PROP_HIDDEN)?;
                    count += 1;
                }
                TokType::Op(OpSym::Comma) => {}
                _ => return Err(syntax(engine, (entry_tok.line, entry_tok.col), "expected an enum entry")),
            }
        }
        engine.prop_set(
            obj,
            Engine::<T>::known(KnownStr::EnumEntryCount),
            Value::Int(count),
            PROP_CONST | PROP_HIDDEN,
        )?;
        // Enums are sealed after construction.
        if let Some(id) = obj.ref_id()
            && let Some(meta) = engine.heap.get_mut(id).meta_mut()
        {
            meta.flags |= CONT_NO_NEW_PROPS | CONT_NO_PROP_SET;
        }
        let name_key = engine.new_string(&name_text)?;
        engine
            .scopes
            .declare(&mut engine.heap, 0, name_key, obj, true)
            .map_err(|code| {
                let msg = format!("'{name_text}' is already declared in this scope");
                engine.throw(code, &msg)
            })?;
        Ok(obj)
    })();
    leave_nested(engine);
    result.map(|v| StackTok::rvalue(v, at.0, at.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_lookup_is_length_filtered() {
        assert_eq!(Keyword::lookup("if"), Some(Keyword::If));
        assert_eq!(Keyword::lookup("foreach"), Some(Keyword::Foreach));
        assert_eq!(Keyword::lookup("undefined"), Some(Keyword::Undefined));
        assert_eq!(Keyword::lookup("iff"), None);
        assert_eq!(Keyword::lookup(""), None);
        assert_eq!(Keyword::lookup("notakeyword"), None);
    }

    #[test]
    fn identifier_validation() {
        assert!(is_legal_identifier("abc"));
        assert!(is_legal_identifier("_x9"));
        assert!(is_legal_identifier("héllo"), "non-ASCII bytes are identifier-valid");
        assert!(!is_legal_identifier("9abc"));
        assert!(!is_legal_identifier("a-b"));
        assert!(!is_legal_identifier(""));
    }

    #[test]
    fn ukwd_shortlist_filters_by_length() {
        let mut ukwds = Ukwds::default();
        ukwds.insert("answer".to_owned(), Value::Int(42));
        assert!(ukwds.contains("answer"));
        assert!(!ukwds.contains("answers"));
        assert_eq!(ukwds.get("answer").and_then(Value::as_int), Some(42));
        assert!(ukwds.get("answe").is_none());
    }
}
