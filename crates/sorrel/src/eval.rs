//! The expression evaluator: a shunting-style driver over the tokenizer and
//! the operator table.
//!
//! Each (sub)expression runs on a fresh pair of stacks. Every value pushed to
//! the value stack is also referenced from the current scope's eval holder,
//! which protects temporaries from sweep and vacuum; the holder is truncated
//! back to its pre-expression length on exit.
//!
//! Parenthesized sub-expressions are evaluated iteratively on an explicit
//! frame stack, so paren nesting is bounded only by memory. Everything else
//! that nests (keyword bodies, literals, calls) recurses under the
//! `max_eval_depth` guard.
//!
//! Short-circuiting works through the engine's skip level: when the left
//! operand of `&&`/`||`/`|||`/`?:`/ternary decides the result, the dead
//! operand is still parsed but every handler yields `undef` with no side
//! effects until the operator completes.

use crate::{
    engine::{DotState, Engine, RawFrame},
    error::{EngineError, EvalError, EvalResult},
    func::{FuncKind, NativeCall, Param, ScriptSrc},
    heap::HeapData,
    intern::KnownStr,
    object::Object,
    ops::{Assoc, OpId, PREC_PRIMARY, Placement, binary_result, find_overload, hash_count, infix_for, prefix_for},
    rc::ResultCode,
    resource::ResourceTracker,
    token::{OpSym, TokType, Token, Tokenizer, unescape},
    value::Value,
};

/// What a value token can be assigned through.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) enum Lvalue {
    #[default]
    None,
    /// A scope variable, by name.
    Var(Value),
    /// A property of a container.
    Prop { target: Value, key: Value },
    /// An array (or tuple) element.
    Index { target: Value, index: i64 },
    /// A hash entry.
    HashEntry { target: Value, key: Value },
    /// `a[] = ...` append.
    Append { target: Value },
}

/// One value-stack token: the value, how to assign through it, and its
/// source position for error reporting.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackTok {
    pub val: Value,
    pub lv: Lvalue,
    pub line: u32,
    pub col: u32,
}

impl StackTok {
    pub fn rvalue(val: Value, line: u32, col: u32) -> Self {
        Self {
            val,
            lv: Lvalue::None,
            line,
            col,
        }
    }
}

/// One operator-stack entry.
#[derive(Debug, Clone, Copy)]
struct OpFrame {
    op: OpId,
    line: u32,
    col: u32,
    /// This operator raised the skip level for its pending operand.
    raised_skip: bool,
    /// For ternaries: the `:` has been consumed.
    saw_colon: bool,
}

/// Flags for one `eval_expr` run.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EvalFlags {
    /// Terminate (with putback) at a top-level comma.
    pub stop_on_comma: bool,
    /// Terminate (with putback) at a top-level `=>` (foreach heads).
    pub stop_on_fat_arrow: bool,
}

impl EvalFlags {
    pub fn comma_stops() -> Self {
        Self {
            stop_on_comma: true,
            stop_on_fat_arrow: false,
        }
    }
}

/// One expression frame: its token source and both stacks.
struct ExprFrame<'s> {
    toker: Tokenizer<'s>,
    vals: Vec<StackTok>,
    ops: Vec<OpFrame>,
    want_operand: bool,
    stop_on_comma: bool,
    stop_on_fat_arrow: bool,
    /// Position of the paren group in the parent, for the result token.
    origin: (u32, u32),
}

impl<'s> ExprFrame<'s> {
    fn new(toker: Tokenizer<'s>, flags: EvalFlags, origin: (u32, u32)) -> Self {
        Self {
            toker,
            vals: Vec::new(),
            ops: Vec::new(),
            want_operand: true,
            stop_on_comma: flags.stop_on_comma,
            stop_on_fat_arrow: flags.stop_on_fat_arrow,
            origin,
        }
    }
}

/// Evaluates one expression from `toker`. Returns `None` for an empty
/// expression (immediate EOX/EOF). The terminating EOX or comma is put back
/// for the caller.
pub(crate) fn eval_expr<'s, T: ResourceTracker>(
    engine: &mut Engine<T>,
    toker: &mut Tokenizer<'s>,
    flags: EvalFlags,
) -> EvalResult<Option<StackTok>> {
    engine.check_alive()?;
    let holder_mark = engine.holder_mark();
    engine.expr_depth += 1;
    let mut frames = vec![ExprFrame::new(toker.clone(), flags, (0, 0))];
    let result = drive(engine, &mut frames);
    engine.expr_depth -= 1;
    // Unwind any skip levels raised by unfinished short-circuit operators.
    for frame in &frames {
        for op in &frame.ops {
            if op.raised_skip {
                engine.skip_level = engine.skip_level.saturating_sub(1);
            }
        }
    }
    if let Some(base) = frames.first() {
        *toker = base.toker.clone();
    }
    match result {
        Ok(v) => {
            // The result must survive holder truncation: give it a driver
            // reference, truncate, then release via unhand (re-probation).
            if let Some(st) = v {
                engine.scopes.vref(&mut engine.heap, st.val).map_err(EvalError::Fatal)?;
                engine.holder_truncate(holder_mark);
                engine.scopes.vunhand(&mut engine.heap, st.val);
                Ok(Some(st))
            } else {
                engine.holder_truncate(holder_mark);
                Ok(None)
            }
        }
        Err(e) => {
            engine.holder_truncate(holder_mark);
            Err(e)
        }
    }
}

/// The frame-stack driver loop.
fn drive<'s, T: ResourceTracker>(
    engine: &mut Engine<T>,
    frames: &mut Vec<ExprFrame<'s>>,
) -> EvalResult<Option<StackTok>> {
    loop {
        engine.check_interrupt()?;
        let is_base = frames.len() == 1;
        let frame = frames.last_mut().expect("frame stack is never empty");
        let tok = frame.toker.next_sig();
        engine.cur_line = tok.line;
        engine.cur_col = tok.col;

        match tok.ttype {
            TokType::Eof => {
                let done = finish_frame(engine, frames)?;
                if let Some(result) = done {
                    return Ok(result);
                }
            }
            TokType::Eox if !is_base => {
                return Err(engine_syntax_error(engine, &tok, "unexpected ';' inside '(...)'"));
            }
            TokType::Eox => {
                frame.toker.putback();
                let done = finish_frame(engine, frames)?;
                if let Some(result) = done {
                    return Ok(result);
                }
            }
            TokType::Err => {
                let msg = frame.toker.err_msg().unwrap_or("tokenization error");
                return Err(engine_syntax_error(engine, &tok, msg));
            }
            TokType::Op(OpSym::Comma) if frame.stop_on_comma => {
                frame.toker.putback();
                let done = finish_frame(engine, frames)?;
                if let Some(result) = done {
                    return Ok(result);
                }
            }
            TokType::Op(OpSym::FatArrow) if frame.stop_on_fat_arrow && !frame.want_operand => {
                frame.toker.putback();
                let done = finish_frame(engine, frames)?;
                if let Some(result) = done {
                    return Ok(result);
                }
            }
            TokType::Op(OpSym::Colon) if !frame.want_operand => {
                ternary_colon(engine, frame, &tok)?;
            }
            // A keyword after a complete operand terminates the expression
            // (this is what lets `if (x) 1 else 2` find its `else`).
            TokType::Ident
                if !frame.want_operand
                    && frame.toker.text(&tok) != "inherits"
                    && crate::keyword::Keyword::lookup(frame.toker.text(&tok)).is_some() =>
            {
                if !is_base {
                    return Err(engine_syntax_error(engine, &tok, "unexpected keyword inside '(...)'"));
                }
                frame.toker.putback();
                let done = finish_frame(engine, frames)?;
                if let Some(result) = done {
                    return Ok(result);
                }
            }
            _ if frame.want_operand => {
                if let Some(new_frame) = read_operand(engine, frame, &tok)? {
                    frames.push(new_frame);
                }
            }
            _ => read_operator(engine, frame, &tok)?,
        }
    }
}

/// Builds a structured syntax-error outcome at a token's position.
fn engine_syntax_error<T: ResourceTracker>(engine: &mut Engine<T>, tok: &Token, msg: &str) -> EvalError {
    engine_syntax_error_at(engine, tok.line, tok.col, msg)
}

fn engine_syntax_error_at<T: ResourceTracker>(engine: &mut Engine<T>, line: u32, col: u32, msg: &str) -> EvalError {
    let mut err = EngineError::default();
    err.set(ResultCode::Syntax, line, col, msg);
    err.script = engine.script.as_ref().map(|s| s.name.to_string());
    EvalError::Engine(Box::new(err))
}

/// Pushes a value token, protecting it in the eval holder.
fn push_operand<T: ResourceTracker>(engine: &mut Engine<T>, frame: &mut ExprFrame<'_>, st: StackTok) -> EvalResult<()> {
    engine.holder_push(st.val)?;
    frame.vals.push(st);
    frame.want_operand = false;
    Ok(())
}

/// Reduces everything left in the top frame. For the base frame returns the
/// final result (as `Some(..)`), for paren frames pushes the result into the
/// parent and returns `None` to keep driving.
fn finish_frame<'s, T: ResourceTracker>(
    engine: &mut Engine<T>,
    frames: &mut Vec<ExprFrame<'s>>,
) -> EvalResult<Option<Option<StackTok>>> {
    let frame = frames.last_mut().expect("frame stack is never empty");
    while !frame.ops.is_empty() {
        reduce_top(engine, frame)?;
    }
    let result = match frame.vals.len() {
        0 => None,
        1 => Some(frame.vals.pop().expect("length checked")),
        _ => {
            let st = frame.vals[1];
            return Err(engine_syntax_error_at(
                engine,
                st.line,
                st.col,
                "unexpected value; missing operator",
            ));
        }
    };
    let origin = frame.origin;
    if frames.len() == 1 {
        return Ok(Some(result));
    }
    // A paren sub-frame: its value becomes an operand in the parent.
    frames.pop();
    let parent = frames.last_mut().expect("parent frame exists");
    let st = result.map_or_else(
        || StackTok::rvalue(Value::Undef, origin.0, origin.1),
        |st| StackTok {
            lv: st.lv,
            line: origin.0,
            col: origin.1,
            val: st.val,
        },
    );
    engine.holder_push(st.val)?;
    parent.vals.push(st);
    parent.want_operand = false;
    Ok(None)
}

/// Handles a token in operand position. Returns a new frame to push for
/// parenthesized sub-expressions.
fn read_operand<'s, T: ResourceTracker>(
    engine: &mut Engine<T>,
    frame: &mut ExprFrame<'s>,
    tok: &Token,
) -> EvalResult<Option<ExprFrame<'s>>> {
    match tok.ttype {
        TokType::LitIntDec | TokType::LitIntHex | TokType::LitIntOct | TokType::LitIntBin => {
            let v = parse_int(engine, &frame.toker, tok)?;
            push_operand(engine, frame, StackTok::rvalue(v, tok.line, tok.col))?;
            Ok(None)
        }
        TokType::LitDouble => {
            let text = frame.toker.text(tok);
            let Ok(d) = text.parse::<f64>() else {
                return Err(engine_syntax_error(engine, tok, "malformed double literal"));
            };
            push_operand(engine, frame, StackTok::rvalue(Value::Double(d), tok.line, tok.col))?;
            Ok(None)
        }
        TokType::SqString | TokType::DqString => {
            let raw = frame.toker.inner(tok);
            let v = if raw.contains('\\') {
                let mut buf = String::with_capacity(raw.len());
                if let Err(msg) = unescape(raw, &mut buf) {
                    return Err(engine_syntax_error(engine, tok, msg));
                }
                engine.new_string(&buf)?
            } else {
                engine.new_string(raw)?
            };
            push_operand(engine, frame, StackTok::rvalue(v, tok.line, tok.col))?;
            Ok(None)
        }
        TokType::Heredoc => {
            let v = engine.new_string(frame.toker.inner(tok))?;
            push_operand(engine, frame, StackTok::rvalue(v, tok.line, tok.col))?;
            Ok(None)
        }
        TokType::Ident => {
            // After a property-access operator the identifier is a key.
            if frame.ops.last().is_some_and(|f| f.op.is_property_access()) {
                let key = engine.new_string(frame.toker.text(tok))?;
                push_operand(engine, frame, StackTok::rvalue(key, tok.line, tok.col))?;
                return Ok(None);
            }
            let text = frame.toker.text(tok);
            if let Some(kw) = crate::keyword::Keyword::lookup(text) {
                let st = crate::keyword::dispatch(engine, &mut frame.toker, kw, tok)?;
                push_operand(engine, frame, st)?;
                return Ok(None);
            }
            if let Some(v) = crate::keyword::ukwd_lookup(engine, text) {
                push_operand(engine, frame, StackTok::rvalue(v, tok.line, tok.col))?;
                return Ok(None);
            }
            let name = engine.new_string(text)?;
            let found = engine
                .scopes
                .var_search(&engine.heap, name, engine.config.var_lookup_depth);
            match found {
                Some((_, v)) => {
                    push_operand(
                        engine,
                        frame,
                        StackTok {
                            val: v,
                            lv: Lvalue::Var(name),
                            line: tok.line,
                            col: tok.col,
                        },
                    )?;
                    Ok(None)
                }
                None if engine.skip_level > 0 => {
                    push_operand(engine, frame, StackTok::rvalue(Value::Undef, tok.line, tok.col))?;
                    Ok(None)
                }
                None => {
                    let msg = format!("unknown identifier '{text}'");
                    Err(engine.throw(ResultCode::UnknownIdentifier, &msg))
                }
            }
        }
        TokType::ParenGroup => {
            // Iterative sub-expression: push a frame over the inner range.
            let sub = frame.toker.sub(tok.adj_begin, tok.adj_end);
            Ok(Some(ExprFrame::new(sub, EvalFlags::default(), (tok.line, tok.col))))
        }
        TokType::BracketGroup => {
            let v = eval_array_literal(engine, &frame.toker, tok)?;
            push_operand(engine, frame, StackTok::rvalue(v, tok.line, tok.col))?;
            Ok(None)
        }
        TokType::BraceGroup => {
            let v = eval_object_literal(engine, &frame.toker, tok)?;
            push_operand(engine, frame, StackTok::rvalue(v, tok.line, tok.col))?;
            Ok(None)
        }
        TokType::Op(sym) => {
            let Some(op) = prefix_for(sym) else {
                return Err(engine_syntax_error(engine, tok, "expected a value"));
            };
            frame.ops.push(OpFrame {
                op,
                line: tok.line,
                col: tok.col,
                raised_skip: false,
                saw_colon: false,
            });
            Ok(None)
        }
        _ => Err(engine_syntax_error(engine, tok, "expected a value")),
    }
}

/// Handles a token in operator position.
fn read_operator<T: ResourceTracker>(engine: &mut Engine<T>, frame: &mut ExprFrame<'_>, tok: &Token) -> EvalResult<()> {
    match tok.ttype {
        TokType::ParenGroup => {
            // Call: reduce pending primaries, then invoke the callee.
            reduce_down_to(engine, frame, PREC_PRIMARY, Assoc::Left)?;
            let callee = frame.vals.pop().ok_or_else(|| {
                engine_syntax_error(engine, tok, "call of nothing")
            })?;
            let result = eval_call(engine, frame, callee, tok)?;
            frame.vals.push(result);
            engine.holder_push(result.val)?;
            frame.want_operand = false;
            Ok(())
        }
        TokType::BracketGroup => {
            reduce_down_to(engine, frame, PREC_PRIMARY, Assoc::Left)?;
            let target = frame.vals.pop().ok_or_else(|| {
                engine_syntax_error(engine, tok, "subscript of nothing")
            })?;
            let result = eval_index(engine, frame, target, tok)?;
            frame.vals.push(result);
            engine.holder_push(result.val)?;
            frame.want_operand = false;
            Ok(())
        }
        TokType::Ident if frame.toker.text(tok) == "inherits" => {
            push_infix(engine, frame, OpId::Inherits, tok)
        }
        TokType::Op(sym) => {
            let Some(op) = infix_for(sym) else {
                return Err(engine_syntax_error(engine, tok, "unexpected operator"));
            };
            match op.spec().placement {
                Placement::Postfix => {
                    // Postfix operators apply immediately to the top value.
                    reduce_down_to(engine, frame, PREC_PRIMARY, Assoc::Left)?;
                    let operand = frame
                        .vals
                        .pop()
                        .ok_or_else(|| engine_syntax_error(engine, tok, "postfix operator without operand"))?;
                    let result = apply_postfix(engine, op, operand, tok)?;
                    engine.holder_push(result.val)?;
                    frame.vals.push(result);
                    Ok(())
                }
                _ => push_infix(engine, frame, op, tok),
            }
        }
        _ => Err(engine_syntax_error(engine, tok, "expected an operator")),
    }
}

/// Pushes an infix operator after the standard precedence reduction, raising
/// the skip level for short-circuit right operands.
fn push_infix<T: ResourceTracker>(
    engine: &mut Engine<T>,
    frame: &mut ExprFrame<'_>,
    op: OpId,
    tok: &Token,
) -> EvalResult<()> {
    let spec = op.spec();
    reduce_down_to(engine, frame, spec.prec, spec.assoc)?;
    let mut raised = false;
    if engine.skip_level == 0 {
        let lhs = frame
            .vals
            .last()
            .ok_or_else(|| engine_syntax_error(engine, tok, "operator without left operand"))?;
        let skip_rhs = match op {
            OpId::And => !lhs.val.truthy(&engine.heap),
            OpId::Or => lhs.val.truthy(&engine.heap),
            OpId::Elvis => lhs.val.truthy(&engine.heap),
            OpId::OrElse => !matches!(lhs.val, Value::Undef | Value::Null),
            OpId::TernaryIf => !lhs.val.truthy(&engine.heap),
            _ => false,
        };
        if skip_rhs {
            engine.skip_level += 1;
            raised = true;
        }
    }
    frame.ops.push(OpFrame {
        op,
        line: tok.line,
        col: tok.col,
        raised_skip: raised,
        saw_colon: false,
    });
    frame.want_operand = true;
    Ok(())
}

/// Handles the `:` of a pending ternary.
fn ternary_colon<T: ResourceTracker>(engine: &mut Engine<T>, frame: &mut ExprFrame<'_>, tok: &Token) -> EvalResult<()> {
    // Reduce the then-arm completely (everything binding tighter than `?`).
    while let Some(top) = frame.ops.last() {
        if top.op == OpId::TernaryIf && !top.saw_colon {
            break;
        }
        reduce_top(engine, frame)?;
    }
    let Some(top) = frame.ops.last_mut() else {
        return Err(engine_syntax_error(engine, tok, "':' without matching '?'"));
    };
    if top.op != OpId::TernaryIf || top.saw_colon {
        return Err(engine_syntax_error(engine, tok, "':' without matching '?'"));
    }
    top.saw_colon = true;
    // Swap which arm is dead: the then-arm state toggles for the else-arm.
    if top.raised_skip {
        top.raised_skip = false;
        engine.skip_level = engine.skip_level.saturating_sub(1);
    } else if engine.skip_level == 0 {
        top.raised_skip = true;
        engine.skip_level += 1;
    }
    frame.want_operand = true;
    Ok(())
}

/// Reduces operators while the top of the stack binds at least as tightly as
/// an incoming operator of `prec`/`assoc`.
fn reduce_down_to<T: ResourceTracker>(
    engine: &mut Engine<T>,
    frame: &mut ExprFrame<'_>,
    prec: u8,
    assoc: Assoc,
) -> EvalResult<()> {
    while let Some(top) = frame.ops.last() {
        let top_spec = top.op.spec();
        // An unfinished ternary never reduces from the reduction loop.
        if top.op == OpId::TernaryIf && !top.saw_colon {
            break;
        }
        let reduce = match assoc {
            Assoc::Left => top_spec.prec >= prec,
            Assoc::Right => top_spec.prec > prec,
        };
        if !reduce {
            break;
        }
        reduce_top(engine, frame)?;
    }
    Ok(())
}

/// Reduces the topmost operator against its operands.
fn reduce_top<T: ResourceTracker>(engine: &mut Engine<T>, frame: &mut ExprFrame<'_>) -> EvalResult<()> {
    let op_frame = frame.ops.pop().expect("reduce_top requires an operator");
    let spec = op_frame.op.spec();
    engine.check_interrupt()?;

    // Lower this operator's own skip contribution before computing.
    if op_frame.raised_skip {
        engine.skip_level = engine.skip_level.saturating_sub(1);
    }

    match op_frame.op {
        OpId::TernaryIf => {
            if !op_frame.saw_colon {
                return Err(engine_syntax_error_at(engine, op_frame.line, op_frame.col, "'?' without ':'"));
            }
            let else_v = pop_operand(engine, frame, &op_frame)?;
            let then_v = pop_operand(engine, frame, &op_frame)?;
            let cond = pop_operand(engine, frame, &op_frame)?;
            let result = if engine.skip_level > 0 {
                Value::Undef
            } else if cond.val.truthy(&engine.heap) {
                then_v.val
            } else {
                else_v.val
            };
            push_result(engine, frame, StackTok::rvalue(result, op_frame.line, op_frame.col))
        }
        _ if spec.arity == 1 => {
            let operand = pop_operand(engine, frame, &op_frame)?;
            let result = if engine.skip_level > 0 {
                StackTok::rvalue(Value::Undef, op_frame.line, op_frame.col)
            } else {
                match op_frame.op {
                    OpId::IncrPre | OpId::DecrPre => apply_incr_decr(engine, op_frame.op, operand, true)?,
                    _ => StackTok::rvalue(
                        crate::ops::prefix_result(engine, op_frame.op, operand.val)?,
                        op_frame.line,
                        op_frame.col,
                    ),
                }
            };
            push_result(engine, frame, result)
        }
        _ => {
            let rhs = pop_operand(engine, frame, &op_frame)?;
            let lhs = pop_operand(engine, frame, &op_frame)?;
            let result = apply_binary(engine, &op_frame, lhs, rhs)?;
            push_result(engine, frame, result)
        }
    }
}

fn pop_operand<T: ResourceTracker>(
    engine: &mut Engine<T>,
    frame: &mut ExprFrame<'_>,
    op_frame: &OpFrame,
) -> EvalResult<StackTok> {
    frame
        .vals
        .pop()
        .ok_or_else(|| engine_syntax_error_at(engine, op_frame.line, op_frame.col, "operator is missing an operand"))
}

fn push_result<T: ResourceTracker>(engine: &mut Engine<T>, frame: &mut ExprFrame<'_>, st: StackTok) -> EvalResult<()> {
    engine.holder_push(st.val)?;
    frame.vals.push(st);
    Ok(())
}

/// Applies a (non-assignment) binary operator, or routes to assignment and
/// property access, honoring skip mode and overloads.
fn apply_binary<T: ResourceTracker>(
    engine: &mut Engine<T>,
    op_frame: &OpFrame,
    lhs: StackTok,
    rhs: StackTok,
) -> EvalResult<StackTok> {
    let op = op_frame.op;
    let (line, col) = (op_frame.line, op_frame.col);
    engine.cur_line = line;
    engine.cur_col = col;
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, line, col));
    }
    match op {
        OpId::Assign
        | OpId::AddAssign
        | OpId::SubAssign
        | OpId::MulAssign
        | OpId::DivAssign
        | OpId::ModAssign
        | OpId::ShlAssign
        | OpId::ShrAssign
        | OpId::AndAssign
        | OpId::OrAssign
        | OpId::XorAssign => apply_assign(engine, op, lhs, rhs, line, col),
        OpId::Dot | OpId::DotSafe | OpId::Arrow | OpId::ProtoLookup => {
            apply_property_access(engine, op, lhs, rhs, line, col)
        }
        _ => {
            if let Some(method) = find_overload(engine, op, lhs.val) {
                let raw = call_function(engine, method, lhs.val, &[rhs.val])?;
                let v = finish_overload(engine, op, raw);
                return Ok(StackTok::rvalue(v, line, col));
            }
            let v = binary_result(engine, op, lhs.val, rhs.val)?;
            Ok(StackTok::rvalue(v, line, col))
        }
    }
}

/// Shapes an overload result. Every comparison operator consults its own
/// method, so its answer is taken as the boolean directly; `!~` is the one
/// derived form (the negation of the `=~` method's answer).
fn finish_overload<T: ResourceTracker>(engine: &Engine<T>, op: OpId, raw: Value) -> Value {
    match op {
        OpId::CmpEq | OpId::CmpNeq | OpId::CmpLt | OpId::CmpLe | OpId::CmpGt | OpId::CmpGe | OpId::Contains => {
            Value::Bool(raw.truthy(&engine.heap))
        }
        OpId::NotContains => Value::Bool(!raw.truthy(&engine.heap)),
        _ => raw,
    }
}

/// `.`, `?.`, `->`, `::`: resolves a property and publishes the dot-op state.
fn apply_property_access<T: ResourceTracker>(
    engine: &mut Engine<T>,
    op: OpId,
    lhs: StackTok,
    rhs: StackTok,
    line: u32,
    col: u32,
) -> EvalResult<StackTok> {
    let target = lhs.val;
    let key = rhs.val;
    if matches!(target, Value::Undef | Value::Null) {
        if op == OpId::DotSafe {
            return Ok(StackTok::rvalue(Value::Undef, line, col));
        }
        return Err(engine.throw(ResultCode::Type, "property access on undefined/null"));
    }
    // Integer keys on lists are element access.
    let is_list = matches!(
        target.ref_id().map(|id| engine.heap.get(id)),
        Some(HeapData::Array(_) | HeapData::Tuple(_))
    );
    if is_list && let Value::Int(i) = key {
        let v = engine.array_get(target, i)?;
        return Ok(StackTok {
            val: v,
            lv: Lvalue::Index { target, index: i },
            line,
            col,
        });
    }
    let resolved = match op {
        OpId::Arrow => engine.prop_get_own(target, key),
        OpId::ProtoLookup => {
            let proto = engine.proto_of(target);
            if proto.same(Value::Undef) {
                None
            } else {
                engine.prop_get(proto, key)
            }
        }
        _ => engine.prop_get(target, key),
    }
    .unwrap_or(Value::Undef);
    engine.dot_state = Some(DotState {
        self_val: target,
        lhs: resolved,
        key,
    });
    Ok(StackTok {
        val: resolved,
        lv: Lvalue::Prop { target, key },
        line,
        col,
    })
}

/// Assignment through an lvalue, including the compound forms.
fn apply_assign<T: ResourceTracker>(
    engine: &mut Engine<T>,
    op: OpId,
    lhs: StackTok,
    rhs: StackTok,
    line: u32,
    col: u32,
) -> EvalResult<StackTok> {
    let value = if op == OpId::Assign {
        rhs.val
    } else {
        let base = match op {
            OpId::AddAssign => OpId::Add,
            OpId::SubAssign => OpId::Sub,
            OpId::MulAssign => OpId::Mul,
            OpId::DivAssign => OpId::Div,
            OpId::ModAssign => OpId::Mod,
            OpId::ShlAssign => OpId::ShiftLeft,
            OpId::ShrAssign => OpId::ShiftRight,
            OpId::AndAssign => OpId::BitAnd,
            OpId::OrAssign => OpId::BitOr,
            OpId::XorAssign => OpId::BitXor,
            _ => unreachable!("assignment family checked by caller"),
        };
        binary_result(engine, base, lhs.val, rhs.val)?
    };
    store_lvalue(engine, lhs.lv, value)?;
    Ok(StackTok::rvalue(value, line, col))
}

/// Writes `value` through an lvalue.
pub(crate) fn store_lvalue<T: ResourceTracker>(engine: &mut Engine<T>, lv: Lvalue, value: Value) -> EvalResult<()> {
    match lv {
        Lvalue::Var(name) => match engine.scopes.var_assign(&mut engine.heap, name, value) {
            Ok(()) => Ok(()),
            Err(ResultCode::NotFound) => {
                let msg = format!(
                    "assignment to unknown identifier '{}'",
                    engine.display_string(name)
                );
                Err(engine.throw(ResultCode::UnknownIdentifier, &msg))
            }
            Err(ResultCode::ConstViolation) => Err(engine.throw(ResultCode::ConstViolation, "assignment to const")),
            Err(code) => Err(engine.throw(code, "assignment refused")),
        },
        Lvalue::Prop { target, key } => engine.prop_set(target, key, value, 0),
        Lvalue::Index { target, index } => engine.array_set(target, index, value),
        Lvalue::HashEntry { target, key } => engine.hash_insert(target, key, value),
        Lvalue::Append { target } => engine.array_push(target, value),
        Lvalue::None => Err(engine.throw(ResultCode::Syntax, "invalid assignment target")),
    }
}

/// `++`/`--`, prefix and postfix.
fn apply_incr_decr<T: ResourceTracker>(
    engine: &mut Engine<T>,
    op: OpId,
    operand: StackTok,
    prefix: bool,
) -> EvalResult<StackTok> {
    if matches!(operand.lv, Lvalue::None) {
        return Err(engine.throw(ResultCode::Syntax, "'++'/'--' need an assignable operand"));
    }
    let delta = if matches!(op, OpId::IncrPre | OpId::IncrPost) { 1 } else { -1 };
    let old = operand.val;
    let new = match old {
        Value::Int(i) => Value::Int(i.wrapping_add(delta)),
        Value::Double(d) => Value::Double(d + delta as f64),
        Value::Undef => Value::Int(delta),
        _ => match old.coerce_int(&engine.heap) {
            Some(i) => Value::Int(i.wrapping_add(delta)),
            None => return Err(engine.throw(ResultCode::Type, "'++'/'--' need a numeric operand")),
        },
    };
    store_lvalue(engine, operand.lv, new)?;
    Ok(StackTok::rvalue(
        if prefix { new } else { old },
        operand.line,
        operand.col,
    ))
}

fn apply_postfix<T: ResourceTracker>(
    engine: &mut Engine<T>,
    op: OpId,
    operand: StackTok,
    tok: &Token,
) -> EvalResult<StackTok> {
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, tok.line, tok.col));
    }
    match op {
        OpId::IncrPost | OpId::DecrPost => apply_incr_decr(engine, op, operand, false),
        OpId::HashCount => Ok(StackTok::rvalue(hash_count(engine, operand.val)?, tok.line, tok.col)),
        _ => Err(engine_syntax_error(engine, tok, "unexpected operator")),
    }
}

// --- Literals ---

fn parse_int<T: ResourceTracker>(engine: &mut Engine<T>, toker: &Tokenizer<'_>, tok: &Token) -> EvalResult<Value> {
    let radix = match tok.ttype {
        TokType::LitIntHex => 16,
        TokType::LitIntOct => 8,
        TokType::LitIntBin => 2,
        _ => 10,
    };
    let digits = toker.inner(tok);
    match i64::from_str_radix(digits, radix) {
        Ok(i) => Ok(Value::Int(i)),
        Err(_) => Err(engine.throw(ResultCode::Range, "integer literal out of range")),
    }
}

/// `[a, b, c]` in operand position.
fn eval_array_literal<T: ResourceTracker>(
    engine: &mut Engine<T>,
    toker: &Tokenizer<'_>,
    tok: &Token,
) -> EvalResult<Value> {
    if engine.skip_level > 0 {
        return Ok(Value::Undef);
    }
    enter_nested(engine)?;
    let result = (|| {
        let mut items = Vec::new();
        let mut sub = toker.sub(tok.adj_begin, tok.adj_end);
        loop {
            let Some(st) = eval_expr(engine, &mut sub, EvalFlags::comma_stops())? else {
                break;
            };
            items.push(st.val);
            engine.holder_push(st.val)?;
            let next = sub.next_sig();
            match next.ttype {
                TokType::Op(OpSym::Comma) => {}
                TokType::Eof => break,
                _ => return Err(engine_syntax_error(engine, &next, "expected ',' in array literal")),
            }
        }
        engine.new_array(items)
    })();
    leave_nested(engine);
    result
}

/// `{k: v, ...}` in operand position (also the body form of `class`).
pub(crate) fn eval_object_literal<T: ResourceTracker>(
    engine: &mut Engine<T>,
    toker: &Tokenizer<'_>,
    tok: &Token,
) -> EvalResult<Value> {
    if engine.skip_level > 0 {
        return Ok(Value::Undef);
    }
    enter_nested(engine)?;
    let result = (|| {
        let obj = engine.new_object()?;
        engine.holder_push(obj)?;
        let mut sub = toker.sub(tok.adj_begin, tok.adj_end);
        loop {
            let key_tok = sub.next_sig();
            let key = match key_tok.ttype {
                TokType::Eof => break,
                TokType::Ident => engine.new_string(sub.text(&key_tok))?,
                TokType::SqString | TokType::DqString => {
                    let raw = sub.inner(&key_tok);
                    let mut buf = String::with_capacity(raw.len());
                    if let Err(msg) = unescape(raw, &mut buf) {
                        return Err(engine_syntax_error(engine, &key_tok, msg));
                    }
                    engine.new_string(&buf)?
                }
                TokType::LitIntDec | TokType::LitIntHex | TokType::LitIntOct | TokType::LitIntBin => {
                    parse_int(engine, &sub, &key_tok)?
                }
                _ => return Err(engine_syntax_error(engine, &key_tok, "expected a property key")),
            };
            engine.holder_push(key)?;
            let colon = sub.next_sig();
            if colon.ttype != TokType::Op(OpSym::Colon) {
                return Err(engine_syntax_error(engine, &colon, "expected ':' in object literal"));
            }
            let Some(val) = eval_expr(engine, &mut sub, EvalFlags::comma_stops())? else {
                return Err(engine_syntax_error(engine, &colon, "expected a property value"));
            };
            engine.holder_push(val.val)?;
            engine.prop_set(obj, key, val.val, 0)?;
            let next = sub.next_sig();
            match next.ttype {
                TokType::Op(OpSym::Comma) => {}
                TokType::Eof => break,
                _ => return Err(engine_syntax_error(engine, &next, "expected ',' in object literal")),
            }
        }
        Ok(obj)
    })();
    leave_nested(engine);
    result
}

// --- Calls and subscripts ---

/// Evaluates `callee(args...)`.
fn eval_call<T: ResourceTracker>(
    engine: &mut Engine<T>,
    frame: &mut ExprFrame<'_>,
    callee: StackTok,
    group: &Token,
) -> EvalResult<StackTok> {
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, group.line, group.col));
    }
    enter_nested(engine)?;
    let result = (|| {
        // Arguments, comma-separated.
        let mut args = Vec::new();
        let mut sub = frame.toker.sub(group.adj_begin, group.adj_end);
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
                _ => return Err(engine_syntax_error(engine, &next, "expected ',' in argument list")),
            }
        }
        // `this`: the dot-op target for property calls. A parenthesized
        // callee loses its lvalue, so fall back to the published dot-op
        // state when it still names this callee; otherwise the function
        // itself is its own `this`.
        let this = match callee.lv {
            Lvalue::Prop { target, .. } | Lvalue::HashEntry { target, .. } | Lvalue::Index { target, .. } => target,
            _ => match engine.dot_state {
                Some(ds) if ds.lhs.same(callee.val) => ds.self_val,
                _ => callee.val,
            },
        };
        // The state is consumed by the call that binds through it.
        engine.dot_state = None;
        let v = call_function(engine, callee.val, this, &args)?;
        Ok(StackTok::rvalue(v, group.line, group.col))
    })();
    leave_nested(engine);
    result
}

/// Evaluates `target[index]` (or `target[]` as an append lvalue).
fn eval_index<T: ResourceTracker>(
    engine: &mut Engine<T>,
    frame: &mut ExprFrame<'_>,
    target: StackTok,
    group: &Token,
) -> EvalResult<StackTok> {
    if engine.skip_level > 0 {
        return Ok(StackTok::rvalue(Value::Undef, group.line, group.col));
    }
    if group.adj_begin >= group.adj_end {
        // `a[]`: assignable append slot.
        return Ok(StackTok {
            val: Value::Undef,
            lv: Lvalue::Append { target: target.val },
            line: group.line,
            col: group.col,
        });
    }
    enter_nested(engine)?;
    let result = (|| {
        let mut sub = frame.toker.sub(group.adj_begin, group.adj_end);
        let Some(key_st) = eval_expr(engine, &mut sub, EvalFlags::default())? else {
            return Err(engine_syntax_error(engine, group, "empty subscript"));
        };
        let key = key_st.val;

        #[derive(Clone, Copy, PartialEq)]
        enum Shape {
            List,
            Hash,
            Str,
            Other,
        }
        let shape = match target.val {
            Value::Static(_) => Shape::Str,
            _ => match target.val.ref_id().map(|id| engine.heap.get(id)) {
                Some(HeapData::Array(_) | HeapData::Tuple(_)) => Shape::List,
                Some(HeapData::Hash(_)) => Shape::Hash,
                Some(HeapData::Str(_)) => Shape::Str,
                _ => Shape::Other,
            },
        };
        match (shape, key) {
            (Shape::List, Value::Int(i)) => {
                let v = engine.array_get(target.val, i)?;
                Ok(StackTok {
                    val: v,
                    lv: Lvalue::Index {
                        target: target.val,
                        index: i,
                    },
                    line: group.line,
                    col: group.col,
                })
            }
            (Shape::Hash, _) => {
                let v = engine.hash_search(target.val, key).unwrap_or(Value::Undef);
                engine.dot_state = Some(DotState {
                    self_val: target.val,
                    lhs: v,
                    key,
                });
                Ok(StackTok {
                    val: v,
                    lv: Lvalue::HashEntry {
                        target: target.val,
                        key,
                    },
                    line: group.line,
                    col: group.col,
                })
            }
            (Shape::Str, Value::Int(i)) => {
                let ch = target
                    .val
                    .as_str(&engine.heap)
                    .and_then(|s| if i >= 0 { s.chars().nth(i as usize) } else { None });
                match ch {
                    Some(c) => {
                        let mut buf = [0u8; 4];
                        let v = engine.new_string(c.encode_utf8(&mut buf))?;
                        Ok(StackTok::rvalue(v, group.line, group.col))
                    }
                    None => Err(engine.throw(ResultCode::Range, "string index out of range")),
                }
            }
            _ => {
                let v = engine.prop_get(target.val, key).unwrap_or(Value::Undef);
                engine.dot_state = Some(DotState {
                    self_val: target.val,
                    lhs: v,
                    key,
                });
                Ok(StackTok {
                    val: v,
                    lv: Lvalue::Prop {
                        target: target.val,
                        key,
                    },
                    line: group.line,
                    col: group.col,
                })
            }
        }
    })();
    leave_nested(engine);
    result
}

// --- Function invocation ---

/// Invokes any function value with `this` and arguments. Each argument gets
/// an engine-level reference for the duration, released via unhand.
pub(crate) fn call_function<T: ResourceTracker>(
    engine: &mut Engine<T>,
    fval: Value,
    this: Value,
    args: &[Value],
) -> EvalResult<Value> {
    engine.check_interrupt()?;
    let Some(id) = fval.ref_id() else {
        return Err(engine.throw(ResultCode::CallOfNonFunction, "call of a non-function value"));
    };
    let kind_probe = match engine.heap.get(id) {
        HeapData::Function(f) => match &f.kind {
            FuncKind::Core(c) => Ok(KindProbe::Core(*c)),
            FuncKind::Native(i) => Ok(KindProbe::Native(*i)),
            FuncKind::Script(_) => Ok(KindProbe::Script),
        },
        _ => Err(()),
    };
    let Ok(probe) = kind_probe else {
        return Err(engine.throw(ResultCode::CallOfNonFunction, "call of a non-function value"));
    };
    for arg in args {
        engine.scopes.vref(&mut engine.heap, *arg).map_err(EvalError::Fatal)?;
    }
    let result = match probe {
        KindProbe::Core(core) => crate::proto::call_core(engine, core, this, args),
        KindProbe::Native(index) => call_native(engine, index, this, args),
        KindProbe::Script => call_script(engine, id, this, args),
    };
    for arg in args {
        engine.scopes.vunhand(&mut engine.heap, *arg);
    }
    result
}

enum KindProbe {
    Core(crate::func::CoreFn),
    Native(u32),
    Script,
}

fn call_native<T: ResourceTracker>(engine: &mut Engine<T>, index: u32, this: Value, args: &[Value]) -> EvalResult<Value> {
    let hook = std::rc::Rc::clone(&engine.natives[index as usize].hook);
    let call = NativeCall {
        this: engine.export_value(this),
        args: args.iter().map(|a| engine.export_value(*a)).collect(),
    };
    match hook(&call) {
        Ok(obj) => engine.import_object(&obj),
        Err(exc) => {
            let code = exc.code;
            let message = exc.message.clone();
            Err(engine.throw(code, &message))
        }
    }
}

fn call_script<T: ResourceTracker>(
    engine: &mut Engine<T>,
    func_id: crate::heap::HeapId,
    this: Value,
    args: &[Value],
) -> EvalResult<Value> {
    if engine.call_depth as usize >= engine.config.max_call_depth {
        return Err(engine.throw(ResultCode::Range, "script call depth exceeded"));
    }
    // Snapshot what we need from the function payload; the value stays alive
    // through the caller's holder reference.
    let (src, name, params, body, using): (std::rc::Rc<ScriptSrc>, Value, Vec<Param>, (usize, usize), Vec<(Value, Value)>) = {
        let HeapData::Function(f) = engine.heap.get(func_id) else {
            unreachable!("probed as script function");
        };
        let FuncKind::Script(s) = &f.kind else {
            unreachable!("probed as script function");
        };
        (
            std::rc::Rc::clone(&s.src),
            s.name,
            s.params.clone(),
            s.body,
            s.using.clone(),
        )
    };

    engine.metrics.script_calls += 1;
    engine.call_depth += 1;
    let name_string = name.as_str(&engine.heap).map(str::to_owned);
    engine.tracer.on_call(name_string.as_deref(), engine.call_depth as usize);

    let trace_pushed = engine.config.stacktrace_limit > 0 && engine.stack_frames.len() < engine.config.stacktrace_limit;
    if trace_pushed {
        engine.stack_frames.push(RawFrame {
            script: std::rc::Rc::clone(&src.name),
            line: engine.cur_line,
            col: engine.cur_col,
        });
    }
    let prev_script = engine.script.replace(std::rc::Rc::clone(&src));

    engine.push_scope();
    let outcome = (|| -> EvalResult<Value> {
        // Parameters: positional args, then defaults, then undef.
        for (i, param) in params.iter().enumerate() {
            let value = match args.get(i) {
                Some(v) => *v,
                None => match param.default {
                    Some((begin, end)) => {
                        let mut sub = Tokenizer::new(&src.text).sub(begin, end);
                        match eval_expr(engine, &mut sub, EvalFlags::default())? {
                            Some(st) => st.val,
                            None => Value::Undef,
                        }
                    }
                    None => Value::Undef,
                },
            };
            engine
                .scopes
                .declare(&mut engine.heap, 0, param.name, value, false)
                .map_err(|code| engine.throw(code, "duplicate parameter name"))?;
        }
        // this / argv / own name / using captures.
        let this_key = Engine::<T>::known(KnownStr::This);
        engine
            .scopes
            .declare(&mut engine.heap, 0, this_key, this, true)
            .map_err(|code| engine.throw(code, "cannot bind 'this'"))?;
        let argv = engine.new_array(args.to_vec())?;
        let argv_key = Engine::<T>::known(KnownStr::Argv);
        engine
            .scopes
            .declare(&mut engine.heap, 0, argv_key, argv, true)
            .map_err(|code| engine.throw(code, "cannot bind 'argv'"))?;
        if !name.same(Value::Undef) {
            // A function's name resolves to itself inside the body.
            let _ = engine
                .scopes
                .declare(&mut engine.heap, 0, name, Value::Ref(func_id), true);
        }
        for (k, v) in &using {
            engine
                .scopes
                .declare(&mut engine.heap, 0, *k, *v, false)
                .map_err(|code| engine.throw(code, "duplicate 'using' capture"))?;
        }

        let mut body_toker = Tokenizer::new(&src.text).sub(body.0, body.1);
        eval_statements(engine, &mut body_toker)
    })();

    let result = match outcome {
        Ok(v) => {
            engine.pop_scope(&[v]);
            Ok(v)
        }
        Err(EvalError::Return(v)) => {
            engine.pop_scope(&[v]);
            // Release the reference the `return` keyword added at throw time.
            engine.scopes.vunhand(&mut engine.heap, v);
            Ok(v)
        }
        Err(other) => {
            engine.pop_scope_propagating(&other);
            Err(other)
        }
    };

    engine.script = prev_script;
    if trace_pushed {
        engine.stack_frames.pop();
    }
    engine.tracer.on_return(engine.call_depth as usize);
    engine.call_depth -= 1;
    result
}

// --- Statement sequences ---

/// Evaluates a `;`-separated statement sequence to exhaustion, yielding the
/// value of the final non-terminated expression.
pub(crate) fn eval_statements<T: ResourceTracker>(engine: &mut Engine<T>, toker: &mut Tokenizer<'_>) -> EvalResult<Value> {
    let holder_mark = engine.holder_mark();
    let mut result = Value::Undef;
    let mut terminated = true;
    loop {
        engine.dot_state = None;
        let tok = toker.peek_sig();
        match tok.ttype {
            TokType::Eof => break,
            TokType::Eox => {
                toker.next_sig();
                terminated = true;
                continue;
            }
            _ => {}
        }
        match eval_expr(engine, toker, EvalFlags::default())? {
            Some(st) => {
                // Replace the held candidate with the new statement value.
                engine.holder_truncate(holder_mark);
                engine.holder_push(st.val)?;
                result = st.val;
                terminated = false;
            }
            None => {
                terminated = true;
            }
        }
        let next = toker.peek_sig();
        if next.ttype == TokType::Eox {
            toker.next_sig();
            terminated = true;
        }
    }
    let out = if terminated { Value::Undef } else { result };
    // Keep the result alive across the truncation.
    engine.scopes.vref(&mut engine.heap, out).map_err(EvalError::Fatal)?;
    engine.holder_truncate(holder_mark);
    engine.scopes.vunhand(&mut engine.heap, out);
    Ok(out)
}

/// Nested-construct depth guard.
pub(crate) fn enter_nested<T: ResourceTracker>(engine: &mut Engine<T>) -> EvalResult<()> {
    if engine.eval_depth as usize >= engine.config.max_eval_depth {
        return Err(engine.throw(ResultCode::Range, "expression nesting too deep"));
    }
    engine.eval_depth += 1;
    Ok(())
}

pub(crate) fn leave_nested<T: ResourceTracker>(engine: &mut Engine<T>) {
    engine.eval_depth = engine.eval_depth.saturating_sub(1);
}

// --- Top-level script driver ---

/// Runs a whole script: statement loop with the sweep/vacuum schedule,
/// interception of `exit`, and conversion of failures into public reports.
pub(crate) fn eval_script<T: ResourceTracker>(
    engine: &mut Engine<T>,
    script_name: &str,
    src: &str,
) -> Result<Object, crate::error::Exception> {
    if let Err(e) = engine.check_alive() {
        return Err(engine.error_to_report(e));
    }
    let script = std::rc::Rc::new(ScriptSrc {
        name: std::rc::Rc::from(script_name),
        text: std::rc::Rc::from(src),
    });
    let prev_script = engine.script.replace(std::rc::Rc::clone(&script));
    let holder_mark = engine.holder_mark();
    let mut toker = Tokenizer::new(&script.text);
    let mut candidate = Value::Undef;
    let mut terminated = true;

    let outcome: EvalResult<()> = (|| {
        loop {
            engine.dot_state = None;
            let tok = toker.peek_sig();
            match tok.ttype {
                TokType::Eof => break,
                TokType::Eox => {
                    // A semicolon discards the pending result.
                    toker.next_sig();
                    terminated = true;
                    continue;
                }
                _ => {}
            }
            match eval_expr(engine, &mut toker, EvalFlags::default())? {
                Some(st) => {
                    engine.holder_truncate(holder_mark);
                    engine.holder_push(st.val)?;
                    candidate = st.val;
                    terminated = false;
                }
                None => terminated = true,
            }
            let next = toker.peek_sig();
            if next.ttype == TokType::Eox {
                toker.next_sig();
                terminated = true;
            }
            engine.maybe_sweep();
        }
        Ok(())
    })();

    let report = match outcome {
        Ok(()) => None,
        Err(EvalError::Exit(v)) => {
            engine.holder_truncate(holder_mark);
            let _ = engine.holder_push(v);
            candidate = v;
            engine.scopes.vunhand(&mut engine.heap, v);
            terminated = false;
            None
        }
        Err(e) => Some(engine.error_to_report(e)),
    };

    let result = if let Some(report) = report {
        Err(report)
    } else {
        let out = if terminated { Value::Undef } else { candidate };
        Ok(engine.export_value(out))
    };
    engine.holder_truncate(holder_mark);
    engine.script = prev_script;
    engine.maybe_sweep();
    result
}
