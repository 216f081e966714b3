//! The operator table and the operator handlers.
//!
//! Operators are static records: symbol, arity, associativity, precedence
//! class, and placement. The precedence classes form the classic C-family
//! ladder; the stack machine in `eval` reduces against this table. Handlers
//! honor the engine's skip level: while it is positive they produce `Undef`
//! with no side effects.
//!
//! Arithmetic and comparison on a container left operand first consult the
//! prototype chain for an overload method (`operator+`, `operator==`, ...);
//! a function found there is called with `this` bound to the left operand.

use std::cmp::Ordering;

use crate::{
    engine::Engine,
    error::EvalResult,
    heap::HeapData,
    intern::KnownStr,
    rc::ResultCode,
    resource::ResourceTracker,
    token::OpSym,
    value::{Value, compare, loose_eq, strict_eq},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Assoc {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Prefix,
    Infix,
    Postfix,
}

/// Operator identities. Assignment, call, and index are driven directly by
/// the evaluator; everything else reduces through the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpId {
    Comma,
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    ShlAssign,
    ShrAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    /// `?`, opening a ternary; its `:` is driver state, not an operator.
    TernaryIf,
    /// `?:`, the binary elvis.
    Elvis,
    /// `|||`: left operand unless it is undef/null.
    OrElse,
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    CmpEq,
    CmpNeq,
    CmpEqStrict,
    CmpNeqStrict,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,
    Inherits,
    Contains,
    NotContains,
    ShiftLeft,
    ShiftRight,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    UnaryPlus,
    UnaryMinus,
    LogNot,
    BitNot,
    IncrPre,
    DecrPre,
    IncrPost,
    DecrPost,
    /// `.`: property lookup through the prototype chain.
    Dot,
    /// `?.`: like `.` but yields undef for undef/null left operands.
    DotSafe,
    /// `->`: own-property lookup, no prototype chain.
    Arrow,
    /// `::`: prototype-chain-only lookup, skipping own properties.
    ProtoLookup,
    /// `#`: hash entry search.
    HashSearch,
    /// `.#`: hash entry count (postfix).
    HashCount,
}

/// One static operator record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpSpec {
    pub id: OpId,
    pub arity: i8,
    pub assoc: Assoc,
    pub prec: u8,
    pub placement: Placement,
}

// Precedence classes, low to high.
pub(crate) const PREC_COMMA: u8 = 1;
pub(crate) const PREC_ASSIGN: u8 = 2;
pub(crate) const PREC_TERNARY: u8 = 3;
pub(crate) const PREC_OR: u8 = 4;
pub(crate) const PREC_AND: u8 = 5;
pub(crate) const PREC_BIT_OR: u8 = 6;
pub(crate) const PREC_BIT_XOR: u8 = 7;
pub(crate) const PREC_BIT_AND: u8 = 8;
pub(crate) const PREC_EQUALITY: u8 = 9;
pub(crate) const PREC_RELATIONAL: u8 = 10;
pub(crate) const PREC_SHIFT: u8 = 11;
pub(crate) const PREC_ADDITIVE: u8 = 12;
pub(crate) const PREC_MULTIPLICATIVE: u8 = 13;
pub(crate) const PREC_UNARY: u8 = 14;
pub(crate) const PREC_PRIMARY: u8 = 15;

const fn spec(id: OpId, arity: i8, assoc: Assoc, prec: u8, placement: Placement) -> OpSpec {
    OpSpec {
        id,
        arity,
        assoc,
        prec,
        placement,
    }
}

impl OpId {
    /// The static record for this operator.
    pub fn spec(self) -> OpSpec {
        use Assoc::{Left, Right};
        use Placement::{Infix, Postfix, Prefix};
        match self {
            Self::Comma => spec(self, 2, Left, PREC_COMMA, Infix),
            Self::Assign
            | Self::AddAssign
            | Self::SubAssign
            | Self::MulAssign
            | Self::DivAssign
            | Self::ModAssign
            | Self::ShlAssign
            | Self::ShrAssign
            | Self::AndAssign
            | Self::OrAssign
            | Self::XorAssign => spec(self, 2, Right, PREC_ASSIGN, Infix),
            Self::TernaryIf => spec(self, 3, Right, PREC_TERNARY, Infix),
            Self::Elvis => spec(self, 2, Right, PREC_TERNARY, Infix),
            Self::OrElse | Self::Or => spec(self, 2, Left, PREC_OR, Infix),
            Self::And => spec(self, 2, Left, PREC_AND, Infix),
            Self::BitOr => spec(self, 2, Left, PREC_BIT_OR, Infix),
            Self::BitXor => spec(self, 2, Left, PREC_BIT_XOR, Infix),
            Self::BitAnd => spec(self, 2, Left, PREC_BIT_AND, Infix),
            Self::CmpEq | Self::CmpNeq | Self::CmpEqStrict | Self::CmpNeqStrict => {
                spec(self, 2, Left, PREC_EQUALITY, Infix)
            }
            Self::CmpLt
            | Self::CmpLe
            | Self::CmpGt
            | Self::CmpGe
            | Self::Inherits
            | Self::Contains
            | Self::NotContains => spec(self, 2, Left, PREC_RELATIONAL, Infix),
            Self::ShiftLeft | Self::ShiftRight => spec(self, 2, Left, PREC_SHIFT, Infix),
            Self::Add | Self::Sub => spec(self, 2, Left, PREC_ADDITIVE, Infix),
            Self::Mul | Self::Div | Self::Mod => spec(self, 2, Left, PREC_MULTIPLICATIVE, Infix),
            Self::UnaryPlus | Self::UnaryMinus | Self::LogNot | Self::BitNot | Self::IncrPre | Self::DecrPre => {
                spec(self, 1, Right, PREC_UNARY, Prefix)
            }
            Self::IncrPost | Self::DecrPost | Self::HashCount => spec(self, 1, Left, PREC_PRIMARY, Postfix),
            Self::Dot | Self::DotSafe | Self::Arrow | Self::ProtoLookup | Self::HashSearch => {
                spec(self, 2, Left, PREC_PRIMARY, Infix)
            }
        }
    }

    /// True for the property-access operators that publish dot-op state.
    pub fn is_property_access(self) -> bool {
        matches!(self, Self::Dot | Self::DotSafe | Self::Arrow | Self::ProtoLookup | Self::HashSearch)
    }

    /// The overload method name consulted on container left operands. Each
    /// operator has its own name; only `!~` derives from the `=~` method.
    pub fn overload_name(self) -> Option<KnownStr> {
        match self {
            Self::Add => Some(KnownStr::OpAdd),
            Self::Sub => Some(KnownStr::OpSub),
            Self::Mul => Some(KnownStr::OpMul),
            Self::Div => Some(KnownStr::OpDiv),
            Self::Mod => Some(KnownStr::OpMod),
            Self::CmpEq => Some(KnownStr::OpCmpEq),
            Self::CmpNeq => Some(KnownStr::OpCmpNeq),
            Self::CmpLt => Some(KnownStr::OpCmpLt),
            Self::CmpLe => Some(KnownStr::OpCmpLe),
            Self::CmpGt => Some(KnownStr::OpCmpGt),
            Self::CmpGe => Some(KnownStr::OpCmpGe),
            Self::Contains | Self::NotContains => Some(KnownStr::OpContains),
            _ => None,
        }
    }
}

/// Maps an operator token in operand position (prefix context).
pub(crate) fn prefix_for(sym: OpSym) -> Option<OpId> {
    match sym {
        OpSym::Plus => Some(OpId::UnaryPlus),
        OpSym::Minus => Some(OpId::UnaryMinus),
        OpSym::Bang => Some(OpId::LogNot),
        OpSym::Tilde => Some(OpId::BitNot),
        OpSym::PlusPlus => Some(OpId::IncrPre),
        OpSym::MinusMinus => Some(OpId::DecrPre),
        _ => None,
    }
}

/// Maps an operator token in operator position (infix/postfix context).
pub(crate) fn infix_for(sym: OpSym) -> Option<OpId> {
    match sym {
        OpSym::Comma => Some(OpId::Comma),
        OpSym::Assign => Some(OpId::Assign),
        OpSym::PlusAssign => Some(OpId::AddAssign),
        OpSym::MinusAssign => Some(OpId::SubAssign),
        OpSym::StarAssign => Some(OpId::MulAssign),
        OpSym::SlashAssign => Some(OpId::DivAssign),
        OpSym::PercentAssign => Some(OpId::ModAssign),
        OpSym::ShlAssign => Some(OpId::ShlAssign),
        OpSym::ShrAssign => Some(OpId::ShrAssign),
        OpSym::AmpAssign => Some(OpId::AndAssign),
        OpSym::PipeAssign => Some(OpId::OrAssign),
        OpSym::CaretAssign => Some(OpId::XorAssign),
        OpSym::Question => Some(OpId::TernaryIf),
        OpSym::QuestionColon => Some(OpId::Elvis),
        OpSym::PipePipePipe => Some(OpId::OrElse),
        OpSym::PipePipe => Some(OpId::Or),
        OpSym::AmpAmp => Some(OpId::And),
        OpSym::Pipe => Some(OpId::BitOr),
        OpSym::Caret => Some(OpId::BitXor),
        OpSym::Amp => Some(OpId::BitAnd),
        OpSym::EqEq => Some(OpId::CmpEq),
        OpSym::NotEq => Some(OpId::CmpNeq),
        OpSym::EqEqEq => Some(OpId::CmpEqStrict),
        OpSym::NotEqEq => Some(OpId::CmpNeqStrict),
        OpSym::Lt => Some(OpId::CmpLt),
        OpSym::Le => Some(OpId::CmpLe),
        OpSym::Gt => Some(OpId::CmpGt),
        OpSym::Ge => Some(OpId::CmpGe),
        OpSym::EqTilde => Some(OpId::Contains),
        OpSym::BangTilde => Some(OpId::NotContains),
        OpSym::Shl => Some(OpId::ShiftLeft),
        OpSym::Shr => Some(OpId::ShiftRight),
        OpSym::Plus => Some(OpId::Add),
        OpSym::Minus => Some(OpId::Sub),
        OpSym::Star => Some(OpId::Mul),
        OpSym::Slash => Some(OpId::Div),
        OpSym::Percent => Some(OpId::Mod),
        OpSym::PlusPlus => Some(OpId::IncrPost),
        OpSym::MinusMinus => Some(OpId::DecrPost),
        OpSym::Dot => Some(OpId::Dot),
        OpSym::QuestionDot => Some(OpId::DotSafe),
        OpSym::Arrow => Some(OpId::Arrow),
        OpSym::ColonColon => Some(OpId::ProtoLookup),
        OpSym::Hash => Some(OpId::HashSearch),
        OpSym::DotHash => Some(OpId::HashCount),
        _ => None,
    }
}

/// Computes a binary operator over plain values (overloads already tried by
/// the caller). `line`/`col` seed error positions via the engine.
pub(crate) fn binary_result<T: ResourceTracker>(
    engine: &mut Engine<T>,
    op: OpId,
    lhs: Value,
    rhs: Value,
) -> EvalResult<Value> {
    match op {
        OpId::Comma => Ok(rhs),
        OpId::Add => {
            // String concatenation wins when either side is a string.
            if lhs.as_str(&engine.heap).is_some() || rhs.as_str(&engine.heap).is_some() {
                let mut out = String::new();
                crate::value::to_display(lhs, &engine.heap, &mut out);
                crate::value::to_display(rhs, &engine.heap, &mut out);
                return engine.new_string(&out);
            }
            numeric_binary(engine, op, lhs, rhs)
        }
        OpId::Sub | OpId::Mul | OpId::Div | OpId::Mod => numeric_binary(engine, op, lhs, rhs),
        OpId::ShiftLeft | OpId::ShiftRight | OpId::BitAnd | OpId::BitOr | OpId::BitXor => {
            let Some(a) = lhs.coerce_int(&engine.heap) else {
                return Err(engine.throw(ResultCode::Type, "bitwise operand is not an integer"));
            };
            let Some(b) = rhs.coerce_int(&engine.heap) else {
                return Err(engine.throw(ResultCode::Type, "bitwise operand is not an integer"));
            };
            let out = match op {
                OpId::ShiftLeft => a.wrapping_shl((b & 63) as u32),
                OpId::ShiftRight => a.wrapping_shr((b & 63) as u32),
                OpId::BitAnd => a & b,
                OpId::BitOr => a | b,
                OpId::BitXor => a ^ b,
                _ => unreachable!(),
            };
            Ok(Value::Int(out))
        }
        OpId::CmpEq => Ok(Value::Bool(loose_eq(lhs, rhs, &engine.heap))),
        OpId::CmpNeq => Ok(Value::Bool(!loose_eq(lhs, rhs, &engine.heap))),
        OpId::CmpEqStrict => Ok(Value::Bool(strict_eq(lhs, rhs, &engine.heap))),
        OpId::CmpNeqStrict => Ok(Value::Bool(!strict_eq(lhs, rhs, &engine.heap))),
        OpId::CmpLt | OpId::CmpLe | OpId::CmpGt | OpId::CmpGe => {
            let Some(ord) = compare(lhs, rhs, &engine.heap) else {
                return Err(engine.throw(ResultCode::Type, "values are not comparable"));
            };
            Ok(Value::Bool(match op {
                OpId::CmpLt => ord == Ordering::Less,
                OpId::CmpLe => ord != Ordering::Greater,
                OpId::CmpGt => ord == Ordering::Greater,
                OpId::CmpGe => ord != Ordering::Less,
                _ => unreachable!(),
            }))
        }
        OpId::Inherits => Ok(Value::Bool(engine.derives_from_value(lhs, rhs))),
        OpId::Contains => contains(engine, lhs, rhs).map(Value::Bool),
        OpId::NotContains => contains(engine, lhs, rhs).map(|b| Value::Bool(!b)),
        OpId::OrElse => Ok(if matches!(lhs, Value::Undef | Value::Null) { rhs } else { lhs }),
        OpId::Elvis => Ok(if lhs.truthy(&engine.heap) { lhs } else { rhs }),
        OpId::Or => Ok(Value::Bool(lhs.truthy(&engine.heap) || rhs.truthy(&engine.heap))),
        OpId::And => Ok(Value::Bool(lhs.truthy(&engine.heap) && rhs.truthy(&engine.heap))),
        OpId::HashSearch => {
            let is_hash = matches!(
                lhs.ref_id().map(|id| engine.heap.get(id)),
                Some(HeapData::Hash(_))
            );
            if is_hash {
                Ok(engine.hash_search(lhs, rhs).unwrap_or(Value::Undef))
            } else {
                Err(engine.throw(ResultCode::Type, "'#' requires a hash left operand"))
            }
        }
        _ => Err(engine.throw(ResultCode::Unsupported, "operator not usable here")),
    }
}

fn numeric_binary<T: ResourceTracker>(engine: &mut Engine<T>, op: OpId, lhs: Value, rhs: Value) -> EvalResult<Value> {
    // Pure int math stays in the int domain with wrapping semantics.
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        return match op {
            OpId::Add => Ok(Value::Int(a.wrapping_add(b))),
            OpId::Sub => Ok(Value::Int(a.wrapping_sub(b))),
            OpId::Mul => Ok(Value::Int(a.wrapping_mul(b))),
            OpId::Div => {
                if b == 0 {
                    Err(engine.throw(ResultCode::DivByZero, "integer division by zero"))
                } else {
                    Ok(Value::Int(a.wrapping_div(b)))
                }
            }
            OpId::Mod => {
                if b == 0 {
                    Err(engine.throw(ResultCode::DivByZero, "integer modulus by zero"))
                } else {
                    Ok(Value::Int(a.wrapping_rem(b)))
                }
            }
            _ => unreachable!("numeric_binary only handles arithmetic"),
        };
    }
    let Some(a) = lhs.coerce_double(&engine.heap) else {
        return Err(engine.throw(ResultCode::Type, "left operand is not numeric"));
    };
    let Some(b) = rhs.coerce_double(&engine.heap) else {
        return Err(engine.throw(ResultCode::Type, "right operand is not numeric"));
    };
    let out = match op {
        OpId::Add => a + b,
        OpId::Sub => a - b,
        OpId::Mul => a * b,
        OpId::Div => a / b,
        OpId::Mod => a % b,
        _ => unreachable!("numeric_binary only handles arithmetic"),
    };
    Ok(Value::Double(out))
}

/// `lhs =~ rhs`: substring for strings, element membership for arrays and
/// tuples, key membership for objects, entry membership for hashes.
fn contains<T: ResourceTracker>(engine: &mut Engine<T>, lhs: Value, rhs: Value) -> EvalResult<bool> {
    if let Some(haystack) = lhs.as_str(&engine.heap) {
        let needle = engine.display_string(rhs);
        return Ok(haystack.contains(&needle));
    }
    let Some(id) = lhs.ref_id() else {
        return Err(engine.throw(ResultCode::Type, "value does not support containment"));
    };
    match engine.heap.get(id) {
        HeapData::Array(arr) => Ok(arr.list.iter().any(|v| loose_eq(*v, rhs, &engine.heap))),
        HeapData::Tuple(t) => Ok(t.slots.iter().any(|v| loose_eq(*v, rhs, &engine.heap))),
        HeapData::Object(_) => Ok(engine.prop_get_own(lhs, rhs).is_some()),
        HeapData::Hash(_) => Ok(engine.hash_search(lhs, rhs).is_some()),
        _ => Err(engine.throw(ResultCode::Type, "value does not support containment")),
    }
}

/// Computes a prefix operator over a plain value.
pub(crate) fn prefix_result<T: ResourceTracker>(engine: &mut Engine<T>, op: OpId, operand: Value) -> EvalResult<Value> {
    match op {
        OpId::UnaryPlus => match operand {
            Value::Int(_) | Value::Double(_) => Ok(operand),
            _ => match operand.coerce_double(&engine.heap) {
                Some(d) => {
                    if d.fract() == 0.0 && d.abs() < i64::MAX as f64 {
                        Ok(Value::Int(d as i64))
                    } else {
                        Ok(Value::Double(d))
                    }
                }
                None => Err(engine.throw(ResultCode::Type, "unary '+' needs a numeric operand")),
            },
        },
        OpId::UnaryMinus => match operand {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Double(d) => Ok(Value::Double(-d)),
            _ => match operand.coerce_double(&engine.heap) {
                Some(d) => Ok(Value::Double(-d)),
                None => Err(engine.throw(ResultCode::Type, "unary '-' needs a numeric operand")),
            },
        },
        OpId::LogNot => Ok(Value::Bool(!operand.truthy(&engine.heap))),
        OpId::BitNot => match operand.coerce_int(&engine.heap) {
            Some(i) => Ok(Value::Int(!i)),
            None => Err(engine.throw(ResultCode::Type, "'~' needs an integer operand")),
        },
        _ => Err(engine.throw(ResultCode::Unsupported, "operator not usable here")),
    }
}

/// Postfix `.#`: number of hash entries (or array elements).
pub(crate) fn hash_count<T: ResourceTracker>(engine: &mut Engine<T>, operand: Value) -> EvalResult<Value> {
    let Some(id) = operand.ref_id() else {
        return Err(engine.throw(ResultCode::Type, "'.#' needs a hash or array operand"));
    };
    match engine.heap.get(id) {
        HeapData::Hash(h) => Ok(Value::Int(h.len() as i64)),
        HeapData::Array(arr) => Ok(Value::Int(arr.list.len() as i64)),
        _ => Err(engine.throw(ResultCode::Type, "'.#' needs a hash or array operand")),
    }
}

/// Looks for an operator-overload method on a container left operand.
/// Returns `None` when no overload applies; the caller falls back to the
/// built-in semantics.
pub(crate) fn find_overload<T: ResourceTracker>(engine: &Engine<T>, op: OpId, lhs: Value) -> Option<Value> {
    if !lhs.is_container(&engine.heap) {
        return None;
    }
    let name = op.overload_name()?;
    let method = engine.prop_get(lhs, Engine::<T>::known(name))?;
    matches!(
        method.ref_id().map(|id| engine.heap.get(id)),
        Some(HeapData::Function(_))
    )
    .then_some(method)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_ladder_is_ordered() {
        assert!(OpId::Comma.spec().prec < OpId::Assign.spec().prec);
        assert!(OpId::Assign.spec().prec < OpId::Or.spec().prec);
        assert!(OpId::Or.spec().prec < OpId::And.spec().prec);
        assert!(OpId::And.spec().prec < OpId::BitOr.spec().prec);
        assert!(OpId::BitOr.spec().prec < OpId::BitXor.spec().prec);
        assert!(OpId::BitXor.spec().prec < OpId::BitAnd.spec().prec);
        assert!(OpId::BitAnd.spec().prec < OpId::CmpEq.spec().prec);
        assert!(OpId::CmpEq.spec().prec < OpId::CmpLt.spec().prec);
        assert!(OpId::CmpLt.spec().prec < OpId::ShiftLeft.spec().prec);
        assert!(OpId::ShiftLeft.spec().prec < OpId::Add.spec().prec);
        assert!(OpId::Add.spec().prec < OpId::Mul.spec().prec);
        assert!(OpId::Mul.spec().prec < OpId::UnaryMinus.spec().prec);
        assert!(OpId::UnaryMinus.spec().prec < OpId::Dot.spec().prec);
    }

    #[test]
    fn every_spec_arity_matches_placement() {
        for op in [
            OpId::Add,
            OpId::Assign,
            OpId::Dot,
            OpId::UnaryMinus,
            OpId::IncrPost,
            OpId::TernaryIf,
        ] {
            let s = op.spec();
            match s.placement {
                Placement::Prefix | Placement::Postfix => assert_eq!(s.arity, 1, "{op:?}"),
                Placement::Infix => assert!(s.arity >= 2, "{op:?}"),
            }
        }
    }

    #[test]
    fn assignment_is_right_associative() {
        assert_eq!(OpId::Assign.spec().assoc, Assoc::Right);
        assert_eq!(OpId::Add.spec().assoc, Assoc::Left);
    }
}
