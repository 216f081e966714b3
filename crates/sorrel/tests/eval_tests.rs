//! Expression-level behavior: literals, operators, precedence, coercion,
//! short-circuiting, and string handling.

use pretty_assertions::assert_eq;
use sorrel::{Engine, Object};

fn eval(src: &str) -> Object {
    Engine::new().eval(src).unwrap()
}

/// `var x = 1 + 2; x` is the canonical smoke test.
#[test]
fn var_then_read_back() {
    assert_eq!(eval("var x = 1 + 2; x"), Object::Int(3));
}

/// A script result is the final non-terminated expression.
#[test]
fn final_expression_is_the_result() {
    assert_eq!(eval("1; 2; 3"), Object::Int(3));
}

/// A trailing semicolon discards the result.
#[test]
fn trailing_semicolon_discards() {
    assert_eq!(eval("1 + 2;"), Object::Undef);
}

#[test]
fn precedence_follows_the_c_ladder() {
    assert_eq!(eval("1 + 2 * 3"), Object::Int(7));
    assert_eq!(eval("(1 + 2) * 3"), Object::Int(9));
    assert_eq!(eval("2 + 3 << 1"), Object::Int(10), "shift binds looser than addition");
    assert_eq!(eval("1 | 2 & 3"), Object::Int(3), "and binds tighter than or");
}

#[test]
fn integer_division_truncates() {
    assert_eq!(eval("7 / 2"), Object::Int(3));
    assert_eq!(eval("7 % 3"), Object::Int(1));
}

#[test]
fn mixed_arithmetic_promotes_to_double() {
    assert_eq!(eval("7.0 / 2"), Object::Double(3.5));
    assert_eq!(eval("1 + 0.5"), Object::Double(1.5));
}

#[test]
fn radix_literals() {
    assert_eq!(eval("0x10 + 0o10 + 0b10"), Object::Int(16 + 8 + 2));
}

#[test]
fn unary_operators() {
    assert_eq!(eval("-3"), Object::Int(-3));
    assert_eq!(eval("- -3"), Object::Int(3));
    assert_eq!(eval("!0"), Object::Bool(true));
    assert_eq!(eval("~0"), Object::Int(-1));
    assert_eq!(eval("+'42'"), Object::Int(42), "unary plus coerces numeric strings");
}

#[test]
fn bitwise_and_shift() {
    assert_eq!(eval("6 & 3"), Object::Int(2));
    assert_eq!(eval("6 | 3"), Object::Int(7));
    assert_eq!(eval("6 ^ 3"), Object::Int(5));
    assert_eq!(eval("1 << 4"), Object::Int(16));
    assert_eq!(eval("16 >> 2"), Object::Int(4));
}

/// `+` concatenates as soon as either side is a string.
#[test]
fn string_concatenation() {
    assert_eq!(eval("'a' + 1"), Object::String("a1".into()));
    assert_eq!(eval("1 + 'a'"), Object::String("1a".into()));
    assert_eq!(eval("'x' + true"), Object::String("xtrue".into()));
}

/// Loose equality coerces; strict equality does not.
#[test]
fn loose_vs_strict_equality() {
    assert_eq!(eval("1 == '1'"), Object::Bool(true));
    assert_eq!(eval("1 === '1'"), Object::Bool(false));
    assert_eq!(eval("1 == 1.0"), Object::Bool(true));
    assert_eq!(eval("null == undefined"), Object::Bool(true));
    assert_eq!(eval("null === undefined"), Object::Bool(false));
    assert_eq!(eval("1 != 2"), Object::Bool(true));
    assert_eq!(eval("'a' !== 'b'"), Object::Bool(true));
}

#[test]
fn relational_comparisons() {
    assert_eq!(eval("2 < 10"), Object::Bool(true));
    assert_eq!(eval("'a' < 'b'"), Object::Bool(true));
    assert_eq!(eval("'2' < 10"), Object::Bool(true), "numeric strings compare numerically");
    assert_eq!(eval("3 >= 3"), Object::Bool(true));
}

#[test]
fn ternary_selects_by_condition() {
    assert_eq!(eval("1 ? 'y' : 'n'"), Object::String("y".into()));
    assert_eq!(eval("0 ? 'y' : 'n'"), Object::String("n".into()));
    assert_eq!(eval("1 ? 2 ? 'a' : 'b' : 'c'"), Object::String("a".into()));
}

/// The dead arm of a short-circuit is parsed but has no side effects.
#[test]
fn short_circuit_suppresses_side_effects() {
    assert_eq!(
        eval("var n = 0; proc bump() { return n += 1 }; false && bump(); n"),
        Object::Int(0)
    );
    assert_eq!(
        eval("var n = 0; proc bump() { return n += 1 }; true || bump(); n"),
        Object::Int(0)
    );
    assert_eq!(
        eval("var n = 0; proc bump() { return n += 1 }; true && bump(); n"),
        Object::Int(1)
    );
    assert_eq!(
        eval("var n = 0; proc bump() { return n += 1 }; 0 ? bump() : undefined; n"),
        Object::Int(0)
    );
}

/// Unknown identifiers in a dead arm do not error.
#[test]
fn skip_mode_tolerates_unknown_identifiers() {
    assert_eq!(eval("false && nosuchthing"), Object::Bool(false));
}

#[test]
fn logical_operators_return_booleans() {
    assert_eq!(eval("1 && 2"), Object::Bool(true));
    assert_eq!(eval("0 || 0"), Object::Bool(false));
}

/// `?:` (elvis) keeps a truthy left side; `|||` keeps a defined left side.
#[test]
fn elvis_and_or_else() {
    assert_eq!(eval("5 ?: 3"), Object::Int(5));
    assert_eq!(eval("0 ?: 3"), Object::Int(3));
    assert_eq!(eval("0 ||| 7"), Object::Int(0), "0 is defined, so ||| keeps it");
    assert_eq!(eval("null ||| 7"), Object::Int(7));
    assert_eq!(eval("undefined ||| 7"), Object::Int(7));
}

#[test]
fn compound_assignment() {
    assert_eq!(eval("var x = 10; x += 5; x"), Object::Int(15));
    assert_eq!(eval("var x = 10; x -= 3; x *= 2; x"), Object::Int(14));
    assert_eq!(eval("var x = 8; x >>= 2; x"), Object::Int(2));
}

#[test]
fn increment_and_decrement() {
    assert_eq!(eval("var i = 1; ++i"), Object::Int(2));
    assert_eq!(eval("var i = 1; i++"), Object::Int(1), "postfix yields the old value");
    assert_eq!(eval("var i = 1; i++; i"), Object::Int(2));
    assert_eq!(eval("var i = 1; --i; i"), Object::Int(0));
}

#[test]
fn comma_operator_yields_the_right_side() {
    assert_eq!(eval("1, 2, 3"), Object::Int(3));
}

#[test]
fn escapes_in_double_quoted_strings() {
    assert_eq!(eval(r#""aA\n""#), Object::String("aA\n".into()));
    assert_eq!(eval(r#""\q""#), Object::String("\\q".into()), "unknown escapes keep the backslash");
}

/// Heredocs trim all surrounding whitespace by default; `<<<:` trims exactly
/// one leading and trailing space/newline.
#[test]
fn heredoc_trimming_modes() {
    assert_eq!(eval("<<<EOF hello EOF"), Object::String("hello".into()));
    assert_eq!(eval("<<<:EOF\n hello \nEOF"), Object::String(" hello ".into()));
}

#[test]
fn comments_and_shebang_are_insignificant() {
    assert_eq!(eval("#!/usr/bin/env sorrel\n// line\n/* block */ 42"), Object::Int(42));
}

#[test]
fn containment_operators() {
    assert_eq!(eval("'abcd' =~ 'bc'"), Object::Bool(true));
    assert_eq!(eval("[1, 2, 3] =~ 2"), Object::Bool(true));
    assert_eq!(eval("[1, 2, 3] !~ 9"), Object::Bool(true));
    assert_eq!(eval("var o = {k: 1}; o =~ 'k'"), Object::Bool(true));
}

#[test]
fn double_formatting_round_trips() {
    assert_eq!(eval("0.1 + 0.2"), Object::Double(0.1 + 0.2));
    assert_eq!(eval("1.5 * 2.0"), Object::Double(3.0));
}

#[test]
fn newlines_are_whitespace() {
    assert_eq!(eval("1\n+\n2"), Object::Int(3));
}

/// Assignments chain right-to-left.
#[test]
fn chained_assignment() {
    assert_eq!(eval("var a = 0; var b = 0; a = b = 5; a + b"), Object::Int(10));
}
