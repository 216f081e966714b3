//! The exception model: throw/catch, assert/affirm, structured failure
//! reports, script locations, and stack traces.

use sorrel::{Engine, Object, ResultCode};

fn eval(src: &str) -> Object {
    Engine::new().eval(src).unwrap()
}

/// `catch { throw e }` yields the exception; `catch { e }` yields undef.
#[test]
fn catch_law() {
    assert_eq!(eval("typeinfo(isexception catch { throw 'boom' })"), Object::Bool(true));
    assert_eq!(eval("catch { 1 + 1 }"), Object::Undef);
}

#[test]
fn thrown_non_exceptions_are_wrapped_with_the_value_as_message() {
    assert_eq!(
        eval("catch { throw 'boom' }.message"),
        Object::String("boom".into())
    );
    assert_eq!(eval("catch { throw 42 }.message"), Object::Int(42));
}

/// Rethrowing an exception keeps the same value (no re-wrapping).
#[test]
fn rethrow_preserves_identity() {
    assert_eq!(
        eval("var e = catch { throw 'x' }; (catch { throw e }) === e"),
        Object::Bool(true)
    );
}

/// `affirm` failures are catchable with the ASSERT code.
#[test]
fn affirm_failure_is_catchable_assert() {
    assert_eq!(
        eval("catch { affirm 1 == 2 }.code"),
        Object::Int(ResultCode::Assert.as_int())
    );
    assert_eq!(
        eval("catch { affirm false }.codeString()"),
        Object::String("Assert".into())
    );
}

/// `assert` failures pass through catch and kill the script.
#[test]
fn assert_failure_is_not_catchable() {
    let exc = Engine::new().eval("catch { assert 1 == 2 }; 'survived'").unwrap_err();
    assert_eq!(exc.code, ResultCode::Assert, "got: {exc}");
    assert!(
        exc.message.contains("1 == 2"),
        "the failed expression text is in the message: {}",
        exc.message
    );
}

#[test]
fn passing_assertions_yield_true() {
    assert_eq!(eval("assert 1 == 1"), Object::Bool(true));
    assert_eq!(eval("affirm 'nonempty'"), Object::Bool(true));
}

#[test]
fn division_by_zero() {
    assert_eq!(eval("catch { 1 / 0 }.codeString()"), Object::String("DivByZero".into()));
    assert_eq!(eval("catch { 1 % 0 }.codeString()"), Object::String("DivByZero".into()));
    let exc = Engine::new().eval("1 / 0").unwrap_err();
    assert_eq!(exc.code, ResultCode::DivByZero);
}

#[test]
fn unknown_identifier_reports() {
    let exc = Engine::new().eval("nosuchvar + 1").unwrap_err();
    assert_eq!(exc.code, ResultCode::UnknownIdentifier, "got: {exc}");
    assert!(exc.message.contains("nosuchvar"), "message names the identifier: {}", exc.message);
}

/// Syntax errors carry a position and are catchable as exceptions.
#[test]
fn syntax_errors_have_positions() {
    let exc = Engine::new().eval_named("bad.srl", "var x =\n  @").unwrap_err();
    assert_eq!(exc.code, ResultCode::Syntax, "got: {exc}");
    assert_eq!(exc.script.as_deref(), Some("bad.srl"));
    assert_eq!(exc.line, 2, "1-based line of the offending token");
    assert_eq!(
        eval("catch { 1 + }.codeString()"),
        Object::String("Syntax".into()),
        "catch converts structured errors into exceptions"
    );
}

#[test]
fn unterminated_heredoc_is_a_tokenization_error() {
    let exc = Engine::new().eval("<<<EOF never closed").unwrap_err();
    assert_eq!(exc.code, ResultCode::Syntax, "got: {exc}");
}

/// Exceptions adopt the throw site's script position.
#[test]
fn exceptions_carry_their_location() {
    let mut engine = Engine::new();
    engine.var_decl("x", Object::Int(1)).unwrap();
    let result = engine.eval_named("where.srl", "var e = catch {\n  throw 'here'\n}; e.line").unwrap();
    assert_eq!(result, Object::Int(2), "the throw is on line 2");
    let script = engine.eval("e.script").unwrap();
    assert_eq!(script, Object::String("where.srl".into()));
}

/// A deliberate throw five calls deep produces a five-frame trace.
#[test]
fn stack_trace_depth_matches_call_depth() {
    let src = "proc f(n) { if (n <= 1) { throw 'deep' }; return n * f(n - 1) };
        var e = catch { f(5) };
        e.stacktrace.length()";
    assert_eq!(eval(src), Object::Int(5));
}

/// The public report carries the flattened stack trace.
#[test]
fn unhandled_exceptions_become_reports() {
    let exc = Engine::new()
        .eval_named("boom.srl", "proc go() { throw 'kapow' }; go()")
        .unwrap_err();
    assert_eq!(exc.code, ResultCode::Exception);
    assert_eq!(exc.message, "kapow");
    assert_eq!(exc.script.as_deref(), Some("boom.srl"));
    assert_eq!(exc.stacktrace.len(), 1, "one script frame: the go() call");
}

/// Exception values expose codeString() for symbolic comparison.
#[test]
fn code_string_names_match_the_taxonomy() {
    assert_eq!(
        eval("catch { undefined.x }.codeString()"),
        Object::String("Type".into())
    );
    assert_eq!(
        eval("catch { nosuch }.codeString()"),
        Object::String("UnknownIdentifier".into())
    );
}

/// Flow control passes through catch untouched.
#[test]
fn catch_does_not_intercept_flow_control() {
    assert_eq!(
        eval("proc f() { catch { return 7 }; return 0 }; f()"),
        Object::Int(7),
        "return inside catch returns from the function"
    );
    assert_eq!(
        eval("var r = 0; while (true) { catch { break }; r = 1 }; r"),
        Object::Int(0),
        "break inside catch breaks the loop"
    );
}

/// Exceptions thrown in a scope survive the scope's pop.
#[test]
fn exceptions_survive_scope_pops() {
    assert_eq!(
        eval("catch { scope { var local = 'doomed'; throw local } }.message"),
        Object::String("doomed".into())
    );
}
