//! Script functions: declaration, recursion, parameter defaults, `using`
//! captures, `this`/`argv` binding, apply/call, and registered natives.

use std::rc::Rc;

use sorrel::{CollectStringOutputer, Engine, Exception, Object, ResultCode};

fn eval(src: &str) -> Object {
    Engine::new().eval(src).unwrap()
}

/// The classic recursive factorial.
#[test]
fn recursive_factorial() {
    assert_eq!(
        eval("proc f(n) { return n <= 1 ? 1 : n * f(n - 1) }; f(5)"),
        Object::Int(120)
    );
}

#[test]
fn function_without_return_yields_last_expression() {
    assert_eq!(eval("proc f() { 40 + 2 }; f()"), Object::Int(42));
}

#[test]
fn return_without_value_yields_undef() {
    assert_eq!(eval("proc f() { return; 99 }; f()"), Object::Undef);
}

/// Missing arguments take their defaults; defaults see earlier parameters.
#[test]
fn parameter_defaults() {
    assert_eq!(eval("proc f(a, b = 10) { return a + b }; f(1)"), Object::Int(11));
    assert_eq!(eval("proc f(a, b = 10) { return a + b }; f(1, 2)"), Object::Int(3));
    assert_eq!(
        eval("proc f(a, b = a + 1) { return a + b }; f(4)"),
        Object::Int(9),
        "defaults are evaluated in the call scope, after earlier params"
    );
}

#[test]
fn missing_arguments_are_undef() {
    assert_eq!(eval("proc f(a) { return typeinfo(isundef a) }; f()"), Object::Bool(true));
}

/// Symbol lookup is dynamic: bodies see the call-time scope chain.
#[test]
fn dynamic_scope_lookup() {
    assert_eq!(
        eval("var base = 100; proc f() { return base + 1 }; f()"),
        Object::Int(101)
    );
}

/// `using` captures values at definition time and survives the defining
/// scope's death.
#[test]
fn using_captures_survive_their_scope() {
    let src = "var g = undefined;
        scope { var secret = 7; g = proc() using (secret) { return secret } };
        g()";
    assert_eq!(eval(src), Object::Int(7));
}

#[test]
fn argv_holds_all_arguments() {
    assert_eq!(eval("proc f() { return argv.length() }; f(1, 2, 3)"), Object::Int(3));
    assert_eq!(eval("proc f() { return argv[1] }; f('a', 'b')"), Object::String("b".into()));
}

/// Property-qualified calls bind `this` to the container.
#[test]
fn this_binds_to_the_dot_target() {
    assert_eq!(
        eval("var o = {x: 9, m: proc() { return this.x }}; o.m()"),
        Object::Int(9)
    );
}

/// Unqualified calls bind `this` to the function itself.
#[test]
fn unqualified_this_is_the_function() {
    assert_eq!(eval("proc f() { return typeinfo(isfunction this) }; f()"), Object::Bool(true));
}

#[test]
fn apply_and_call() {
    assert_eq!(
        eval("proc add(a, b) { return a + b }; add.apply(undefined, [3, 4])"),
        Object::Int(7)
    );
    assert_eq!(
        eval("var o = {x: 5}; proc getx() { return this.x }; getx.call(o)"),
        Object::Int(5)
    );
}

#[test]
fn anonymous_procs_are_values() {
    assert_eq!(eval("var f = proc(a) { return a * 2 }; f(21)"), Object::Int(42));
    assert_eq!(eval("(proc() { return 'inline' })()"), Object::String("inline".into()));
}

#[test]
fn source_code_of_a_script_function() {
    let src = eval("proc f() { return 1 }; f.sourceCode()");
    let Object::String(text) = src else {
        panic!("expected a string, got {src:?}");
    };
    assert!(text.contains("return 1"), "sourceCode returns the body text: {text}");
}

#[test]
fn call_of_non_function_fails() {
    let exc = Engine::new().eval("var x = 3; x()").unwrap_err();
    assert_eq!(exc.code, ResultCode::CallOfNonFunction, "got: {exc}");
}

#[test]
fn call_depth_is_bounded() {
    let exc = Engine::new().eval("proc f() { return f() }; f()").unwrap_err();
    assert_eq!(exc.code, ResultCode::Range, "unbounded recursion must fail cleanly: {exc}");
}

/// `print` writes space-separated values plus a newline to the outputer.
#[test]
fn print_goes_through_the_outputer() {
    let collector = CollectStringOutputer::new();
    let mut engine = Engine::new();
    engine.set_outputer(Box::new(collector.clone()));
    engine.eval("print('answer:', 42)").unwrap();
    assert_eq!(collector.output_string(), "answer: 42\n");
}

/// Registered natives receive exported arguments and return owned results.
#[test]
fn registered_native_round_trip() {
    let mut engine = Engine::new();
    engine
        .register_native(
            "sum",
            Rc::new(|call| {
                let mut total = 0;
                for arg in &call.args {
                    total += i64::try_from(arg)?;
                }
                Ok(Object::Int(total))
            }),
        )
        .unwrap();
    assert_eq!(engine.eval("sum(1, 2, 3)").unwrap(), Object::Int(6));
}

/// A native returning an error surfaces as a script exception.
#[test]
fn native_errors_become_exceptions() {
    let mut engine = Engine::new();
    engine
        .register_native(
            "fail",
            Rc::new(|_call| Err(Exception::new(ResultCode::Range, "nope"))),
        )
        .unwrap();
    let result = engine.eval("catch { fail() }.codeString()").unwrap();
    assert_eq!(result, Object::String("Range".into()));
}

#[test]
fn functions_rescope_with_their_captures() {
    // The function migrates to the root scope through assignment; calling it
    // later must still find its capture intact.
    let src = "var make = proc() { var n = 41; return proc() using (n) { return n + 1 } };
        var f = make();
        f()";
    assert_eq!(eval(src), Object::Int(42));
}
