//! Keyword-level control flow: if/while/do/for/foreach, break/continue,
//! scope and eval blocks, and flow-control escape handling.

use sorrel::{Engine, Object, ResultCode};

fn eval(src: &str) -> Object {
    Engine::new().eval(src).unwrap()
}

/// `if` yields whether a branch ran.
#[test]
fn if_returns_whether_a_branch_ran() {
    assert_eq!(eval("if (true) { 1 }"), Object::Bool(true));
    assert_eq!(eval("if (false) { 1 }"), Object::Bool(false));
    assert_eq!(eval("if (false) { 1 } else { 2 }"), Object::Bool(false));
}

#[test]
fn if_else_chain_picks_one_branch() {
    let src = "var x = 0;
        if (x == 1) { 'one' }
        else if (x == 0) { 'zero' }
        else { 'other' };
        x";
    assert_eq!(eval(src), Object::Int(0));
    assert_eq!(
        eval("var r = ''; var x = 7; if (x < 5) { r = 'lo' } else if (x < 10) { r = 'mid' } else { r = 'hi' }; r"),
        Object::String("mid".into())
    );
}

#[test]
fn while_loop_counts() {
    assert_eq!(eval("var i = 0; while (i < 5) { i = i + 1 }; i"), Object::Int(5));
}

#[test]
fn while_with_false_condition_never_runs() {
    assert_eq!(eval("var i = 0; while (false) { i = 99 }; i"), Object::Int(0));
}

#[test]
fn do_while_runs_at_least_once() {
    assert_eq!(eval("var i = 10; do { i = i + 1 } while (false); i"), Object::Int(11));
}

#[test]
fn for_loop_accumulates() {
    assert_eq!(
        eval("var total = 0; for (var i = 0; i < 5; ++i) { total += i }; total"),
        Object::Int(10)
    );
}

/// The for-initializer's variables are scoped to the loop.
#[test]
fn for_loop_variables_do_not_leak() {
    assert_eq!(
        eval("for (var i = 0; i < 3; ++i) {}; typeinfo(isdeclared i)"),
        Object::Bool(false)
    );
}

/// `break` may carry a payload that becomes the loop's value.
#[test]
fn break_with_payload() {
    assert_eq!(eval("while (true) { break 42 }"), Object::Int(42));
    assert_eq!(
        eval("var found = for (var i = 0; ; ++i) { if (i == 7) { break i } }; found"),
        Object::Int(7),
        "an empty for-condition loops until break"
    );
}

#[test]
fn continue_skips_an_iteration() {
    assert_eq!(
        eval("var s = 0; for (var i = 0; i < 5; ++i) { if (i == 2) { continue }; s += i }; s"),
        Object::Int(8)
    );
}

#[test]
fn nested_loops_break_innermost() {
    let src = "var hits = 0;
        for (var i = 0; i < 3; ++i) {
            for (var j = 0; j < 3; ++j) {
                if (j == 1) { break };
                hits += 1
            }
        };
        hits";
    assert_eq!(eval(src), Object::Int(3));
}

#[test]
fn foreach_over_array_yields_index_and_value() {
    assert_eq!(
        eval("var s = ''; foreach ([10, 20, 30] => i, v) { s += i + ':' + v + ' ' }; s"),
        Object::String("0:10 1:20 2:30 ".into())
    );
}

#[test]
fn foreach_over_object_yields_keys_in_insertion_order() {
    assert_eq!(
        eval("var o = {a: 1, b: 2}; var ks = ''; foreach (o => k, v) { ks += k }; ks"),
        Object::String("ab".into())
    );
}

#[test]
fn foreach_over_string_yields_chars() {
    assert_eq!(
        eval("var out = ''; foreach ('héllo' => i, c) { out += c }; out"),
        Object::String("héllo".into())
    );
}

/// Structural mutation during iteration fails with the visiting discipline.
#[test]
fn foreach_locks_the_container() {
    let exc = Engine::new()
        .eval("var a = [1, 2]; foreach (a => i, v) { a.push(9) }")
        .unwrap_err();
    assert_eq!(exc.code, ResultCode::IsVisitingList, "got: {exc}");
}

/// `scope {}` pushes a scope; its variables vanish with it.
#[test]
fn scope_block_yields_last_value_and_isolates_vars() {
    assert_eq!(eval("var x = scope { var y = 5; y * 2 }; x"), Object::Int(10));
    assert_eq!(eval("scope { var y = 5; y }; typeinfo(isdeclared y)"), Object::Bool(false));
}

/// `eval {}` runs in the current scope.
#[test]
fn eval_block_shares_the_current_scope() {
    assert_eq!(eval("eval { var y = 5 }; y"), Object::Int(5));
    assert_eq!(eval("eval { 6 * 7 }"), Object::Int(42));
}

#[test]
fn unset_removes_variables_and_properties() {
    assert_eq!(eval("var x = 1; unset x; typeinfo(isdeclared x)"), Object::Bool(false));
    assert_eq!(
        eval("var o = {a: 1, b: 2}; unset o.a; o.propertyKeys().join(',')"),
        Object::String("b".into())
    );
}

/// Flow-control codes escaping their construct are a misuse.
#[test]
fn stray_flow_control_is_a_misuse() {
    let exc = Engine::new().eval("return 1").unwrap_err();
    assert_eq!(exc.code, ResultCode::Misuse, "got: {exc}");
    let exc = Engine::new().eval("break").unwrap_err();
    assert_eq!(exc.code, ResultCode::Misuse, "got: {exc}");
}

/// `exit` unwinds to the top driver and becomes the script result.
#[test]
fn exit_yields_the_script_result() {
    assert_eq!(eval("exit 7; 'never reached'"), Object::Int(7));
    assert_eq!(eval("var i = 0; while (true) { i += 1; if (i == 3) { exit i } }"), Object::Int(3));
}

#[test]
fn typeinfo_tags() {
    assert_eq!(eval("typeinfo(name 1)"), Object::String("integer".into()));
    assert_eq!(eval("typeinfo(name 'x')"), Object::String("string".into()));
    assert_eq!(eval("typeinfo(isarray [1])"), Object::Bool(true));
    assert_eq!(eval("typeinfo(isobject {})"), Object::Bool(true));
    assert_eq!(eval("typeinfo(isnumber 1.5)"), Object::Bool(true));
    assert_eq!(eval("typeinfo(iscontainer 'x')"), Object::Bool(false));
    assert_eq!(eval("typeinfo(isdeclared nope)"), Object::Bool(false));
    assert_eq!(eval("typeinfo(isfunction proc() {})"), Object::Bool(true));
}

#[test]
fn pragma_tunes_gc_intervals() {
    assert_eq!(eval("pragma(sweepInterval)"), Object::Int(1), "default interval");
    assert_eq!(
        eval("pragma(sweepInterval 3); pragma(sweepInterval)"),
        Object::Int(3),
        "setting returns later reads"
    );
    assert_eq!(eval("pragma(vacuumInterval 5); pragma(vacuumInterval)"), Object::Int(5));
}

#[test]
fn pragma_refcount_reports_zero_for_builtins() {
    assert_eq!(eval("pragma(refcount 1)"), Object::Int(0));
}
