//! Resource limits, cooperative interruption, deep nesting, user-defined
//! keywords, and the variable embedding API.

use std::time::Duration;

use sorrel::{Engine, Object, ResourceLimits, ResultCode};

/// Allocation caps trip as OOM without crashing.
#[test]
fn allocation_cap_trips_as_oom() {
    let mut engine = Engine::with_limits(ResourceLimits {
        max_allocations: Some(2000),
        ..ResourceLimits::default()
    });
    let exc = engine
        .eval("var a = []; for (var i = 0; i < 100000; ++i) { a[] = 'item number ' + i }")
        .unwrap_err();
    assert_eq!(exc.code, ResultCode::Oom, "got: {exc}");
    assert!(exc.message.is_empty(), "OOM reports carry no formatted message");
}

/// A single oversized allocation is refused with no side effects.
#[test]
fn single_allocation_cap() {
    let mut engine = Engine::with_limits(ResourceLimits {
        max_single_alloc: Some(4096),
        ..ResourceLimits::default()
    });
    // Small work is fine.
    assert_eq!(engine.eval("'small' + ' enough'").unwrap(), Object::String("small enough".into()));
    // An 8KB string is not.
    let big = format!("var s = '{}'", "x".repeat(8192));
    let exc = engine.eval(&big).unwrap_err();
    assert_eq!(exc.code, ResultCode::Oom, "got: {exc}");
    // The engine remains usable afterwards.
    assert_eq!(engine.eval("1 + 1").unwrap(), Object::Int(2));
}

/// Wall-clock deadlines unwind like an interrupt.
#[test]
fn deadline_interrupts_runaway_loops() {
    let mut engine = Engine::with_limits(ResourceLimits {
        max_time: Some(Duration::from_millis(50)),
        ..ResourceLimits::default()
    });
    let exc = engine.eval("while (true) {}").unwrap_err();
    assert_eq!(exc.code, ResultCode::Interrupted, "got: {exc}");
}

/// The interrupt handle sets a sticky flag the evaluator polls.
#[test]
fn interrupt_handle_cancels_evaluation() {
    let mut engine = Engine::new();
    let handle = engine.interrupt_handle();
    handle.interrupt();
    assert!(handle.is_pending());
    let exc = engine.eval("1 + 1").unwrap_err();
    assert_eq!(exc.code, ResultCode::Interrupted, "got: {exc}");
    // The flag was consumed: the next run proceeds normally.
    assert!(!handle.is_pending());
    assert_eq!(engine.eval("1 + 1").unwrap(), Object::Int(2));
}

/// Ten thousand nested parens evaluate iteratively, never overflowing the
/// native stack.
#[test]
fn deeply_nested_parens_succeed() {
    let depth = 10_000;
    let src = format!("{}7{}", "(".repeat(depth), ")".repeat(depth));
    assert_eq!(Engine::new().eval(&src).unwrap(), Object::Int(7));
}

/// Non-paren nesting is bounded by the eval-depth guard and fails cleanly.
#[test]
fn deep_bracket_nesting_fails_cleanly() {
    let depth = 10_000;
    let src = format!("{}1{}", "[".repeat(depth), "]".repeat(depth));
    let exc = Engine::new().eval(&src).unwrap_err();
    assert_eq!(exc.code, ResultCode::Range, "got: {exc}");
}

// --- User-defined keywords ---

#[test]
fn ukwd_resolves_in_the_keyword_phase() {
    let mut engine = Engine::new();
    engine.register_keyword("ANSWER", Object::Int(42)).unwrap();
    assert_eq!(engine.eval("ANSWER").unwrap(), Object::Int(42));
    assert_eq!(engine.eval("ANSWER + 1").unwrap(), Object::Int(43));
}

#[test]
fn ukwd_rejects_real_keywords_and_duplicates() {
    let mut engine = Engine::new();
    let exc = engine.register_keyword("while", Object::Int(1)).unwrap_err();
    assert_eq!(exc.code, ResultCode::AlreadyExists, "built-in keywords are reserved: {exc}");

    engine.register_keyword("ONCE", Object::Int(1)).unwrap();
    let exc = engine.register_keyword("ONCE", Object::Int(2)).unwrap_err();
    assert_eq!(exc.code, ResultCode::AlreadyExists, "got: {exc}");
}

#[test]
fn ukwd_rejects_bad_names_and_values() {
    let mut engine = Engine::new();
    let exc = engine.register_keyword("not a name", Object::Int(1)).unwrap_err();
    assert_eq!(exc.code, ResultCode::Misuse, "got: {exc}");
    let exc = engine.register_keyword("nothing", Object::Null).unwrap_err();
    assert_eq!(exc.code, ResultCode::Misuse, "null/undefined values are refused: {exc}");
}

/// UKWD values survive vacuum passes (they are engine-owned roots).
#[test]
fn ukwd_values_survive_vacuum() {
    let mut engine = Engine::new();
    engine
        .register_keyword("CONFIG", Object::Object(vec![(Object::String("k".into()), Object::Int(5))]))
        .unwrap();
    engine.vacuum();
    engine.vacuum();
    assert_eq!(engine.eval("CONFIG.k").unwrap(), Object::Int(5));
}

// --- Variable API ---

#[test]
fn var_api_round_trip() {
    let mut engine = Engine::new();
    engine.var_decl("x", Object::Int(10)).unwrap();
    assert_eq!(engine.var_get("x").unwrap(), Some(Object::Int(10)));
    engine.var_set("x", Object::String("now a string".into())).unwrap();
    assert_eq!(engine.eval("x").unwrap(), Object::String("now a string".into()));
    assert_eq!(engine.var_get("missing").unwrap(), None);
}

#[test]
fn const_vars_via_api_refuse_assignment() {
    let mut engine = Engine::new();
    engine.var_decl_const("pi", Object::Int(3)).unwrap();
    let exc = engine.var_set("pi", Object::Int(4)).unwrap_err();
    assert_eq!(exc.code, ResultCode::ConstViolation, "got: {exc}");
    let exc = engine.eval("pi = 4").unwrap_err();
    assert_eq!(exc.code, ResultCode::ConstViolation, "got: {exc}");
}

#[test]
fn duplicate_declaration_is_rejected() {
    let mut engine = Engine::new();
    engine.var_decl("d", Object::Int(1)).unwrap();
    let exc = engine.var_decl("d", Object::Int(2)).unwrap_err();
    assert_eq!(exc.code, ResultCode::AlreadyExists, "got: {exc}");
}

/// Variables persist across eval() calls on the same engine.
#[test]
fn state_persists_across_evals() {
    let mut engine = Engine::new();
    engine.eval("var counter = 0").unwrap();
    engine.eval("counter += 10").unwrap();
    assert_eq!(engine.eval("counter").unwrap(), Object::Int(10));
}

/// Containers round-trip through the Object boundary.
#[test]
fn container_objects_round_trip() {
    let mut engine = Engine::new();
    engine
        .var_decl(
            "data",
            Object::Array(vec![Object::Int(1), Object::String("two".into()), Object::Bool(true)]),
        )
        .unwrap();
    assert_eq!(engine.eval("data.length()").unwrap(), Object::Int(3));
    let back = engine.var_get("data").unwrap().unwrap();
    assert_eq!(
        back,
        Object::Array(vec![Object::Int(1), Object::String("two".into()), Object::Bool(true)])
    );
}

/// Cyclic graphs export with a cycle marker instead of diverging.
#[test]
fn cyclic_results_export_with_markers() {
    let mut engine = Engine::new();
    let result = engine.eval("var o = {}; o.self = o; o").unwrap();
    let Object::Object(pairs) = result else {
        panic!("expected an object result");
    };
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].1, Object::Repr("<cycle>".into()));
}

// --- eval_file ---

#[test]
fn eval_file_reads_and_runs() {
    let path = std::env::temp_dir().join("sorrel_eval_file_test.srl");
    std::fs::write(&path, "var v = 6 * 7; v").unwrap();
    let result = Engine::new().eval_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(result, Object::Int(42));
}

#[test]
fn eval_file_missing_is_an_io_error() {
    let exc = Engine::new()
        .eval_file(std::path::Path::new("/no/such/sorrel/file.srl"))
        .unwrap_err();
    assert_eq!(exc.code, ResultCode::Io, "got: {exc}");
}

// --- Feature mask (advisory) ---

#[test]
fn feature_mask_is_advisory_state() {
    use sorrel::FeatureMask;
    let mut engine = Engine::new();
    assert!(!engine.disabled_features().contains(FeatureMask::FS_READ));
    engine.set_disabled_features(FeatureMask::default().with(FeatureMask::FS_READ).with(FeatureMask::FS_STAT));
    assert!(engine.disabled_features().contains(FeatureMask::FS_READ));
    assert!(engine.disabled_features().contains(FeatureMask::FS_STAT));
    assert!(!engine.disabled_features().contains(FeatureMask::FS_WRITE));
    engine.set_disabled_features(engine.disabled_features().without(FeatureMask::FS_READ));
    assert!(!engine.disabled_features().contains(FeatureMask::FS_READ));
}
