//! Containers and the prototype model: objects, arrays, hashes, buffers,
//! tuples, `new`, `class`, `enum`, and operator overloading.

use sorrel::{Engine, Object, ResultCode};

fn eval(src: &str) -> Object {
    Engine::new().eval(src).unwrap()
}

#[test]
fn array_literal_and_length() {
    assert_eq!(eval("var a = [1, 2, 3]; a.length()"), Object::Int(3));
    assert_eq!(eval("[].length()"), Object::Int(0));
}

#[test]
fn array_index_read_write() {
    assert_eq!(eval("var a = [1, 2]; a[0] + a[1]"), Object::Int(3));
    assert_eq!(eval("var a = [1]; a[0] = 5; a[0]"), Object::Int(5));
    assert_eq!(eval("var a = []; a[3] = 1; a.length()"), Object::Int(4), "writes auto-extend with undef");
}

/// Empty brackets on the left of an assignment append.
#[test]
fn empty_bracket_append() {
    assert_eq!(eval("var a = []; a[] = 1; a[] = 2; a.length()"), Object::Int(2));
    assert_eq!(eval("var a = []; a[] = 7; a[0]"), Object::Int(7));
}

#[test]
fn array_methods() {
    assert_eq!(eval("var a = [1]; a.push(2, 3); a.length()"), Object::Int(3));
    assert_eq!(eval("var a = [1, 2]; a.pop()"), Object::Int(2));
    assert_eq!(eval("var a = [1, 2]; a.pop(); a.length()"), Object::Int(1));
    assert_eq!(eval("[1, 2, 3].join('-')"), Object::String("1-2-3".into()));
    assert_eq!(eval("[5, 6, 7].indexOf(6)"), Object::Int(1));
    assert_eq!(eval("[5, 6, 7].indexOf(9)"), Object::Int(-1));
    assert_eq!(eval("[1, 2, 3, 4].slice(1, 2).join(',')"), Object::String("2,3".into()));
    assert_eq!(eval("[1, 2, 3].reverse().join('')"), Object::String("321".into()));
}

#[test]
fn object_literal_properties() {
    assert_eq!(eval("var o = {a: 1}; o.a"), Object::Int(1));
    assert_eq!(eval("var o = {a: 1, 'spaced key': 2}; o['spaced key']"), Object::Int(2));
    assert_eq!(eval("var o = {}; o.x = 1; o.x"), Object::Int(1));
    assert_eq!(eval("var o = {a: 1}; o.a = 2; o.a"), Object::Int(2));
}

/// Property lookup is type-loose: integer 1 matches string "1".
#[test]
fn property_keys_are_type_loose() {
    assert_eq!(eval("var o = {}; o.set(1, 'one'); o.get('1')"), Object::String("one".into()));
    assert_eq!(eval("var o = {}; o[2] = 'two'; o['2']"), Object::String("two".into()));
}

/// Boolean keys are strict.
#[test]
fn boolean_property_keys_are_strict() {
    assert_eq!(
        eval("var o = {}; o.set(true, 'yes'); typeinfo(isundef o.get(1))"),
        Object::Bool(true)
    );
}

#[test]
fn object_methods() {
    assert_eq!(eval("var o = {a: 1, b: 2}; o.hasOwnProperty('a')"), Object::Bool(true));
    assert_eq!(eval("var o = {a: 1, b: 2}; o.propertyKeys().join(',')"), Object::String("a,b".into()));
    assert_eq!(eval("var o = {a: 1}; o.unset('a'); o.hasOwnProperty('a')"), Object::Bool(false));
    assert_eq!(eval("var o = {a: 41}; o.get('a') + 1"), Object::Int(42));
}

#[test]
fn string_methods() {
    assert_eq!(eval("'héllo'.length()"), Object::Int(5));
    assert_eq!(eval("'héllo'.byteLength()"), Object::Int(6));
    assert_eq!(eval("'abc'.isAscii()"), Object::Bool(true));
    assert_eq!(eval("'abc'.charAt(1)"), Object::String("b".into()));
    assert_eq!(eval("'hello'.indexOf('ll')"), Object::Int(2));
    assert_eq!(eval("'ab'.concat('cd', 7)"), Object::String("abcd7".into()));
    assert_eq!(eval("'aBc'.toUpper()"), Object::String("ABC".into()));
    assert_eq!(eval("'aBc'.toLower()"), Object::String("abc".into()));
    assert_eq!(eval("'a,b,c'.split(',').length()"), Object::Int(3));
    assert_eq!(eval("'hello'.substr(1, 3)"), Object::String("ell".into()));
    assert_eq!(eval("'  x  '.trim()"), Object::String("x".into()));
    assert_eq!(eval("'abc'[1]"), Object::String("b".into()));
}

/// Hashes keep their entry table separate from their property side.
#[test]
fn hash_entries_via_api_and_script() {
    let mut engine = Engine::new();
    engine
        .var_decl("h", Object::Hash(vec![(Object::String("k".into()), Object::Int(1))]))
        .unwrap();
    assert_eq!(engine.eval("h # 'k'").unwrap(), Object::Int(1));
    assert_eq!(engine.eval("h.insert('j', 2); h.size()").unwrap(), Object::Int(2));
    assert_eq!(engine.eval("h.search('j')").unwrap(), Object::Int(2));
    assert_eq!(engine.eval("h['j']").unwrap(), Object::Int(2));
    assert_eq!(engine.eval("h.containsEntry('nope')").unwrap(), Object::Bool(false));
    assert_eq!(engine.eval("h.remove('j'); h.size()").unwrap(), Object::Int(1));
    assert_eq!(engine.eval("h.#").unwrap(), Object::Int(1), "'.#' counts hash entries");
    // Property side does not see entries.
    assert_eq!(engine.eval("typeinfo(isundef h.k)").unwrap(), Object::Bool(true));
}

#[test]
fn tuples_are_fixed_and_indexable() {
    let mut engine = Engine::new();
    engine
        .var_decl("t", Object::Tuple(vec![Object::Int(10), Object::Int(20)]))
        .unwrap();
    assert_eq!(engine.eval("t.length()").unwrap(), Object::Int(2));
    assert_eq!(engine.eval("t[1]").unwrap(), Object::Int(20));
    assert_eq!(engine.eval("t.join('+')").unwrap(), Object::String("10+20".into()));
    let exc = engine.eval("t[5]").unwrap_err();
    assert_eq!(exc.code, ResultCode::Range, "tuple indexes are bounds-checked: {exc}");
}

#[test]
fn buffers_append_and_render() {
    let mut engine = Engine::new();
    engine.var_decl("b", Object::Buffer(Vec::new())).unwrap();
    assert_eq!(engine.eval("b.append('ab').append(12); b.toString()").unwrap(), Object::String("ab12".into()));
    assert_eq!(engine.eval("b.length()").unwrap(), Object::Int(4));
    assert_eq!(engine.eval("b.reset(); b.length()").unwrap(), Object::Int(0));
}

/// Prototype chains resolve inherited properties; `inherits` tests them.
#[test]
fn prototype_chain_resolution() {
    let mut engine = Engine::new();
    engine.eval("var base = {greet: proc() { return 'hi' }}; var kid = {}").unwrap();
    engine.prototype_set("kid", "base").unwrap();
    assert_eq!(engine.eval("kid.greet()").unwrap(), Object::String("hi".into()));
    assert_eq!(engine.eval("kid inherits base").unwrap(), Object::Bool(true));
    assert!(engine.derives_from("kid", "base").unwrap());
}

/// `->` sees only own properties; `::` sees only the prototype chain.
#[test]
fn arrow_and_proto_lookup_operators() {
    let mut engine = Engine::new();
    engine.eval("var base = {p: 'proto'}; var kid = {o: 'own'}").unwrap();
    engine.prototype_set("kid", "base").unwrap();
    assert_eq!(engine.eval("kid->o").unwrap(), Object::String("own".into()));
    assert_eq!(engine.eval("typeinfo(isundef kid->p)").unwrap(), Object::Bool(true));
    assert_eq!(engine.eval("kid::p").unwrap(), Object::String("proto".into()));
}

/// `?.` yields undef for undef/null targets instead of failing.
#[test]
fn safe_dot() {
    assert_eq!(eval("typeinfo(isundef undefined?.x)"), Object::Bool(true));
    let exc = Engine::new().eval("undefined.x").unwrap_err();
    assert_eq!(exc.code, ResultCode::Type, "plain dot on undefined throws: {exc}");
}

#[test]
fn new_with_constructor() {
    let src = "class Point {
            __new: proc(x, y) { this.x = x; this.y = y }
        };
        var p = new Point(3, 4);
        p.x + p.y";
    assert_eq!(eval(src), Object::Int(7));
}

#[test]
fn new_instances_inherit_methods() {
    let src = "class Counter {
            __new: proc(start = 0) { this.n = start },
            bump: proc() { this.n += 1; return this.n }
        };
        var c = new Counter(40);
        c.bump();
        c.bump()";
    assert_eq!(eval(src), Object::Int(42));
}

#[test]
fn instances_inherit_and_classes_extend() {
    let src = "class Animal { speak: proc() { return 'generic' } };
        class Dog extends Animal { speak: proc() { return 'woof' } };
        var d = new Dog();
        d.speak() + ':' + (d inherits Animal)";
    assert_eq!(eval(src), Object::String("woof:true".into()));
}

#[test]
fn enums_wrap_entries_in_uniques() {
    assert_eq!(
        eval("enum Color { Red, Green: 3, Blue }; typeinfo(isunique Color.Red)"),
        Object::Bool(true)
    );
    assert_eq!(eval("enum Color { Red, Green: 3 }; Color.Green.value()"), Object::Int(3));
    assert_eq!(
        eval("enum Color { Red, Green }; Color[Color.Red]"),
        Object::String("Red".into()),
        "enums carry a reverse entry-to-name mapping"
    );
}

#[test]
fn enums_are_sealed() {
    let result = eval("enum Color { Red }; catch { Color.New = 1 }.codeString()");
    assert_eq!(result, Object::String("DisallowPropSet".into()));
}

#[test]
fn const_properties_refuse_assignment() {
    let result = eval("enum E { A }; catch { unset E.A }.codeString()");
    assert_eq!(result, Object::String("ConstViolation".into()));
}

/// Arithmetic on containers consults `operator+` on the prototype chain.
#[test]
fn operator_overloading_via_prototype() {
    let src = "var vec = {
            x: 1,
            'operator+': proc(rhs) { return this.x + rhs }
        };
        vec + 41";
    assert_eq!(eval(src), Object::Int(42));
}

#[test]
fn comparison_overloading() {
    let src = "var box = {
            n: 5,
            'operator==': proc(rhs) { return this.n == rhs }
        };
        box == 5";
    assert_eq!(eval(src), Object::Bool(true));
}

/// Every comparison operator consults its own method name, so `<=` can be
/// reflexive even when `<` is strict.
#[test]
fn each_comparison_operator_has_its_own_overload() {
    let src = "var box = {
            n: 5,
            'operator<':  proc(rhs) { return this.n < rhs },
            'operator<=': proc(rhs) { return this.n <= rhs },
            'operator>':  proc(rhs) { return this.n > rhs },
            'operator>=': proc(rhs) { return this.n >= rhs },
            'operator!=': proc(rhs) { return this.n != rhs }
        };
        (box < 5) + ':' + (box <= 5) + ':' + (box > 5) + ':' + (box >= 5) + ':' + (box != 5)";
    assert_eq!(eval(src), Object::String("false:true:false:true:false".into()));
}

/// `<=` does not borrow the `<` method: with only `operator<` defined, the
/// other relational forms fall back to the built-in comparison (which
/// rejects containers).
#[test]
fn relational_overloads_do_not_substitute_for_each_other() {
    let src = "var box = {'operator<': proc(rhs) { return true }};
        catch { box <= 5 }.codeString()";
    assert_eq!(eval(src), Object::String("Type".into()));
    assert_eq!(
        eval("var box = {'operator<': proc(rhs) { return true }}; box < 99"),
        Object::Bool(true)
    );
}

/// `!~` is the one derived comparison: the negation of the `=~` method.
#[test]
fn not_contains_derives_from_the_contains_overload() {
    let src = "var bag = {'operator=~': proc(rhs) { return rhs == 1 }};
        (bag =~ 1) + ':' + (bag !~ 1) + ':' + (bag !~ 2)";
    assert_eq!(eval(src), Object::String("true:false:true".into()));
}

/// Buffers and tuples are rejected as property keys.
#[test]
fn buffers_are_not_usable_as_keys() {
    let mut engine = Engine::new();
    engine.var_decl("b", Object::Buffer(vec![1])).unwrap();
    let exc = engine.eval("var o = {}; o.set(b, 1)").unwrap_err();
    assert_eq!(exc.code, ResultCode::Type, "got: {exc}");
}

#[test]
fn with_this_rebinds() {
    assert_eq!(
        eval("var o = {x: 6}; o.withThis(proc() { return this.x * 7 })"),
        Object::Int(42)
    );
}

#[test]
fn to_string_and_type_name() {
    assert_eq!(eval("(42).toString()"), Object::String("42".into()));
    assert_eq!(eval("(1.5).typeName()"), Object::String("double".into()));
    assert_eq!(eval("[1].typeName()"), Object::String("array".into()));
}
