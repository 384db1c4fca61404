//! End-to-end language tests driven through the embedding API.

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use quill::{ErrorCode, Interpreter, QuillError, Value};

fn eval(source: &str) -> Value {
    let mut interpreter = Interpreter::new();
    match interpreter.eval(source) {
        Ok(value) => value,
        Err(err) => panic!("eval failed: {err}"),
    }
}

fn eval_err(source: &str) -> QuillError {
    let mut interpreter = Interpreter::new();
    match interpreter.eval(source) {
        Ok(value) => panic!("expected an error, got {value:?}"),
        Err(err) => err,
    }
}

fn eval_int(source: &str) -> i64 {
    match eval(source) {
        Value::Int(v) => v,
        other => panic!("expected int, got {other:?}"),
    }
}

fn eval_str(source: &str) -> String {
    match eval(source) {
        Value::Str(s) => s.to_string(),
        other => panic!("expected string, got {other:?}"),
    }
}

fn eval_bool(source: &str) -> bool {
    match eval(source) {
        Value::Bool(b) => b,
        other => panic!("expected bool, got {other:?}"),
    }
}

fn invoke(source: &str, name: &str, positional: Vec<Value>, named: &[(&str, Value)]) -> Result<Value, QuillError> {
    let mut interpreter = Interpreter::new();
    interpreter.eval(source).expect("eval");
    let named: IndexMap<String, Value> = named.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect();
    interpreter.invoke(name, positional, named)
}

// --- arithmetic and operators -------------------------------------------

#[test]
fn arithmetic_precedence() {
    assert_eq!(eval_int("1 + 2 * 3"), 7);
    assert_eq!(eval_int("(1 + 2) * 3"), 9);
    assert_eq!(eval_int("7 / 2"), 3);
    assert_eq!(eval_int("7 % 3"), 1);
    assert_eq!(eval_int("-3 + 1"), -2);
}

#[test]
fn float_arithmetic_promotes() {
    match eval("1 + 0.5") {
        Value::Float(v) => assert!((v - 1.5).abs() < f64::EPSILON),
        other => panic!("expected float, got {other:?}"),
    }
}

#[test]
fn string_concatenation() {
    assert_eq!(eval_str("'a' + 'b'"), "ab");
    assert_eq!(eval_str("'n = ' + 42"), "n = 42");
}

#[test]
fn comparison_and_equality() {
    assert!(eval_bool("1 < 2"));
    assert!(eval_bool("2 <= 2"));
    assert!(eval_bool("2 == 2.0"));
    assert!(eval_bool("'a' != 'b'"));
    assert!(eval_bool("'a' < 'b'"));
}

#[test]
fn ternary_expression() {
    assert_eq!(eval_str("(1 < 2) ? 'yes' : 'no'"), "yes");
    assert_eq!(eval_str("(1 > 2) ? 'yes' : 'no'"), "no");
}

#[test]
fn short_circuit_evaluates_side_effect_exactly_once() {
    let source = "
        var n = 0
        fun se { n = n + 1; return false }
        se() || true
        se() && false
        n
    ";
    assert_eq!(eval_int(source), 2);
}

#[test]
fn logical_or_skips_right_operand_when_left_is_truthy() {
    let source = "
        var n = 0
        fun bump { n = n + 1; return true }
        true || bump()
        false && bump()
        n
    ";
    assert_eq!(eval_int(source), 0);
}

// --- variables and scope -------------------------------------------------

#[test]
fn lexical_shadowing_is_scoped() {
    let source = "
        var x = 1
        {
            var x = 2
        }
        x
    ";
    assert_eq!(eval_int(source), 1);
}

#[test]
fn assignment_to_immutable_fails() {
    let err = eval_err("final k = 1\nk = 2");
    assert_eq!(err.code, ErrorCode::Immutable);
}

#[test]
fn const_requires_initializer() {
    let err = eval_err("const c");
    assert_eq!(err.code, ErrorCode::ConstMustInit);
}

#[test]
fn undefined_symbol_is_reported() {
    let err = eval_err("missing");
    assert_eq!(err.code, ErrorCode::Undefined);
}

#[test]
fn duplicate_definition_is_reported() {
    let err = eval_err("var a = 1\nvar a = 2");
    assert_eq!(err.code, ErrorCode::Defined);
}

#[test]
fn compound_assignment_and_increment() {
    assert_eq!(eval_int("var x = 10\nx += 5\nx -= 3\nx *= 2\nx"), 24);
    assert_eq!(eval_int("var i = 1\ni++\ni++\ni"), 3);
}

// --- functions -----------------------------------------------------------

#[test]
fn named_and_optional_arguments() {
    let source = "fun f(a, [b = 2], {c = 3}) => a + b + c";
    let result = invoke(source, "f", vec![Value::Int(10)], &[]).expect("f(10)");
    assert!(matches!(result, Value::Int(15)));
    let result = invoke(source, "f", vec![Value::Int(10), Value::Int(20)], &[]).expect("f(10, 20)");
    assert!(matches!(result, Value::Int(25)));
    let result = invoke(
        source,
        "f",
        vec![Value::Int(10), Value::Int(20)],
        &[("c", Value::Int(30))],
    )
    .expect("f(10, 20, c: 30)");
    assert!(matches!(result, Value::Int(60)));
}

#[test]
fn excess_positional_arguments_raise_arity() {
    let source = "fun f(a, [b = 2], {c = 3}) => a + b + c";
    let err = invoke(
        source,
        "f",
        vec![Value::Int(10), Value::Int(20), Value::Int(30), Value::Int(40)],
        &[],
    )
    .expect_err("four positional arguments");
    assert_eq!(err.code, ErrorCode::Arity);
}

#[test]
fn missing_required_argument_raises_arity() {
    let err = eval_err("fun g(a, b) { return a }\ng(1)");
    assert_eq!(err.code, ErrorCode::Arity);
}

#[test]
fn unknown_named_argument_is_rejected() {
    let err = eval_err("fun f(a) => a\nf(1, nope: 2)");
    assert_eq!(err.code, ErrorCode::NamedArg);
}

#[test]
fn variadic_parameter_packs_the_rest() {
    let source = "
        fun tally(first, ...rest) {
            var sum = first
            for (var r in rest) {
                sum = sum + r
            }
            return sum
        }
        tally(1, 2, 3, 4)
    ";
    assert_eq!(eval_int(source), 10);
}

#[test]
fn named_calls_in_source_text() {
    assert_eq!(eval_int("fun f(a, [b = 2], {c = 3}) => a + b + c\nf(10, 20, c: 30)"), 60);
}

#[test]
fn closures_capture_their_defining_namespace() {
    let source = "
        fun makeCounter {
            var n = 0
            return fun {
                n = n + 1
                return n
            }
        }
        var c = makeCounter()
        c()
        c()
    ";
    assert_eq!(eval_int(source), 2);
}

#[test]
fn arrow_functions_are_first_class() {
    let source = "
        var twice = (f, x) => f(f(x))
        twice((n) => n + 1, 5)
    ";
    assert_eq!(eval_int(source), 7);
}

#[test]
fn recursion_limit_raises_stack_overflow() {
    let err = eval_err("fun r() { return r() }\nr()");
    assert_eq!(err.code, ErrorCode::StackOverflow);
    assert!(!err.stack_trace.is_empty(), "unwinding must record frames");
}

// --- control flow --------------------------------------------------------

#[test]
fn while_loop_counts() {
    let source = "
        var i = 0
        while (i < 5) {
            i = i + 1
        }
        i
    ";
    assert_eq!(eval_int(source), 5);
}

#[test]
fn do_while_runs_body_first() {
    let source = "
        var i = 0
        do {
            i = i + 1
        } while (i < 3)
        i
    ";
    assert_eq!(eval_int(source), 3);
}

#[test]
fn c_style_for_with_break_and_continue() {
    let source = "
        fun bc {
            var s = 0
            for (var i = 0; i < 10; i++) {
                if (i == 3) { continue }
                if (i == 5) { break }
                s = s + i
            }
            return s
        }
        bc()
    ";
    assert_eq!(eval_int(source), 7);
}

#[test]
fn for_in_lowers_to_an_index_loop() {
    let source = "
        fun total {
            var s = 0
            for (var x in [1, 2, 3, 4]) {
                s = s + x
            }
            return s
        }
        total()
    ";
    assert_eq!(eval_int(source), 10);
}

#[test]
fn for_in_over_empty_list_skips_the_body() {
    let source = "
        var hits = 0
        for (var x in []) {
            hits = hits + 1
        }
        hits
    ";
    assert_eq!(eval_int(source), 0);
}

#[test]
fn when_dispatches_on_subject() {
    let source = "
        fun w(x) {
            when (x) {
                1 => return 'one',
                2 => return 'two'
                else => return 'other'
            }
        }
        w(2)
    ";
    assert_eq!(eval_str(source), "two");
}

#[test]
fn when_without_match_falls_to_else() {
    let source = "
        fun w(x) {
            when (x) {
                1 => return 'one'
                else => return 'other'
            }
        }
        w(99)
    ";
    assert_eq!(eval_str(source), "other");
}

#[test]
fn if_works_in_expression_position() {
    assert_eq!(eval_int("var x = if (true) { 1 } else { 2 }\nx"), 1);
}

// --- strings and interpolation ------------------------------------------

#[test]
fn string_interpolation_renders_segments() {
    assert_eq!(eval_str("var a = 3\n'val: ${a + 1}'"), "val: 4");
    assert_eq!(eval_str("'${1}${2}'"), "12");
}

#[test]
fn interpolation_segment_must_be_one_expression() {
    let err = eval_err("'${var x = 1}'");
    assert_eq!(err.code, ErrorCode::StringInterpolation);
}

#[test]
fn string_members() {
    assert_eq!(eval_int("'abc'.length"), 3);
    assert!(eval_bool("''.isEmpty"));
    assert!(eval_bool("'x'.isNotEmpty"));
    assert_eq!(eval_str("'abc'[1]"), "b");
}

// --- lists ---------------------------------------------------------------

#[test]
fn list_members_and_subscripts() {
    assert_eq!(eval_int("[1, 2, 3].length"), 3);
    assert_eq!(eval_int("[7, 8][1]"), 8);
    assert_eq!(eval_int("var l = [1]\nl.add(2, 3)\nl.length"), 3);
    assert_eq!(eval_int("var l = [5, 6]\nl[0] = 9\nl[0]"), 9);
    assert!(eval_bool("[1, 2].contains(2)"));
    assert_eq!(eval_int("[1, 2] + [3]\n([1, 2] + [3]).length"), 3);
}

#[test]
fn list_index_out_of_range() {
    let err = eval_err("[1][5]");
    assert_eq!(err.code, ErrorCode::OutOfRange);
}

// --- structs -------------------------------------------------------------

#[test]
fn basic_struct_to_string() {
    let source =
        "fun t { var f = { value: 42, greeting: 'hi!' }; f.value = 'ha!'; f.world = 'everything'; return f.toString() }";
    let result = invoke(source, "t", vec![], &[]).expect("t()");
    let Value::Str(text) = result else {
        panic!("expected string, got {result:?}");
    };
    assert_eq!(&*text, "{\n  value: ha!,\n  greeting: hi!,\n  world: everything\n}");
}

#[test]
fn struct_reads_walk_the_prototype_chain() {
    let source = "
        struct Base { greeting: 'hi!' }
        struct Child extends Base { own: 1 }
        Child.greeting
    ";
    assert_eq!(eval_str(source), "hi!");
}

#[test]
fn struct_writes_target_the_receiver() {
    let source = "
        struct Base { value: 1 }
        struct Child extends Base { }
        Child.value = 2
        Base.value
    ";
    assert_eq!(eval_int(source), 1);
    let source = "
        struct Base { value: 1 }
        struct Child extends Base { }
        Child.value = 2
        Child.value
    ";
    assert_eq!(eval_int(source), 2);
}

#[test]
fn struct_missing_member_reads_null() {
    assert!(matches!(eval("var s = { a: 1 }\ns.missing"), Value::Null));
}

#[test]
fn struct_functions_bind_the_receiver() {
    let source = "
        var obj = {
            count: 2,
            double: fun { return this.count * 2 }
        }
        obj.double()
    ";
    assert_eq!(eval_int(source), 4);
}

#[test]
fn struct_keys_and_contains_key() {
    assert!(eval_bool("var s = { a: 1 }\ns.containsKey('a')"));
    assert_eq!(eval_int("var s = { a: 1, b: 2 }\ns.keys().length"), 2);
}

// --- classes -------------------------------------------------------------

#[test]
fn inheritance_and_super_constructor_call() {
    let source = "
        class A {
            construct(x) {
                this.x = x
            }
        }
        class B extends A {
            construct(y) : super(y * 2) {
                this.y = y
            }
        }
    ";
    assert_eq!(eval_int(&format!("{source}\nB(3).x")), 6);
    assert_eq!(eval_int(&format!("{source}\nB(3).y")), 3);
}

#[test]
fn methods_and_fields() {
    let source = "
        class Point {
            var x = 0
            var y = 0
            fun sum { return this.x + this.y }
        }
        var p = Point()
        p.x = 3
        p.y = 4
        p.sum()
    ";
    assert_eq!(eval_int(source), 7);
}

#[test]
fn getters_and_setters() {
    let source = "
        class Cell {
            var raw = 1
            get twice { return this.raw * 2 }
            set twice(v) { this.raw = v / 2 }
        }
        var c = Cell()
    ";
    assert_eq!(eval_int(&format!("{source}\nc.twice")), 2);
    assert_eq!(eval_int(&format!("{source}\nc.twice = 10\nc.raw")), 5);
}

#[test]
fn static_members_live_on_the_class() {
    let source = "
        class Counter {
            static var count = 41
        }
        Counter.count = Counter.count + 1
        Counter.count
    ";
    assert_eq!(eval_int(source), 42);
}

#[test]
fn method_overriding_and_super_dispatch() {
    let source = "
        class Animal {
            fun speak { return 'generic' }
        }
        class Dog extends Animal {
            fun speak { return 'woof ' + super.speak() }
        }
        Dog().speak()
    ";
    assert_eq!(eval_str(source), "woof generic");
}

#[test]
fn named_constructors_redirect_to_this() {
    let source = "
        class Size {
            construct(w, h) {
                this.w = w
                this.h = h
            }
            construct square(edge) : this(edge, edge) {
            }
        }
        var s = Size.square(5)
        s.w + s.h
    ";
    assert_eq!(eval_int(source), 10);
}

#[test]
fn abstract_classes_cannot_be_instantiated() {
    let err = eval_err("abstract class Shape { }\nShape()");
    assert_eq!(err.code, ErrorCode::NotCallable);
}

#[test]
fn instance_type_checks_cover_the_chain() {
    let source = "
        class A { }
        class B extends A { }
    ";
    assert!(eval_bool(&format!("{source}\nB() is A")));
    assert!(eval_bool(&format!("{source}\nB() is B")));
    assert!(!eval_bool(&format!("{source}\nA() is B")));
}

// --- enums ---------------------------------------------------------------

#[test]
fn enum_values_in_declaration_order() {
    assert_eq!(eval_int("enum E { a, b }\nE.values.length"), 2);
}

#[test]
fn enum_to_string_includes_the_enum_name() {
    assert_eq!(eval_str("enum E { a, b }\nE.a.toString()"), "E.a");
    assert_eq!(eval_str("enum Color { red, green, blue }\nColor.blue.toString()"), "Color.blue");
}

#[test]
fn enum_members_are_singletons() {
    assert!(eval_bool("enum E { a, b }\nE.a == E.a"));
    assert!(!eval_bool("enum E { a, b }\nE.a == E.b"));
}

// --- types ---------------------------------------------------------------

#[test]
fn type_checks_and_typeof() {
    assert!(eval_bool("1 is num"));
    assert!(eval_bool("1.5 is float"));
    assert!(eval_bool("1.5 is! int"));
    assert!(eval_bool("'x' is str"));
    assert_eq!(eval_str("(typeof 'x').name"), "str");
}

#[test]
fn type_aliases_resolve_in_checks() {
    assert!(eval_bool("type Id = num\n1 is Id"));
    assert!(!eval_bool("type Name = str\n1 is Name"));
}

#[test]
fn type_cast_converts_or_faults() {
    match eval("1 as float") {
        Value::Float(v) => assert!((v - 1.0).abs() < f64::EPSILON),
        other => panic!("expected float, got {other:?}"),
    }
    assert_eq!(eval_str("42 as str"), "42");
    let err = eval_err("'a' as num");
    assert_eq!(err.code, ErrorCode::TypeCast);
}

// --- errors --------------------------------------------------------------

#[test]
fn member_access_on_null_faults() {
    let err = eval_err("null.x");
    assert_eq!(err.code, ErrorCode::NullObject);
}

#[test]
fn errors_carry_module_and_position() {
    let err = eval_err("var ok = 1\nmissing");
    assert_eq!(err.code, ErrorCode::Undefined);
    assert!(err.module.is_some());
    assert_eq!(err.line, 2);
}
