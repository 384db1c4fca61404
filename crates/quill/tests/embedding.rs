//! Host-integration tests: bindings, bytecode transport, module
//! resolution, output capture, and cooperative cancellation.

use std::rc::Rc;

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use quill::{
    CancellationFlag, ErrorCode, EvalOptions, ExternalCallable, ExternalClassBinding, HostContext, HostResult,
    Interpreter, MemoryResolver, NoopTracer, ResourceLimits, SharedStringPrint, Value,
};

#[test]
fn print_goes_through_the_writer() {
    let writer = SharedStringPrint::new();
    let handle = writer.handle();
    let mut interpreter = Interpreter::new().with_writer(writer);
    interpreter.eval("print('hello', 42)").expect("eval");
    assert_eq!(handle.output(), "hello 42\n");
}

#[test]
fn external_function_structured_convention() {
    let mut interpreter = Interpreter::new();
    interpreter
        .init(
            vec![],
            vec![(
                "add_ints".to_owned(),
                ExternalCallable::Structured(Rc::new(|_ctx, args| {
                    let mut sum = 0i64;
                    for value in &args.positional {
                        let Value::Int(v) = value else {
                            return Err("add_ints takes integers".to_owned());
                        };
                        sum += v;
                    }
                    Ok(Value::Int(sum))
                })),
            )],
            vec![],
        )
        .expect("init");
    let result = interpreter
        .eval("external fun add_ints\nadd_ints(1, 2, 3)")
        .expect("eval");
    assert!(matches!(result, Value::Int(6)));
}

#[test]
fn external_function_errors_surface_as_external_errors() {
    let mut interpreter = Interpreter::new();
    interpreter
        .init(
            vec![],
            vec![(
                "boom".to_owned(),
                ExternalCallable::Positional(Rc::new(|_ctx, _args| Err("kaboom".to_owned()))),
            )],
            vec![],
        )
        .expect("init");
    let err = interpreter.eval("external fun boom\nboom()").expect_err("eval");
    assert_eq!(err.code, ErrorCode::ExternalError);
    assert!(err.message.contains("kaboom"));
}

#[test]
fn unregistered_external_function_is_reported() {
    let mut interpreter = Interpreter::new();
    let err = interpreter.eval("external fun nothing_here").expect_err("eval");
    assert_eq!(err.code, ErrorCode::UndefinedExternal);
}

struct ClockBinding;

impl ExternalClassBinding for ClockBinding {
    fn member_get(&self, _ctx: &mut HostContext<'_>, name: &str) -> HostResult {
        match name {
            "epoch" => Ok(Value::Int(0)),
            _ => Err(format!("no member `{name}`")),
        }
    }

    fn instance_member_get(&self, _ctx: &mut HostContext<'_>, _object: &Value, name: &str) -> HostResult {
        Err(format!("no instance member `{name}`"))
    }
}

#[test]
fn external_class_member_get_delegates_to_the_host() {
    let mut interpreter = Interpreter::new();
    interpreter
        .init(vec![("Clock".to_owned(), Rc::new(ClockBinding))], vec![], vec![])
        .expect("init");
    let result = interpreter
        .eval("external class Clock { }\nClock.epoch")
        .expect("eval");
    assert!(matches!(result, Value::Int(0)));
}

#[test]
fn compile_then_load_in_another_interpreter() {
    let mut compiler_side = Interpreter::new();
    let bytes = compiler_side.compile("fun add(a, b) => a + b").expect("compile");

    let mut runner_side = Interpreter::new();
    runner_side.load_bytecode(bytes).expect("load");
    let result = runner_side
        .invoke("add", vec![Value::Int(2), Value::Int(3)], IndexMap::new())
        .expect("invoke");
    assert!(matches!(result, Value::Int(5)));
}

#[test]
fn load_bytecode_rejects_garbage() {
    let mut interpreter = Interpreter::new();
    let err = interpreter.load_bytecode(vec![1, 2, 3, 4]).expect_err("load");
    assert_eq!(err.code, ErrorCode::BytesSignature);
}

#[test]
fn eval_with_invokes_a_function() {
    let mut interpreter = Interpreter::new();
    let result = interpreter
        .eval_with(
            "fun greet(name) => 'hi ' + name",
            EvalOptions {
                invoke_func: Some("greet".to_owned()),
                positional_args: vec![Value::str("quill")],
                ..EvalOptions::default()
            },
        )
        .expect("eval");
    let Value::Str(text) = result else {
        panic!("expected string, got {result:?}");
    };
    assert_eq!(&*text, "hi quill");
}

#[test]
fn imports_resolve_through_the_registered_sources() {
    let mut interpreter = Interpreter::new();
    interpreter
        .resolver_mut()
        .add("util.ql", "fun twice(x) => x * 2\nvar _hidden = 1");
    let result = interpreter.eval("import 'util.ql'\ntwice(21)").expect("eval");
    assert!(matches!(result, Value::Int(42)));
}

#[test]
fn underscore_names_are_not_exported() {
    let mut interpreter = Interpreter::new();
    interpreter
        .resolver_mut()
        .add("util.ql", "fun helper => 1\nvar _hidden = 2");
    let err = interpreter.eval("import 'util.ql'\n_hidden").expect_err("eval");
    assert_eq!(err.code, ErrorCode::Undefined);
}

#[test]
fn aliased_import_binds_a_namespace_object() {
    let mut interpreter = Interpreter::new();
    interpreter.resolver_mut().add("util.ql", "fun twice(x) => x * 2");
    let result = interpreter
        .eval("import 'util.ql' as util\nutil.twice(4)")
        .expect("eval");
    assert!(matches!(result, Value::Int(8)));
}

#[test]
fn show_list_limits_the_merge() {
    let mut interpreter = Interpreter::new();
    interpreter
        .resolver_mut()
        .add("util.ql", "fun wanted => 1\nfun unwanted => 2");
    let result = interpreter
        .eval("import 'util.ql' show wanted\nwanted()")
        .expect("eval");
    assert!(matches!(result, Value::Int(1)));
    let err = interpreter
        .eval("import 'util.ql' show wanted\nunwanted()")
        .expect_err("eval");
    assert_eq!(err.code, ErrorCode::Undefined);
}

#[test]
fn missing_import_reports_source_provider_error() {
    let mut interpreter = Interpreter::new();
    let err = interpreter.eval("import 'nowhere.ql'").expect_err("eval");
    assert_eq!(err.code, ErrorCode::SourceProviderError);
}

#[test]
fn transitive_imports_execute_dependency_first() {
    let mut interpreter = Interpreter::new();
    interpreter.resolver_mut().add("a.ql", "import 'b.ql'\nvar a = b + 1");
    interpreter.resolver_mut().add("b.ql", "var b = 10");
    let result = interpreter.eval("import 'a.ql'\na + b").expect("eval");
    assert!(matches!(result, Value::Int(21)));
}

#[test]
fn state_persists_across_evals() {
    let mut interpreter = Interpreter::new();
    interpreter.eval("fun stored(x) => x * 10").expect("first eval");
    let result = interpreter
        .invoke("stored", vec![Value::Int(7)], IndexMap::new())
        .expect("invoke");
    assert!(matches!(result, Value::Int(70)));
}

#[test]
fn cancellation_stops_a_loop() {
    let flag = CancellationFlag::new();
    flag.cancel();
    let limits = ResourceLimits::default().with_cancellation(flag);
    let mut interpreter =
        Interpreter::with_parts(MemoryResolver::new(), NoopTracer).with_limits(limits);
    let err = interpreter.eval("while (true) { }").expect_err("eval");
    assert_eq!(err.code, ErrorCode::Cancelled);
}

#[test]
fn unhandled_errors_route_to_the_registered_handler() {
    use std::cell::RefCell;

    let seen: Rc<RefCell<Option<ErrorCode>>> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&seen);
    let mut interpreter = Interpreter::new();
    interpreter.set_error_handler(move |err| {
        *sink.borrow_mut() = Some(err.code);
    });
    let result = interpreter
        .eval_with(
            "missing_symbol",
            EvalOptions {
                error_handled: false,
                ..EvalOptions::default()
            },
        )
        .expect("handler consumes the fault");
    assert!(matches!(result, Value::Null));
    assert_eq!(*seen.borrow(), Some(ErrorCode::Undefined));
}

#[test]
fn typedef_unwrapper_round_trips() {
    let mut interpreter = Interpreter::new();
    interpreter
        .init(
            vec![],
            vec![],
            vec![("Passthrough".to_owned(), Rc::new(|value: Value| value) as Rc<dyn Fn(Value) -> Value>)],
        )
        .expect("init");
    let function = interpreter.eval("fun id(x) => x\nid").expect("eval");
    let unwrapped = interpreter
        .unwrap_external_function_type("Passthrough", function)
        .expect("unwrap");
    assert!(matches!(unwrapped, Value::Ref(_)));
}
