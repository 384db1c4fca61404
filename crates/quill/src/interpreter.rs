//! The embedding API.
//!
//! An [`Interpreter`] owns everything persistent: the heap and namespace
//! arenas, loaded images, host bindings, and the module namespaces of
//! every executed module. Evaluations share that state, so a function
//! defined by one `eval` stays invokable afterwards.

use std::rc::Rc;

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    compiler::compile_bundle,
    error::{ErrorCode, ErrorSeverity, QuillError, QuillResult},
    external::{ExternalBindings, ExternalCallable, ExternalClassBinding},
    heap::Heap,
    image::Image,
    io::{PrintWriter, StdPrint},
    module::{MemoryResolver, ModuleLoader, SourceResolver},
    namespace::{NamespaceId, Namespaces},
    resource::ResourceLimits,
    tracer::{NoopTracer, VmTracer},
    value::Value,
    vm::{GatheredArgs, Vm},
};

/// Core module preincluded at `init`: the bindings every script can rely
/// on without importing anything.
const PRELUDE_KEY: &str = "core/prelude.ql";
const PRELUDE_SOURCE: &str = "external fun print\n";

/// Options for [`Interpreter::eval`].
#[derive(Debug)]
pub struct EvalOptions {
    /// Function to invoke after the source has run.
    pub invoke_func: Option<String>,
    pub positional_args: Vec<Value>,
    pub named_args: IndexMap<String, Value>,
    /// Advisory type arguments for the invocation.
    pub type_args: Vec<String>,
    /// When `false`, a fault is routed to the registered error handler
    /// instead of being returned, and the evaluation yields null.
    pub error_handled: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            invoke_func: None,
            positional_args: Vec::new(),
            named_args: IndexMap::new(),
            type_args: Vec::new(),
            error_handled: true,
        }
    }
}

/// One embedded interpreter instance.
///
/// Generic over the source resolver (where imports come from) and the
/// VM tracer; defaults are an in-memory source map and the zero-cost
/// no-op tracer.
pub struct Interpreter<R: SourceResolver = MemoryResolver, Tr: VmTracer = NoopTracer> {
    loader: ModuleLoader<R>,
    heap: Heap,
    namespaces: Namespaces,
    bindings: ExternalBindings,
    module_namespaces: AHashMap<String, NamespaceId>,
    images: Vec<Rc<Image>>,
    global: NamespaceId,
    entry_ns: Option<NamespaceId>,
    limits: ResourceLimits,
    out: Box<dyn PrintWriter>,
    tracer: Tr,
    error_handler: Option<Rc<dyn Fn(&QuillError)>>,
    eval_counter: u32,
    core_loaded: bool,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// An interpreter with an empty in-memory resolver, stdout printing,
    /// and default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(MemoryResolver::new(), NoopTracer)
    }
}

impl<R: SourceResolver, Tr: VmTracer> Interpreter<R, Tr> {
    #[must_use]
    pub fn with_parts(resolver: R, tracer: Tr) -> Self {
        let mut namespaces = Namespaces::new();
        let global = namespaces.create("global", None);
        Self {
            loader: ModuleLoader::new(resolver),
            heap: Heap::new(),
            namespaces,
            bindings: ExternalBindings::new(),
            module_namespaces: AHashMap::new(),
            images: Vec::new(),
            global,
            entry_ns: None,
            limits: ResourceLimits::default(),
            out: Box::new(StdPrint::default()),
            tracer,
            error_handler: None,
            eval_counter: 0,
            core_loaded: false,
        }
    }

    /// Registers the handler faults are routed to when an evaluation
    /// opts out of receiving them (`error_handled: false`).
    pub fn set_error_handler(&mut self, handler: impl Fn(&QuillError) + 'static) {
        self.error_handler = Some(Rc::new(handler));
    }

    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_writer(mut self, writer: impl PrintWriter + 'static) -> Self {
        self.out = Box::new(writer);
        self
    }

    /// The resolver imports go through; mutable so hosts can add sources.
    pub fn resolver_mut(&mut self) -> &mut R {
        self.loader.resolver_mut()
    }

    /// Registers host bindings and loads the preincluded core module.
    pub fn init(
        &mut self,
        external_classes: Vec<(String, Rc<dyn ExternalClassBinding>)>,
        external_functions: Vec<(String, ExternalCallable)>,
        external_function_typedefs: Vec<(String, Rc<dyn Fn(Value) -> Value>)>,
    ) -> QuillResult<()> {
        for (name, binding) in external_classes {
            self.bindings.register_class(name, binding);
        }
        for (name, callable) in external_functions {
            self.bindings.register_function(name, callable);
        }
        for (tag, unwrapper) in external_function_typedefs {
            self.bindings.register_typedef(tag, unwrapper);
        }
        self.ensure_core()
    }

    /// Registers the engine-provided externals and evaluates the
    /// prelude. Runs once; `eval` calls it implicitly when `init` was
    /// never invoked.
    fn ensure_core(&mut self) -> QuillResult<()> {
        if self.core_loaded {
            return Ok(());
        }
        self.core_loaded = true;
        if self.bindings.function("print").is_none() {
            self.bindings.register_function(
                "print",
                ExternalCallable::Structured(Rc::new(|ctx, args| {
                    for (i, value) in args.positional.iter().enumerate() {
                        if i > 0 {
                            ctx.out.push(' ');
                        }
                        ctx.out.write(&value.display(ctx.heap));
                    }
                    ctx.out.push('\n');
                    Ok(Value::Null)
                })),
            );
        }
        let entry_before = self.entry_ns;
        let bytes = self.compile_keyed(PRELUDE_SOURCE, PRELUDE_KEY)?;
        self.load_bytecode(bytes)?;
        // the prelude's own namespace is not the host's entry
        self.entry_ns = entry_before;
        // prelude declarations are importable everywhere: merge them into
        // the global namespace
        if let Some(&prelude_ns) = self.module_namespaces.get(PRELUDE_KEY) {
            let exported: Vec<_> = self
                .namespaces
                .get(prelude_ns)
                .iter()
                .filter(|(_, declaration)| declaration.is_exported())
                .map(|(_, declaration)| declaration.clone())
                .collect();
            for declaration in exported {
                self.namespaces.define(self.global, declaration, true)?;
            }
        }
        Ok(())
    }

    /// Parses, compiles, and runs a source, then optionally invokes a
    /// named function. Returns the produced value.
    pub fn eval(&mut self, source: &str) -> QuillResult<Value> {
        self.eval_with(source, EvalOptions::default())
    }

    pub fn eval_with(&mut self, source: &str, options: EvalOptions) -> QuillResult<Value> {
        let error_handled = options.error_handled;
        let result = self.eval_inner(source, options);
        match result {
            Err(error) if !error_handled => {
                if let Some(handler) = self.error_handler.clone() {
                    handler(&error);
                    Ok(Value::Null)
                } else {
                    Err(error)
                }
            }
            other => other,
        }
    }

    fn eval_inner(&mut self, source: &str, options: EvalOptions) -> QuillResult<Value> {
        self.ensure_core()?;
        self.eval_counter += 1;
        let key = format!("script_{}.ql", self.eval_counter);
        let bytes = self.compile_keyed(source, &key)?;
        let result = self.load_bytecode(bytes)?;
        match options.invoke_func {
            Some(name) => self.invoke(&name, options.positional_args, options.named_args),
            None => Ok(result),
        }
    }

    /// Compiles a source to a bytecode image without running it.
    pub fn compile(&mut self, source: &str) -> QuillResult<Vec<u8>> {
        self.eval_counter += 1;
        let key = format!("script_{}.ql", self.eval_counter);
        self.compile_keyed(source, &key)
    }

    fn compile_keyed(&mut self, source: &str, key: &str) -> QuillResult<Vec<u8>> {
        let bundle = self.loader.parse_to_compilation(source, key, None);
        if let Some(error) = bundle
            .errors()
            .into_iter()
            .find(|e| e.severity >= ErrorSeverity::Error)
        {
            return Err(error);
        }
        compile_bundle(&bundle)
    }

    /// Loads a compiled image and executes its module blocks, returning
    /// the entry module's final value.
    pub fn load_bytecode(&mut self, bytes: Vec<u8>) -> QuillResult<Value> {
        let image = Rc::new(Image::from_bytes(bytes)?);
        self.images.push(image);
        let index = self.images.len() - 1;
        let mut vm = Vm::new(
            &self.images,
            &mut self.heap,
            &mut self.namespaces,
            &self.bindings,
            &mut self.module_namespaces,
            self.out.as_mut(),
            &self.limits,
            &mut self.tracer,
            self.global,
        );
        let result = vm.run_image(index);
        if let Some(ns) = vm.entry_namespace() {
            self.entry_ns = Some(ns);
        }
        result
    }

    /// Invokes a function declared at the top level of the last entry
    /// module (or the global namespace).
    pub fn invoke(
        &mut self,
        name: &str,
        positional_args: Vec<Value>,
        named_args: IndexMap<String, Value>,
    ) -> QuillResult<Value> {
        let ns = self.entry_ns.unwrap_or(self.global);
        let mut vm = Vm::new(
            &self.images,
            &mut self.heap,
            &mut self.namespaces,
            &self.bindings,
            &mut self.module_namespaces,
            self.out.as_mut(),
            &self.limits,
            &mut self.tracer,
            self.global,
        );
        let mut args = GatheredArgs::default();
        args.positional.extend(positional_args);
        args.named = named_args;
        vm.invoke(ns, name, args)
    }

    /// Renders a value the way script-level `toString` would.
    #[must_use]
    pub fn display(&self, value: &Value) -> String {
        value.display(&self.heap)
    }

    // --- binding surface --------------------------------------------------

    /// Host-ready view of a registered external class.
    #[must_use]
    pub fn fetch_external_class(&self, name: &str) -> Option<Rc<dyn ExternalClassBinding>> {
        self.bindings.class(name)
    }

    /// Host-ready callable for a registered external function.
    #[must_use]
    pub fn fetch_external_function(&self, name: &str) -> Option<ExternalCallable> {
        self.bindings.function(name)
    }

    /// Unwraps a script function value into a host-ready callable using
    /// the registered typedef unwrapper for `tag`.
    pub fn unwrap_external_function_type(&self, tag: &str, function: Value) -> QuillResult<Value> {
        let unwrapper = self.bindings.typedef(tag).ok_or_else(|| {
            QuillError::positionless(
                ErrorCode::UndefinedExternal,
                format!("no external function typedef `{tag}`"),
            )
        })?;
        Ok(unwrapper(function))
    }
}
