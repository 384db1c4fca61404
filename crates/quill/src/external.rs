//! The host binding surface.
//!
//! A host registers external classes, external functions, and external
//! function typedef unwrappers at `init` time. External functions follow
//! one of three conventions:
//!
//! 1. **Structured**: `(positional list, named map, type arguments)`.
//! 2. **Positional-only**: applied through the host's generic apply.
//! 3. **External method**: receiver plus the structured convention.
//!
//! Engine-provided members on primitive values (list `add`, universal
//! `toString`, ...) ride the same [`ExternalCallable`] plumbing as a
//! fourth, internal convention.

use std::rc::Rc;

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{heap::Heap, io::PrintWriter, value::Value};

/// Arguments carried across the host boundary for structured calls.
#[derive(Debug, Default)]
pub struct CallArguments {
    pub positional: Vec<Value>,
    pub named: IndexMap<String, Value>,
    pub type_args: Vec<String>,
}

/// What the engine lends a host callback for the duration of one call.
pub struct HostContext<'a> {
    pub heap: &'a mut Heap,
    pub out: &'a mut dyn PrintWriter,
}

/// Result type host callbacks return; the message becomes an
/// `ExternalError` positioned at the call site.
pub type HostResult = Result<Value, String>;

pub type StructuredFn = dyn Fn(&mut HostContext<'_>, CallArguments) -> HostResult;
pub type PositionalFn = dyn Fn(&mut HostContext<'_>, Vec<Value>) -> HostResult;
pub type MethodFn = dyn Fn(&mut HostContext<'_>, &Value, CallArguments) -> HostResult;

/// Engine-implemented members on primitive receivers. Dispatched inline
/// by the VM; listed here so they share the external calling plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    ToString,
    ListAdd,
    ListContains,
    ListElementAt,
    StructContainsKey,
    StructKeys,
    StructValues,
}

/// A callable provided by the host or the engine rather than bytecode.
#[derive(Clone)]
pub enum ExternalCallable {
    Structured(Rc<StructuredFn>),
    Positional(Rc<PositionalFn>),
    Method(Rc<MethodFn>),
    Builtin(Builtin),
}

impl std::fmt::Debug for ExternalCallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structured(_) => f.write_str("ExternalCallable::Structured"),
            Self::Positional(_) => f.write_str("ExternalCallable::Positional"),
            Self::Method(_) => f.write_str("ExternalCallable::Method"),
            Self::Builtin(b) => write!(f, "ExternalCallable::Builtin({b:?})"),
        }
    }
}

/// Host-side view of an external class.
///
/// `member_get` serves statics, constructors, and namespaced members;
/// `instance_member_get` reflects members off a native object. The `set`
/// hooks are optional.
pub trait ExternalClassBinding {
    fn member_get(&self, ctx: &mut HostContext<'_>, name: &str) -> HostResult;

    fn member_set(&self, _ctx: &mut HostContext<'_>, name: &str, _value: Value) -> Result<(), String> {
        Err(format!("member `{name}` is not writable"))
    }

    fn instance_member_get(&self, ctx: &mut HostContext<'_>, object: &Value, name: &str) -> HostResult;

    fn instance_member_set(
        &self,
        _ctx: &mut HostContext<'_>,
        _object: &Value,
        name: &str,
        _value: Value,
    ) -> Result<(), String> {
        Err(format!("instance member `{name}` is not writable"))
    }
}

/// Registry of everything the host exported to script code.
///
/// External functions are stored by their script-visible identifier or
/// `ClassId.member` form; classes by their script name.
#[derive(Default)]
pub struct ExternalBindings {
    classes: AHashMap<String, Rc<dyn ExternalClassBinding>>,
    functions: AHashMap<String, ExternalCallable>,
    typedefs: AHashMap<String, Rc<dyn Fn(Value) -> Value>>,
}

impl ExternalBindings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_class(&mut self, name: impl Into<String>, binding: Rc<dyn ExternalClassBinding>) {
        self.classes.insert(name.into(), binding);
    }

    pub fn register_function(&mut self, name: impl Into<String>, callable: ExternalCallable) {
        self.functions.insert(name.into(), callable);
    }

    /// Registers an unwrapper that converts a script function value into
    /// a host-ready callable for the given typedef tag.
    pub fn register_typedef(&mut self, tag: impl Into<String>, unwrapper: Rc<dyn Fn(Value) -> Value>) {
        self.typedefs.insert(tag.into(), unwrapper);
    }

    #[must_use]
    pub fn class(&self, name: &str) -> Option<Rc<dyn ExternalClassBinding>> {
        self.classes.get(name).cloned()
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<ExternalCallable> {
        self.functions.get(name).cloned()
    }

    #[must_use]
    pub fn typedef(&self, tag: &str) -> Option<Rc<dyn Fn(Value) -> Value>> {
        self.typedefs.get(tag).cloned()
    }
}

impl std::fmt::Debug for ExternalBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalBindings")
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("typedefs", &self.typedefs.keys().collect::<Vec<_>>())
            .finish()
    }
}
