//! Runtime functions: script-defined, host-bound, and engine builtins.

use indexmap::IndexMap;

use crate::{
    ast::{FunctionCategory, Modifiers, RedirectTarget},
    declaration::CodeRef,
    external::ExternalCallable,
    heap::HeapId,
    namespace::NamespaceId,
    value::Value,
};

/// One declared parameter after compilation.
///
/// Initializer expressions are kept as byte ranges; they evaluate in the
/// call namespace when the argument is absent.
#[derive(Debug, Clone)]
pub struct ParamDef {
    pub name: String,
    pub declared_type: Option<String>,
    pub initializer: Option<CodeRef>,
    pub is_optional: bool,
    pub is_named: bool,
    pub is_variadic: bool,
}

/// A redirecting-constructor record: callee tag, optional named
/// constructor key, and the captured argument sub-programs, which
/// evaluate in the redirecting call's closure.
#[derive(Debug, Clone)]
pub struct RedirectRecord {
    pub target: RedirectTarget,
    pub key: Option<String>,
    pub positional: Vec<CodeRef>,
    pub named: Vec<(String, CodeRef)>,
}

/// A callable value.
///
/// Exactly one of `entry` and `external` is set for invokable functions:
/// an external function has no bytecode entry point, and a non-external,
/// non-abstract, non-redirect-only function has one.
#[derive(Debug, Clone)]
pub struct Function {
    /// Unique name used for binding and stack traces.
    pub internal_name: String,
    /// Script-visible name, when there is one.
    pub name: Option<String>,
    pub category: FunctionCategory,
    /// Class this function belongs to, for methods and constructors.
    pub owner_class: Option<HeapId>,
    /// Namespace captured at definition time.
    pub closure: NamespaceId,
    /// Order-preserving parameter map.
    pub params: IndexMap<String, ParamDef>,
    pub min_arity: u8,
    pub max_arity: u8,
    pub is_variadic: bool,
    pub modifiers: Modifiers,
    /// Advisory declared return type.
    pub return_type: Option<String>,
    pub redirect: Option<RedirectRecord>,
    /// Bytecode entry point: module + offset + source position.
    pub entry: Option<CodeRef>,
    /// Host or engine callable for external functions.
    pub external: Option<ExternalCallable>,
    /// Tag the host uses to unwrap this function into a native callable.
    pub external_typedef: Option<String>,
    /// Receiver bound at member-resolution time for methods.
    pub bound_this: Option<Value>,
}

impl Function {
    /// Whether `positional_count` satisfies this function's arity window.
    #[must_use]
    pub fn accepts_positional(&self, positional_count: usize) -> bool {
        if positional_count < self.min_arity as usize {
            return false;
        }
        self.is_variadic || positional_count <= self.max_arity as usize
    }

    /// Rebinds the receiver, producing the bound form handed out by
    /// member resolution.
    #[must_use]
    pub fn bind(&self, receiver: Value) -> Self {
        let mut bound = self.clone();
        bound.bound_this = Some(receiver);
        bound
    }
}
