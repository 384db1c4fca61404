//! Declarations: the named slots namespaces are made of.

use std::rc::Rc;

use crate::{ast::Modifiers, namespace::NamespaceId, value::Value};

/// A byte range inside a loaded image: the entry point of a function
/// body, a stored initializer, or a captured argument sub-program.
#[derive(Debug, Clone)]
pub struct CodeRef {
    /// Index of the image the bytes live in.
    pub image: usize,
    /// Key of the module the range was emitted under.
    pub module: Rc<str>,
    /// Byte offset of the first instruction.
    pub offset: usize,
    /// Length of the range in bytes.
    pub length: usize,
    pub line: u32,
    pub column: u32,
}

/// A pending late initializer: the byte range plus the namespace captured
/// at declaration time. First read triggers evaluation.
#[derive(Debug, Clone)]
pub struct LateInit {
    pub code: CodeRef,
    pub namespace: NamespaceId,
}

/// One named declaration inside a namespace.
///
/// Created at compile time or by VM declaration opcodes. The only
/// mutation after definition is the one-shot firing of a late
/// initializer on first read, and value assignment through `assign`.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub name: String,
    /// Owning class name for member declarations.
    pub class_name: Option<String>,
    pub modifiers: Modifiers,
    /// Advisory declared type name; never enforced at runtime.
    pub declared_type: Option<String>,
    pub value: Value,
    /// Pending initializer for `late` declarations; cleared once fired.
    pub late_init: Option<LateInit>,
    pub initialized: bool,
}

impl Declaration {
    /// An initialized declaration holding `value`.
    #[must_use]
    pub fn with_value(name: impl Into<String>, modifiers: Modifiers, value: Value) -> Self {
        Self {
            name: name.into(),
            class_name: None,
            modifiers,
            declared_type: None,
            value,
            late_init: None,
            initialized: true,
        }
    }

    /// A declaration whose initializer fires on first read.
    #[must_use]
    pub fn late(name: impl Into<String>, modifiers: Modifiers, late_init: LateInit) -> Self {
        Self {
            name: name.into(),
            class_name: None,
            modifiers,
            declared_type: None,
            value: Value::Null,
            late_init: Some(late_init),
            initialized: false,
        }
    }

    /// Whether assignment to this declaration is allowed.
    #[must_use]
    pub fn is_assignable(&self) -> bool {
        self.modifiers.is_mutable && !self.modifiers.is_const
    }

    /// Whether this declaration is visible through a plain module import.
    #[must_use]
    pub fn is_exported(&self) -> bool {
        self.modifiers.is_exported || !self.name.starts_with('_')
    }
}
