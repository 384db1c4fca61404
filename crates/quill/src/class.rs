//! Classes and instances.
//!
//! A class owns a namespace for its static members and declaration
//! tables for per-instance fields, methods, and constructors. An
//! instance carries one namespace per superclass level; the chain is
//! walked derived-first for member reads and drives `super` dispatch.

use indexmap::IndexMap;

use crate::{ast::Modifiers, declaration::CodeRef, heap::Heap, heap::HeapId, namespace::NamespaceId};

/// A per-instance field declaration: name, modifiers, and the stored
/// initializer range evaluated against each new instance's namespace.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub modifiers: Modifiers,
    pub declared_type: Option<String>,
    pub initializer: Option<CodeRef>,
}

/// A class after its declaration opcode has executed.
#[derive(Debug)]
pub struct Class {
    pub name: String,
    /// Resolved at declaration time by looking the super type's name up
    /// in the declaring namespace.
    pub super_class: Option<HeapId>,
    pub generic_params: Vec<String>,
    /// Stored, not semantically enforced.
    pub implements: Vec<String>,
    /// Stored, not semantically enforced.
    pub mixes: Vec<String>,
    pub is_external: bool,
    pub is_abstract: bool,
    /// Set on classes lowered from `enum` declarations.
    pub is_enum: bool,
    /// Namespace holding static members; its `class_id` points back here.
    pub namespace: NamespaceId,
    /// Per-instance fields in declaration order.
    pub fields: Vec<FieldDef>,
    /// Instance methods, getters (`$get.name`), and setters (`$set.name`).
    pub methods: IndexMap<String, HeapId>,
    /// Constructors keyed by name; the unnamed constructor is `""`.
    pub ctors: IndexMap<String, HeapId>,
    pub has_user_constructor: bool,
}

impl Class {
    /// The inheritance chain starting at this class, derived-first.
    #[must_use]
    pub fn chain(id: HeapId, heap: &Heap) -> Vec<HeapId> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(class_id) = current {
            chain.push(class_id);
            current = heap.as_class(class_id).and_then(|c| c.super_class);
        }
        chain
    }

    /// Whether `ancestor` is this class or one of its superclasses.
    #[must_use]
    pub fn derives_from(id: HeapId, ancestor_name: &str, heap: &Heap) -> bool {
        Self::chain(id, heap)
            .iter()
            .filter_map(|c| heap.as_class(*c))
            .any(|c| c.name == ancestor_name)
    }

    /// Looks a method up on this class only (no chain walk).
    #[must_use]
    pub fn method(&self, name: &str) -> Option<HeapId> {
        self.methods.get(name).copied()
    }

    /// Looks a constructor up by key; `""` is the unnamed constructor.
    #[must_use]
    pub fn ctor(&self, key: &str) -> Option<HeapId> {
        self.ctors.get(key).copied()
    }
}

/// A live instance of a class.
#[derive(Debug)]
pub struct Instance {
    pub class: HeapId,
    /// One namespace per inheritance level, derived-first. The chain
    /// length equals the depth of the class's inheritance chain.
    pub namespaces: Vec<NamespaceId>,
    /// Advisory type arguments this instance was created with.
    pub type_args: Vec<String>,
}
