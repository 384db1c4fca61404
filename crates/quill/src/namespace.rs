//! Namespaces: ordered identifier-to-declaration maps with an enclosing
//! pointer, stored in one slab arena.
//!
//! # Design Rationale
//!
//! Instead of sharing namespaces through reference-counted pointers (the
//! closure graph is cyclic: functions point at their defining namespace,
//! namespaces hold function values), every namespace lives in a central
//! slab and is addressed by [`NamespaceId`]. Scope chains are `enclosing`
//! links walked on lookup; block and call scopes are pushed and popped on
//! the VM's namespace stack while their slots stay in the slab for the
//! lifetime of the interpreter.

use indexmap::IndexMap;

use crate::{
    declaration::Declaration,
    error::{ErrorCode, QuillError, QuillResult},
    heap::HeapId,
    value::Value,
};

/// Index of a namespace in the slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceId(u32);

impl NamespaceId {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("namespace id overflow"))
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One ordered scope of declarations.
#[derive(Debug)]
pub struct Namespace {
    /// Display name used in stack traces (`global`, a class name, a
    /// function's internal name).
    pub name: String,
    pub enclosing: Option<NamespaceId>,
    /// Set on class namespaces: the class the statics belong to.
    pub class_id: Option<HeapId>,
    declarations: IndexMap<String, Declaration>,
}

impl Namespace {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Declaration> {
        self.declarations.get(name)
    }

    #[must_use]
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Declaration> {
        self.declarations.get_mut(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.declarations.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Declaration)> {
        self.declarations.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

/// The slab of all namespaces owned by one interpreter.
#[derive(Debug, Default)]
pub struct Namespaces {
    slots: Vec<Namespace>,
}

impl Namespaces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a namespace, optionally chained to an enclosing one.
    pub fn create(&mut self, name: impl Into<String>, enclosing: Option<NamespaceId>) -> NamespaceId {
        let id = NamespaceId::new(self.slots.len());
        self.slots.push(Namespace {
            name: name.into(),
            enclosing,
            class_id: None,
            declarations: IndexMap::new(),
        });
        id
    }

    #[must_use]
    pub fn get(&self, id: NamespaceId) -> &Namespace {
        &self.slots[id.index()]
    }

    pub fn get_mut(&mut self, id: NamespaceId) -> &mut Namespace {
        &mut self.slots[id.index()]
    }

    /// Defines a declaration in `ns`. Redefinition is an error unless
    /// `allow_override` (scripts may shadow their own top level).
    pub fn define(
        &mut self,
        ns: NamespaceId,
        declaration: Declaration,
        allow_override: bool,
    ) -> QuillResult<()> {
        let namespace = self.get_mut(ns);
        if !allow_override && namespace.contains(&declaration.name) {
            return Err(QuillError::positionless(
                ErrorCode::Defined,
                format!("`{}` is already defined in this scope", declaration.name),
            ));
        }
        namespace.declarations.insert(declaration.name.clone(), declaration);
        Ok(())
    }

    /// Walks the enclosing chain for `name`, returning the namespace that
    /// declares it. Lexical scoping: the innermost declaration shadows
    /// outer ones.
    #[must_use]
    pub fn resolve(&self, from: NamespaceId, name: &str) -> Option<NamespaceId> {
        let mut current = Some(from);
        while let Some(id) = current {
            let namespace = self.get(id);
            if namespace.contains(name) {
                return Some(id);
            }
            current = namespace.enclosing;
        }
        None
    }

    /// Walk-up assignment. Fails with `Undefined` when no declaration is
    /// found and with `Immutable` on a non-assignable one.
    pub fn assign(&mut self, from: NamespaceId, name: &str, value: Value) -> QuillResult<()> {
        let Some(ns) = self.resolve(from, name) else {
            return Err(QuillError::positionless(
                ErrorCode::Undefined,
                format!("undefined symbol `{name}`"),
            ));
        };
        let declaration = self.get_mut(ns).get_mut(name).expect("resolved above");
        if declaration.initialized && !declaration.is_assignable() {
            return Err(QuillError::positionless(
                ErrorCode::Immutable,
                format!("cannot assign to immutable `{name}`"),
            ));
        }
        declaration.value = value;
        declaration.initialized = true;
        declaration.late_init = None;
        Ok(())
    }

    /// Whether `ancestor` appears on `ns`'s enclosing chain (used by the
    /// acyclicity debug check when wiring closures).
    #[must_use]
    pub fn chain_contains(&self, ns: NamespaceId, ancestor: NamespaceId) -> bool {
        let mut current = Some(ns);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.get(id).enclosing;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::Modifiers;

    use super::*;

    fn mutable() -> Modifiers {
        Modifiers {
            is_mutable: true,
            ..Modifiers::default()
        }
    }

    #[test]
    fn lookup_walks_enclosing_chain() {
        let mut spaces = Namespaces::new();
        let global = spaces.create("global", None);
        let inner = spaces.create("inner", Some(global));
        spaces
            .define(global, Declaration::with_value("x", mutable(), Value::Int(1)), false)
            .unwrap();
        assert_eq!(spaces.resolve(inner, "x"), Some(global));
        assert_eq!(spaces.resolve(inner, "y"), None);
    }

    #[test]
    fn inner_declaration_shadows_outer() {
        let mut spaces = Namespaces::new();
        let global = spaces.create("global", None);
        let inner = spaces.create("inner", Some(global));
        spaces
            .define(global, Declaration::with_value("x", mutable(), Value::Int(1)), false)
            .unwrap();
        spaces
            .define(inner, Declaration::with_value("x", mutable(), Value::Int(2)), false)
            .unwrap();
        let found = spaces.resolve(inner, "x").unwrap();
        assert_eq!(found, inner);
        // the outer declaration is untouched
        assert!(matches!(spaces.get(global).get("x").unwrap().value, Value::Int(1)));
    }

    #[test]
    fn assignment_respects_immutability() {
        let mut spaces = Namespaces::new();
        let global = spaces.create("global", None);
        spaces
            .define(
                global,
                Declaration::with_value("k", Modifiers::default(), Value::Int(1)),
                false,
            )
            .unwrap();
        let err = spaces.assign(global, "k", Value::Int(2)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Immutable);
    }

    #[test]
    fn duplicate_definition_is_an_error() {
        let mut spaces = Namespaces::new();
        let global = spaces.create("global", None);
        spaces
            .define(global, Declaration::with_value("x", mutable(), Value::Null), false)
            .unwrap();
        let err = spaces
            .define(global, Declaration::with_value("x", mutable(), Value::Null), false)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Defined);
    }
}
