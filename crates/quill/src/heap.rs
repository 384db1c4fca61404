//! Arena for shared runtime entities.
//!
//! Lists, structs, instances, functions, and classes are stored in one
//! slab addressed by [`HeapId`]. The arena is owned by a single
//! interpreter and is grow-only: entities live for the lifetime of the
//! interpreter, which keeps identity semantics deterministic without a
//! cycle collector.

use crate::{class::Class, class::Instance, function::Function, struct_obj::StructObject, value::Value};

/// Index of an entity in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("heap id overflow"))
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Every kind of heap-allocated entity.
#[derive(Debug)]
pub enum HeapData {
    List(Vec<Value>),
    Struct(StructObject),
    Instance(Instance),
    Function(Function),
    Class(Class),
}

/// The slab of heap entities owned by one interpreter.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<HeapData>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        let id = HeapId::new(self.slots.len());
        self.slots.push(data);
        id
    }

    /// # Panics
    /// Panics on a dangling id; ids are only produced by this heap.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.slots[id.index()]
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.slots[id.index()]
    }

    #[must_use]
    pub fn as_class(&self, id: HeapId) -> Option<&Class> {
        match self.get(id) {
            HeapData::Class(class) => Some(class),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_function(&self, id: HeapId) -> Option<&Function> {
        match self.get(id) {
            HeapData::Function(function) => Some(function),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_instance(&self, id: HeapId) -> Option<&Instance> {
        match self.get(id) {
            HeapData::Instance(instance) => Some(instance),
            _ => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
