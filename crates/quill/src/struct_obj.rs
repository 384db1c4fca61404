//! Prototype-based struct objects.
//!
//! A struct is an ordered string-keyed mapping with an optional prototype
//! reference to another struct. Reads walk the prototype chain until a
//! match or the root; writes always target the receiver and may create
//! new keys.

use indexmap::IndexMap;

use crate::{
    heap::{Heap, HeapData, HeapId},
    value::Value,
};

#[derive(Debug, Default)]
pub struct StructObject {
    /// Nominal id for values created from named struct declarations.
    pub id: Option<String>,
    pub prototype: Option<HeapId>,
    fields: IndexMap<String, Value>,
}

impl StructObject {
    #[must_use]
    pub fn new(id: Option<String>, prototype: Option<HeapId>) -> Self {
        Self {
            id,
            prototype,
            fields: IndexMap::new(),
        }
    }

    /// Own-field read; no prototype walk.
    #[must_use]
    pub fn get_own(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Writes always target the receiver, creating the key if absent.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    #[must_use]
    pub fn contains_own(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Read through the prototype chain starting at `id`.
    #[must_use]
    pub fn chain_get(heap: &Heap, id: HeapId, key: &str) -> Option<Value> {
        let mut current = Some(id);
        while let Some(struct_id) = current {
            let HeapData::Struct(obj) = heap.get(struct_id) else {
                return None;
            };
            if let Some(value) = obj.get_own(key) {
                return Some(value.clone());
            }
            current = obj.prototype;
        }
        None
    }

    /// Whether `key` is readable anywhere on the chain starting at `id`.
    #[must_use]
    pub fn chain_contains(heap: &Heap, id: HeapId, key: &str) -> bool {
        Self::chain_get(heap, id, key).is_some()
    }

    /// Multi-line display of own fields, in insertion order:
    ///
    /// ```text
    /// {
    ///   key: value,
    ///   other: value
    /// }
    /// ```
    #[must_use]
    pub fn display(&self, heap: &Heap, indent: usize) -> String {
        if self.fields.is_empty() {
            return "{}".to_owned();
        }
        let pad = "  ".repeat(indent + 1);
        let mut out = String::from("{\n");
        let last = self.fields.len() - 1;
        for (i, (key, value)) in self.fields.iter().enumerate() {
            let rendered = match value {
                Value::Ref(id) => match heap.get(*id) {
                    HeapData::Struct(nested) => nested.display(heap, indent + 1),
                    _ => value.display(heap),
                },
                _ => value.display(heap),
            };
            out.push_str(&pad);
            out.push_str(key);
            out.push_str(": ");
            out.push_str(&rendered);
            if i != last {
                out.push(',');
            }
            out.push('\n');
        }
        out.push_str(&"  ".repeat(indent));
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reads_walk_the_prototype_chain() {
        let mut heap = Heap::new();
        let mut proto = StructObject::new(None, None);
        proto.set("greeting", Value::str("hi!"));
        let proto_id = heap.alloc(HeapData::Struct(proto));
        let child = StructObject::new(None, Some(proto_id));
        let child_id = heap.alloc(HeapData::Struct(child));

        let got = StructObject::chain_get(&heap, child_id, "greeting").expect("chained read");
        assert_eq!(got.display(&heap), "hi!");
    }

    #[test]
    fn writes_create_keys_on_the_receiver_not_the_prototype() {
        let mut heap = Heap::new();
        let mut proto = StructObject::new(None, None);
        proto.set("value", Value::Int(1));
        let proto_id = heap.alloc(HeapData::Struct(proto));
        let child = StructObject::new(None, Some(proto_id));
        let child_id = heap.alloc(HeapData::Struct(child));

        let HeapData::Struct(child) = heap.get_mut(child_id) else {
            panic!("expected struct");
        };
        child.set("value", Value::Int(2));
        assert!(child.contains_own("value"));

        let HeapData::Struct(proto) = heap.get(proto_id) else {
            panic!("expected struct");
        };
        assert!(matches!(proto.get_own("value"), Some(Value::Int(1))));
    }

    #[test]
    fn display_matches_struct_to_string_format() {
        let mut heap = Heap::new();
        let mut obj = StructObject::new(None, None);
        obj.set("value", Value::str("ha!"));
        obj.set("greeting", Value::str("hi!"));
        obj.set("world", Value::str("everything"));
        let id = heap.alloc(HeapData::Struct(obj));
        let HeapData::Struct(obj) = heap.get(id) else {
            panic!("expected struct");
        };
        assert_eq!(
            obj.display(&heap, 0),
            "{\n  value: ha!,\n  greeting: hi!,\n  world: everything\n}"
        );
    }

    #[test]
    fn empty_struct_displays_braces() {
        let heap = Heap::new();
        let obj = StructObject::new(None, None);
        assert_eq!(obj.display(&heap, 0), "{}");
    }
}
