use log::warn;
use rustc_hash::FxHashMap;

/// A Java method identity, immutable once inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub klass: String,
    pub name: String,
    pub signature: String,
    /// Whether the method belongs to code the agent instrumented.
    pub is_jportal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    klass: String,
    name: String,
    signature: String,
}

/// Synthetic ids for methods that only ever appear as inline children of a
/// compiled method, never in a method_entry_initial record.
const SYNTHETIC_ID_BASE: u32 = 0x8000_0000;

/// Global method-descriptor table, populated during dump replay and frozen
/// before decoding starts.
#[derive(Debug, Default)]
pub struct MethodTable {
    by_id: FxHashMap<u32, MethodDescriptor>,
    by_name: FxHashMap<MethodKey, u32>,
    next_synthetic: u32,
}

impl MethodTable {
    pub fn new() -> Self {
        MethodTable::default()
    }

    /// Inserts a descriptor under a runtime-assigned id. A repeated id with
    /// different names is logged; the last writer wins.
    pub fn insert(&mut self, id: u32, descriptor: MethodDescriptor) {
        if let Some(existing) = self.by_id.get(&id) {
            if *existing != descriptor {
                warn!(
                    "method id {id} redefined: {}.{} -> {}.{}",
                    existing.klass, existing.name, descriptor.klass, descriptor.name
                );
                let key = MethodKey {
                    klass: existing.klass.clone(),
                    name: existing.name.clone(),
                    signature: existing.signature.clone(),
                };
                self.by_name.remove(&key);
            }
        }
        self.by_name.insert(
            MethodKey {
                klass: descriptor.klass.clone(),
                name: descriptor.name.clone(),
                signature: descriptor.signature.clone(),
            },
            id,
        );
        self.by_id.insert(id, descriptor);
    }

    /// Resolves an inline-child descriptor to its table id, matching by
    /// identity; unmatched methods get a synthetic id so every frame in a
    /// pc's inline stack resolves to something printable.
    pub fn intern(&mut self, klass: &str, name: &str, signature: &str) -> u32 {
        let key = MethodKey {
            klass: klass.to_owned(),
            name: name.to_owned(),
            signature: signature.to_owned(),
        };
        if let Some(&id) = self.by_name.get(&key) {
            return id;
        }
        let id = SYNTHETIC_ID_BASE + self.next_synthetic;
        self.next_synthetic += 1;
        self.by_name.insert(key, id);
        self.by_id.insert(
            id,
            MethodDescriptor {
                klass: klass.to_owned(),
                name: name.to_owned(),
                signature: signature.to_owned(),
                is_jportal: false,
            },
        );
        id
    }

    pub fn get(&self, id: u32) -> Option<&MethodDescriptor> {
        self.by_id.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(klass: &str, name: &str) -> MethodDescriptor {
        MethodDescriptor {
            klass: klass.into(),
            name: name.into(),
            signature: "()V".into(),
            is_jportal: true,
        }
    }

    #[test]
    fn intern_matches_known_methods_by_identity() {
        let mut table = MethodTable::new();
        table.insert(7, descriptor("Foo", "bar"));
        assert_eq!(table.intern("Foo", "bar", "()V"), 7);
        let synthetic = table.intern("Foo", "baz", "()V");
        assert!(synthetic >= SYNTHETIC_ID_BASE);
        assert!(!table.get(synthetic).unwrap().is_jportal);
        // A second intern of the same identity is stable.
        assert_eq!(table.intern("Foo", "baz", "()V"), synthetic);
    }

    #[test]
    fn redefined_id_last_writer_wins() {
        let mut table = MethodTable::new();
        table.insert(3, descriptor("Foo", "bar"));
        table.insert(3, descriptor("Foo", "quux"));
        assert_eq!(table.get(3).unwrap().name, "quux");
        assert_eq!(table.len(), 1);
        // The stale name no longer resolves to id 3.
        assert_ne!(table.intern("Foo", "bar", "()V"), 3);
    }
}
