//! Thread-safe key/value store; the atomic unit of mutable saga state.
//!
//! Values are type-erased. Whether a value can be deep-copied is decided at
//! insertion time: [`StateBag::set`] requires `Clone` and captures a copy
//! routine alongside the value, while [`StateBag::set_shared`] stores a plain
//! `Arc` that snapshots share by reference. The fallback is visible at the
//! call site instead of being buried in a generic serializer.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

type AnyValue = Arc<dyn Any + Send + Sync>;

fn duplicate_as<T: Clone + Send + Sync + 'static>(value: &AnyValue) -> AnyValue {
    match Arc::clone(value).downcast::<T>() {
        Ok(typed) => Arc::new((*typed).clone()),
        // The copy routine is captured next to a value of the same type, so
        // a mismatch cannot occur; sharing is the safe degradation.
        Err(original) => original,
    }
}

/// Stored value plus the deep-copy routine captured at insertion time.
struct Slot {
    value: AnyValue,
    duplicate: Option<fn(&AnyValue) -> AnyValue>,
}

impl Slot {
    fn owned<T: Clone + Send + Sync + 'static>(value: T) -> Self {
        Slot {
            value: Arc::new(value),
            duplicate: Some(duplicate_as::<T>),
        }
    }

    fn shared<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Slot {
            value,
            duplicate: None,
        }
    }

    fn snapshot(&self) -> Self {
        let value = match self.duplicate {
            Some(run) => run(&self.value),
            None => Arc::clone(&self.value),
        };
        Slot {
            value,
            duplicate: self.duplicate,
        }
    }
}

/// Concurrent key/value store scoped to one state namespace.
///
/// All operations take `&self` and are safe under unbounded concurrent
/// callers; hook code may hit the same bag from as many tasks as it likes.
/// Key insertion order is not preserved.
pub struct StateBag {
    entries: RwLock<HashMap<String, Slot>>,
}

impl StateBag {
    pub fn new() -> Self {
        StateBag {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up `key` and downcasts the value to `T`.
    ///
    /// Returns `None` when the key is absent or holds a different type.
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let entries = self.entries.read().expect("state bag lock");
        let slot = entries.get(key)?;
        Arc::clone(&slot.value).downcast::<T>().ok()
    }

    /// Looks up `key` and returns an owned copy of the value.
    pub fn get_cloned<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        self.get::<T>(key).map(|value| (*value).clone())
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// The value keeps its `Clone` capability: snapshots and merges deep-copy
    /// it, so mutations on one side never leak to the other.
    pub fn set<T: Clone + Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        let mut entries = self.entries.write().expect("state bag lock");
        entries.insert(key.into(), Slot::owned(value));
    }

    /// Stores a value without a copy capability.
    ///
    /// Snapshots and merges copy the reference, not the value: interior
    /// mutations remain visible across copies. This is the documented shallow
    /// fallback for values that cannot or should not be cloned.
    pub fn set_shared<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: Arc<T>) {
        let mut entries = self.entries.write().expect("state bag lock");
        entries.insert(key.into(), Slot::shared(value));
    }

    /// Removes `key`, reporting whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.write().expect("state bag lock");
        entries.remove(key).is_some()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.write().expect("state bag lock");
        entries.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.read().expect("state bag lock");
        entries.contains_key(key)
    }

    /// Currently stored keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().expect("state bag lock");
        entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().expect("state bag lock");
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produces an independent copy of the bag.
    ///
    /// Values inserted with [`set`](StateBag::set) are deep-copied; values
    /// inserted with [`set_shared`](StateBag::set_shared) are copied by
    /// reference. Key-level changes (set/delete) never cross between the
    /// original and the copy either way.
    pub fn snapshot(&self) -> StateBag {
        let entries = self.entries.read().expect("state bag lock");
        let copied = entries
            .iter()
            .map(|(key, slot)| (key.clone(), slot.snapshot()))
            .collect();
        StateBag {
            entries: RwLock::new(copied),
        }
    }

    /// Copies every entry of `other` into `self`, overwriting on collision.
    ///
    /// `other` is left untouched. Incoming values follow the same copy rule
    /// as [`snapshot`](StateBag::snapshot).
    pub fn merge(&self, other: &StateBag) {
        // Copy under other's lock first so two bags merging each other from
        // two threads cannot deadlock on lock order.
        let incoming: Vec<(String, Slot)> = {
            let theirs = other.entries.read().expect("state bag lock");
            theirs
                .iter()
                .map(|(key, slot)| (key.clone(), slot.snapshot()))
                .collect()
        };
        let mut entries = self.entries.write().expect("state bag lock");
        for (key, slot) in incoming {
            entries.insert(key, slot);
        }
    }
}

impl Default for StateBag {
    fn default() -> Self {
        StateBag::new()
    }
}

impl fmt::Debug for StateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = self.keys();
        keys.sort();
        f.debug_struct("StateBag").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn set_get_delete_round_trip() {
        let bag = StateBag::new();
        bag.set("region", "us-east-1".to_string());
        bag.set("replicas", 3u32);

        assert_eq!(bag.get_cloned::<String>("region").as_deref(), Some("us-east-1"));
        assert_eq!(bag.get_cloned::<u32>("replicas"), Some(3));
        assert_eq!(bag.len(), 2);
        assert!(bag.contains("region"));

        assert!(bag.delete("region"));
        assert!(!bag.delete("region"));
        assert!(bag.get::<String>("region").is_none());

        bag.clear();
        assert!(bag.is_empty());
    }

    #[test]
    fn get_with_wrong_type_is_none() {
        let bag = StateBag::new();
        bag.set("count", 7i64);
        assert!(bag.get::<String>("count").is_none());
        assert_eq!(bag.get_cloned::<i64>("count"), Some(7));
    }

    #[test]
    fn set_replaces_existing_value() {
        let bag = StateBag::new();
        bag.set("env", "staging".to_string());
        bag.set("env", "prod".to_string());
        assert_eq!(bag.get_cloned::<String>("env").as_deref(), Some("prod"));
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn snapshot_deep_copies_owned_values() {
        let bag = StateBag::new();
        bag.set("hosts", vec!["a".to_string()]);

        let copy = bag.snapshot();
        let original = bag.get::<Vec<String>>("hosts").unwrap();
        let copied = copy.get::<Vec<String>>("hosts").unwrap();
        assert!(!Arc::ptr_eq(&original, &copied));

        bag.set("hosts", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(copy.get::<Vec<String>>("hosts").unwrap().len(), 1);
    }

    #[test]
    fn snapshot_shares_values_without_copy_capability() {
        let bag = StateBag::new();
        bag.set_shared("handle", Arc::new(42u64));

        let copy = bag.snapshot();
        let original = bag.get::<u64>("handle").unwrap();
        let shared = copy.get::<u64>("handle").unwrap();
        assert!(Arc::ptr_eq(&original, &shared));
    }

    #[test]
    fn snapshot_key_changes_do_not_cross() {
        let bag = StateBag::new();
        bag.set("keep", 1u8);
        let copy = bag.snapshot();

        bag.set("only_original", 2u8);
        copy.set("only_copy", 3u8);
        copy.delete("keep");

        assert!(bag.contains("keep"));
        assert!(!bag.contains("only_copy"));
        assert!(!copy.contains("only_original"));
    }

    #[test]
    fn merge_prefers_other_and_leaves_it_untouched() {
        let mine = StateBag::new();
        mine.set("a", 1u32);
        mine.set("b", 2u32);

        let theirs = StateBag::new();
        theirs.set("b", 20u32);
        theirs.set("c", 30u32);

        mine.merge(&theirs);

        assert_eq!(mine.get_cloned::<u32>("a"), Some(1));
        assert_eq!(mine.get_cloned::<u32>("b"), Some(20));
        assert_eq!(mine.get_cloned::<u32>("c"), Some(30));
        assert_eq!(theirs.len(), 2);
        assert_eq!(theirs.get_cloned::<u32>("b"), Some(20));
        assert!(!theirs.contains("a"));
    }

    #[test]
    fn merged_values_are_independent_copies() {
        let mine = StateBag::new();
        let theirs = StateBag::new();
        theirs.set("list", vec![1u32]);

        mine.merge(&theirs);
        theirs.set("list", vec![1u32, 2u32]);

        assert_eq!(mine.get::<Vec<u32>>("list").unwrap().len(), 1);
    }

    #[test]
    fn concurrent_writers_land_every_key() {
        let bag = StateBag::new();
        thread::scope(|scope| {
            for worker in 0..8u32 {
                let bag = &bag;
                scope.spawn(move || {
                    for i in 0..50u32 {
                        bag.set(format!("k{worker}-{i}"), worker * 100 + i);
                    }
                });
            }
        });
        assert_eq!(bag.len(), 8 * 50);
        assert_eq!(bag.get_cloned::<u32>("k7-49"), Some(749));
    }
}
