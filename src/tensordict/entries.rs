use crate::value::Value;

use std::collections::HashMap;

/**
 * The entries of a single container, iterated in insertion order.
 */
#[derive(Clone, Debug, Default)]
pub(crate) struct Entries {
    order: Vec<String>,
    values: HashMap<String, Value>,
}

impl Entries {
    pub(crate) fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /**
     * Inserts a value, keeping the position of the key if it was already present and
     * returning the value it replaced.
     */
    pub(crate) fn insert(&mut self, key: String, value: Value) -> Option<Value> {
        if let Some(slot) = self.values.get_mut(&key) {
            return Some(std::mem::replace(slot, value));
        }
        self.order.push(key.clone());
        self.values.insert(key, value);
        None
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Value> {
        let value = self.values.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    pub(crate) fn pop_last(&mut self) -> Option<(String, Value)> {
        let key = self.order.pop()?;
        let value = self.values.remove(&key)?;
        Some((key, value))
    }

    pub(crate) fn keys(&self) -> &[String] {
        &self.order
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.order
            .iter()
            .filter_map(move |k| self.values.get(k).map(|v| (k, v)))
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.values.clear();
    }
}

#[test]
fn insertion_order_is_kept() {
    let mut entries = Entries::default();
    entries.insert("b".to_string(), Value::from(1));
    entries.insert("a".to_string(), Value::from(2));
    entries.insert("b".to_string(), Value::from(3));
    assert_eq!(entries.keys(), &["b".to_string(), "a".to_string()]);
    assert_eq!(entries.get("b"), Some(&Value::from(3)));
    entries.remove("b");
    assert_eq!(entries.keys(), &["a".to_string()]);
    assert_eq!(entries.pop_last().map(|(k, _)| k), Some("a".to_string()));
    assert_eq!(entries.len(), 0);
}
