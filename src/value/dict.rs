//! String-keyed dict payload and the dict operations on [`Value`].
//!
//! Entries keep insertion order. Overwriting a key keeps its position;
//! removing a key closes the gap.

use indexmap::map::{Iter, Values};
use indexmap::IndexMap;
use parking_lot::RwLock;

use super::{Node, Value, ValueError, ValueType};

#[derive(Default)]
pub(crate) struct Dict {
    entries: IndexMap<String, Value>,
}

impl Dict {
    pub(crate) fn from_entries(entries: IndexMap<String, Value>) -> Self {
        Self { entries }
    }

    pub(crate) fn iter(&self) -> Iter<'_, String, Value> {
        self.entries.iter()
    }

    pub(crate) fn values(&self) -> Values<'_, String, Value> {
        self.entries.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Order-sensitive: two dicts are equal when they list the same entries in
/// the same order.
impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
    }
}

impl Value {
    pub fn new_dict() -> Self {
        Self::from_node(Node::Dict(RwLock::new(Dict::default())))
    }

    pub(crate) fn from_dict(dict: Dict) -> Self {
        Self::from_node(Node::Dict(RwLock::new(dict)))
    }

    fn dict(&self) -> Result<&RwLock<Dict>, ValueError> {
        match self.node() {
            Node::Dict(dict) => Ok(dict),
            _ => Err(self.mismatch(ValueType::Dict)),
        }
    }

    pub fn dict_len(&self) -> Option<usize> {
        self.dict().ok().map(|d| d.read().entries.len())
    }

    /// Value stored under `key`.
    pub fn dict_get(&self, key: &str) -> Result<Value, ValueError> {
        self.dict()?
            .read()
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| ValueError::MissingKey(key.to_string()))
    }

    /// Insert or overwrite `key`. An overwritten value's reference is released.
    pub fn dict_set(&self, key: &str, value: &Value) -> Result<(), ValueError> {
        let lock = self.dict()?;
        self.check_acyclic(value)?;
        lock.write().entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    /// Remove `key`, returning its value.
    pub fn dict_remove(&self, key: &str) -> Result<Value, ValueError> {
        self.dict()?
            .write()
            .entries
            .shift_remove(key)
            .ok_or_else(|| ValueError::MissingKey(key.to_string()))
    }

    pub fn dict_has_key(&self, key: &str) -> bool {
        match self.dict() {
            Ok(dict) => dict.read().entries.contains_key(key),
            Err(_) => false,
        }
    }

    pub fn dict_clear(&self) -> Result<(), ValueError> {
        self.dict()?.write().entries.clear();
        Ok(())
    }

    /// Keys in insertion order.
    pub fn dict_keys(&self) -> Option<Vec<String>> {
        self.dict()
            .ok()
            .map(|d| d.read().entries.keys().cloned().collect())
    }

    /// Snapshot of the entries in insertion order.
    pub fn dict_entries(&self) -> Option<Vec<(String, Value)>> {
        self.dict().ok().map(|d| {
            d.read()
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    /// Type of the value under `key`, if present.
    pub fn dict_entry_type(&self, key: &str) -> Option<ValueType> {
        self.dict_get(key).ok().map(|v| v.get_type())
    }

    pub fn dict_set_int(&self, key: &str, value: i64) -> Result<(), ValueError> {
        self.dict_set(key, &Value::new_int(value))
    }

    pub fn dict_set_string(&self, key: &str, value: &str) -> Result<(), ValueError> {
        self.dict_set(key, &Value::new_string(value))
    }

    pub fn dict_get_int(&self, key: &str) -> Option<i64> {
        self.dict_get(key).ok()?.get_int()
    }

    pub fn dict_get_string(&self, key: &str) -> Option<String> {
        self.dict_get(key).ok()?.get_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_insertion_order_survives_update() {
        let dict = Value::new_dict();
        dict.dict_set_int("b", 1).unwrap();
        dict.dict_set_int("a", 2).unwrap();
        dict.dict_set_int("c", 3).unwrap();
        dict.dict_set_int("a", 20).unwrap();

        assert_eq!(dict.dict_keys().unwrap(), vec!["b", "a", "c"]);
        assert_eq!(dict.dict_get_int("a"), Some(20));
        assert_eq!(dict.dict_len(), Some(3));
    }

    #[test]
    fn test_remove_and_missing_keys() {
        let dict = Value::new_dict();
        dict.dict_set_string("artist", "Sonic Youth").unwrap();
        dict.dict_set_string("title", "Teen Age Riot").unwrap();
        dict.dict_set_int("tracknr", 1).unwrap();

        let removed = dict.dict_remove("title").unwrap();
        assert_eq!(removed.get_string().as_deref(), Some("Teen Age Riot"));
        assert_eq!(dict.dict_keys().unwrap(), vec!["artist", "tracknr"]);

        assert_eq!(
            dict.dict_remove("title"),
            Err(ValueError::MissingKey("title".into()))
        );
        assert!(dict.dict_get("album").is_err());
        assert!(!dict.dict_has_key("album"));
        assert_eq!(dict.dict_entry_type("tracknr"), Some(ValueType::Int64));
    }

    #[test]
    fn test_overwrite_releases_previous_value() {
        let dict = Value::new_dict();
        let first = Value::new_binary(vec![0; 16]);
        let weak = first.downgrade();
        dict.dict_set("k", &first).unwrap();
        drop(first);
        dict.dict_set("k", &Value::new_none()).unwrap();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_nested_cycle_rejected() {
        let dict = Value::new_dict();
        let list = Value::new_list();
        dict.dict_set("list", &list).unwrap();
        assert_eq!(list.list_append(&dict), Err(ValueError::Cycle));
        assert_eq!(dict.dict_set("self", &dict), Err(ValueError::Cycle));
    }

    #[test]
    fn test_equality_is_order_sensitive() {
        let a = Value::new_dict();
        a.dict_set_int("x", 1).unwrap();
        a.dict_set_int("y", 2).unwrap();
        let b = Value::new_dict();
        b.dict_set_int("y", 2).unwrap();
        b.dict_set_int("x", 1).unwrap();
        assert_ne!(a, b);

        b.dict_clear().unwrap();
        b.dict_set_int("x", 1).unwrap();
        b.dict_set_int("y", 2).unwrap();
        assert_eq!(a, b);
    }
}
