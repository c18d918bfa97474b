//! Ordered list payload and the list operations on [`Value`].

use std::cmp::Ordering;

use parking_lot::RwLock;

use super::{Node, Value, ValueError, ValueType};

#[derive(Default, PartialEq)]
pub(crate) struct List {
    items: Vec<Value>,
    restrict: Option<ValueType>,
}

impl List {
    pub(crate) fn items(&self) -> &[Value] {
        &self.items
    }

    pub(crate) fn restrict(&self) -> Option<ValueType> {
        self.restrict
    }

    fn check_restrict(&self, value: &Value) -> Result<(), ValueError> {
        match self.restrict {
            Some(restricted) if value.get_type() != restricted => Err(ValueError::Restricted {
                restricted,
                found: value.get_type(),
            }),
            _ => Ok(()),
        }
    }
}

/// Resolve a possibly negative position against `len`.
///
/// Negative positions count from the end (`-1` is the last element). With
/// `allow_end`, `len` itself is accepted as an insertion point.
pub(crate) fn absolute_position(pos: isize, len: usize, allow_end: bool) -> Result<usize, ValueError> {
    let out_of_range = ValueError::IndexOutOfRange { index: pos, len };
    let resolved = if pos < 0 {
        len.checked_sub(pos.unsigned_abs()).ok_or(out_of_range.clone())?
    } else {
        pos as usize
    };
    if resolved < len || (allow_end && resolved == len) {
        Ok(resolved)
    } else {
        Err(out_of_range)
    }
}

impl Value {
    pub fn new_list() -> Self {
        Self::from_node(Node::List(RwLock::new(List::default())))
    }

    pub(crate) fn from_list(items: Vec<Value>, restrict: Option<ValueType>) -> Self {
        Self::from_node(Node::List(RwLock::new(List { items, restrict })))
    }

    fn list(&self) -> Result<&RwLock<List>, ValueError> {
        match self.node() {
            Node::List(list) => Ok(list),
            _ => Err(self.mismatch(ValueType::List)),
        }
    }

    /// Number of entries, or `None` for a non-list.
    pub fn list_len(&self) -> Option<usize> {
        self.list().ok().map(|l| l.read().items.len())
    }

    /// Entry at `pos`. Negative positions count from the end.
    pub fn list_get(&self, pos: isize) -> Result<Value, ValueError> {
        let list = self.list()?.read();
        let idx = absolute_position(pos, list.items.len(), false)?;
        Ok(list.items[idx].clone())
    }

    /// Replace the entry at `pos`; the old entry's reference is released.
    pub fn list_set(&self, pos: isize, value: &Value) -> Result<(), ValueError> {
        let lock = self.list()?;
        self.check_acyclic(value)?;
        let mut list = lock.write();
        list.check_restrict(value)?;
        let idx = absolute_position(pos, list.items.len(), false)?;
        list.items[idx] = value.clone();
        Ok(())
    }

    /// Insert at `pos`, shifting later entries. `pos == len` appends.
    pub fn list_insert(&self, pos: isize, value: &Value) -> Result<(), ValueError> {
        let lock = self.list()?;
        self.check_acyclic(value)?;
        let mut list = lock.write();
        list.check_restrict(value)?;
        let idx = absolute_position(pos, list.items.len(), true)?;
        list.items.insert(idx, value.clone());
        Ok(())
    }

    pub fn list_append(&self, value: &Value) -> Result<(), ValueError> {
        let lock = self.list()?;
        self.check_acyclic(value)?;
        let mut list = lock.write();
        list.check_restrict(value)?;
        list.items.push(value.clone());
        Ok(())
    }

    pub fn list_prepend(&self, value: &Value) -> Result<(), ValueError> {
        self.list_insert(0, value)
    }

    /// Remove and return the entry at `pos`.
    pub fn list_remove(&self, pos: isize) -> Result<Value, ValueError> {
        let mut list = self.list()?.write();
        let idx = absolute_position(pos, list.items.len(), false)?;
        Ok(list.items.remove(idx))
    }

    /// Move the entry at `old_pos` so that it ends up at `new_pos`.
    pub fn list_move(&self, old_pos: isize, new_pos: isize) -> Result<(), ValueError> {
        let mut list = self.list()?.write();
        let len = list.items.len();
        let from = absolute_position(old_pos, len, false)?;
        let to = absolute_position(new_pos, len, false)?;
        let entry = list.items.remove(from);
        list.items.insert(to, entry);
        Ok(())
    }

    pub fn list_clear(&self) -> Result<(), ValueError> {
        self.list()?.write().items.clear();
        Ok(())
    }

    /// Snapshot of the entries, each a new reference.
    pub fn list_items(&self) -> Option<Vec<Value>> {
        self.list().ok().map(|l| l.read().items.clone())
    }

    /// Position of the first entry structurally equal to `needle`.
    pub fn list_index_of(&self, needle: &Value) -> Option<usize> {
        let list = self.list().ok()?.read();
        list.items.iter().position(|v| v == needle)
    }

    /// Stable sort with a caller-supplied comparator.
    pub fn list_sort<F>(&self, mut compare: F) -> Result<(), ValueError>
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        let mut list = self.list()?.write();
        list.items.sort_by(|a, b| compare(a, b));
        Ok(())
    }

    /// Restrict the list to entries of `kind`.
    ///
    /// Fails if the list is already restricted to another type or holds an
    /// entry of another type.
    pub fn list_restrict_type(&self, kind: ValueType) -> Result<(), ValueError> {
        let mut list = self.list()?.write();
        if let Some(restricted) = list.restrict {
            if restricted != kind {
                return Err(ValueError::Restricted {
                    restricted,
                    found: kind,
                });
            }
        }
        if let Some(bad) = list.items.iter().find(|v| v.get_type() != kind) {
            return Err(ValueError::Restricted {
                restricted: kind,
                found: bad.get_type(),
            });
        }
        list.restrict = Some(kind);
        Ok(())
    }

    /// The element type the list is restricted to, if any.
    pub fn list_restricted_type(&self) -> Result<Option<ValueType>, ValueError> {
        Ok(self.list()?.read().restrict)
    }

    /// Whether every entry is of `kind`.
    pub fn list_has_type(&self, kind: ValueType) -> bool {
        match self.list() {
            Ok(list) => list.read().items.iter().all(|v| v.is_type(kind)),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ints(list: &Value) -> Vec<i64> {
        list.list_items()
            .unwrap()
            .iter()
            .map(|v| v.get_int().unwrap())
            .collect()
    }

    fn list_of(values: &[i64]) -> Value {
        let list = Value::new_list();
        for v in values {
            list.list_append(&Value::new_int(*v)).unwrap();
        }
        list
    }

    #[test]
    fn test_negative_positions() {
        let list = list_of(&[10, 20, 30]);
        assert_eq!(list.list_get(-1).unwrap().get_int(), Some(30));
        assert_eq!(list.list_get(-3).unwrap().get_int(), Some(10));
        assert_eq!(
            list.list_get(-4),
            Err(ValueError::IndexOutOfRange { index: -4, len: 3 })
        );
        assert!(list.list_get(3).is_err());
    }

    #[test]
    fn test_insert_remove_move() {
        let list = list_of(&[1, 2, 3]);
        list.list_insert(3, &Value::new_int(4)).unwrap();
        list.list_prepend(&Value::new_int(0)).unwrap();
        assert_eq!(ints(&list), vec![0, 1, 2, 3, 4]);

        let removed = list.list_remove(-2).unwrap();
        assert_eq!(removed.get_int(), Some(3));
        assert_eq!(ints(&list), vec![0, 1, 2, 4]);

        list.list_move(0, 3).unwrap();
        assert_eq!(ints(&list), vec![1, 2, 4, 0]);
        list.list_move(-1, 0).unwrap();
        assert_eq!(ints(&list), vec![0, 1, 2, 4]);
    }

    #[test]
    fn test_set_releases_old_entry() {
        let list = Value::new_list();
        let old = Value::new_string("old");
        let weak = old.downgrade();
        list.list_append(&old).unwrap();
        drop(old);
        assert!(weak.upgrade().is_some());

        list.list_set(0, &Value::new_string("new")).unwrap();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_restricted_list() {
        let list = Value::new_list();
        list.list_restrict_type(ValueType::String).unwrap();
        list.list_append(&Value::new_string("a")).unwrap();
        assert_eq!(
            list.list_append(&Value::new_int(1)),
            Err(ValueError::Restricted {
                restricted: ValueType::String,
                found: ValueType::Int64
            })
        );
        assert!(list.list_restrict_type(ValueType::Int64).is_err());
        assert_eq!(list.list_restricted_type(), Ok(Some(ValueType::String)));

        let mixed = list_of(&[1]);
        mixed.list_append(&Value::new_string("x")).unwrap();
        assert!(mixed.list_restrict_type(ValueType::Int64).is_err());
        assert_eq!(mixed.list_restricted_type(), Ok(None));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let outer = Value::new_list();
        let inner = Value::new_list();
        outer.list_append(&inner).unwrap();
        assert_eq!(inner.list_append(&outer), Err(ValueError::Cycle));
        assert_eq!(outer.list_append(&outer), Err(ValueError::Cycle));
        // Sharing the same child twice is fine.
        outer.list_append(&inner).unwrap();
        assert_eq!(outer.list_len(), Some(2));
    }

    #[test]
    fn test_sort_and_search() {
        let list = list_of(&[5, 3, 9, 1]);
        list.list_sort(|a, b| a.get_int().cmp(&b.get_int())).unwrap();
        assert_eq!(ints(&list), vec![1, 3, 5, 9]);
        assert_eq!(list.list_index_of(&Value::new_int(9)), Some(3));
        assert_eq!(list.list_index_of(&Value::new_int(4)), None);
        assert!(list.list_has_type(ValueType::Int64));
    }

    #[test]
    fn test_non_list_operations_fail() {
        let v = Value::new_int(1);
        assert_eq!(v.list_len(), None);
        assert_eq!(
            v.list_append(&Value::new_none()),
            Err(ValueError::TypeMismatch {
                expected: ValueType::List,
                found: ValueType::Int64
            })
        );
    }
}
