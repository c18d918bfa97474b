//! Collection expressions.
//!
//! A collection is an operator node: a [`CollType`], a set of string/int
//! attributes, an id list (used by the idlist family) and child operands,
//! which are themselves collections. The daemon evaluates these trees
//! against the media library; here they are just data.

use std::fmt;

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::list::absolute_position;
use super::{Node, Value, ValueError, ValueType};

/// Operator of a collection node. Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CollType {
    Reference = 0,
    Universe = 1,
    Union = 2,
    Intersection = 3,
    Complement = 4,
    Has = 5,
    Match = 6,
    Token = 7,
    Equals = 8,
    NotEqual = 9,
    Smaller = 10,
    SmallerEq = 11,
    Greater = 12,
    GreaterEq = 13,
    Order = 14,
    Limit = 15,
    MediaSet = 16,
    IdList = 17,
}

impl CollType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        use CollType::*;
        Some(match raw {
            0 => Reference,
            1 => Universe,
            2 => Union,
            3 => Intersection,
            4 => Complement,
            5 => Has,
            6 => Match,
            7 => Token,
            8 => Equals,
            9 => NotEqual,
            10 => Smaller,
            11 => SmallerEq,
            12 => Greater,
            13 => GreaterEq,
            14 => Order,
            15 => Limit,
            16 => MediaSet,
            17 => IdList,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Whether nodes of this type may carry operands.
    pub fn accepts_operands(self) -> bool {
        self != CollType::Reference
    }
}

#[derive(PartialEq)]
pub(crate) struct Coll {
    kind: CollType,
    attributes: IndexMap<String, Value>,
    idlist: Vec<i64>,
    operands: Vec<Value>,
}

impl Coll {
    pub(crate) fn new(kind: CollType) -> Self {
        Self {
            kind,
            attributes: IndexMap::new(),
            idlist: Vec::new(),
            operands: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        kind: CollType,
        attributes: IndexMap<String, Value>,
        idlist: Vec<i64>,
        operands: Vec<Value>,
    ) -> Self {
        Self {
            kind,
            attributes,
            idlist,
            operands,
        }
    }

    pub(crate) fn kind(&self) -> CollType {
        self.kind
    }

    pub(crate) fn attributes(&self) -> &IndexMap<String, Value> {
        &self.attributes
    }

    pub(crate) fn idlist(&self) -> &[i64] {
        &self.idlist
    }

    pub(crate) fn operands(&self) -> &[Value] {
        &self.operands
    }
}

impl fmt::Debug for Coll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Coll");
        s.field("type", &self.kind);
        if !self.attributes.is_empty() {
            s.field("attributes", &self.attributes);
        }
        if !self.idlist.is_empty() {
            s.field("idlist", &self.idlist);
        }
        if !self.operands.is_empty() {
            s.field("operands", &self.operands);
        }
        s.finish()
    }
}

impl Value {
    pub fn new_coll(kind: CollType) -> Self {
        Self::from_coll(Coll::new(kind))
    }

    pub(crate) fn from_coll(coll: Coll) -> Self {
        Self::from_node(Node::Coll(RwLock::new(coll)))
    }

    /// A collection matching the whole media library.
    pub fn universe() -> Self {
        Self::new_coll(CollType::Universe)
    }

    fn coll(&self) -> Result<&RwLock<Coll>, ValueError> {
        match self.node() {
            Node::Coll(coll) => Ok(coll),
            _ => Err(self.mismatch(ValueType::Coll)),
        }
    }

    pub fn coll_type(&self) -> Option<CollType> {
        self.coll().ok().map(|c| c.read().kind)
    }

    /// Append a child operand. Operands must be collections.
    pub fn coll_add_operand(&self, operand: &Value) -> Result<(), ValueError> {
        let lock = self.coll()?;
        if !operand.is_type(ValueType::Coll) {
            return Err(ValueError::InvalidOperand(format!(
                "operand must be a collection, got {}",
                operand.get_type()
            )));
        }
        self.check_acyclic(operand)?;
        let mut coll = lock.write();
        if !coll.kind.accepts_operands() {
            return Err(ValueError::InvalidOperand(format!(
                "{:?} collections take no operands",
                coll.kind
            )));
        }
        coll.operands.push(operand.clone());
        Ok(())
    }

    /// Remove the operand that is the same value as `operand`.
    pub fn coll_remove_operand(&self, operand: &Value) -> Result<(), ValueError> {
        let mut coll = self.coll()?.write();
        let idx = coll
            .operands
            .iter()
            .position(|o| o.ptr_eq(operand))
            .ok_or_else(|| ValueError::InvalidOperand("not an operand of this collection".into()))?;
        coll.operands.remove(idx);
        Ok(())
    }

    pub fn coll_operands(&self) -> Option<Vec<Value>> {
        self.coll().ok().map(|c| c.read().operands.clone())
    }

    pub fn coll_attribute_set(&self, key: &str, value: &str) -> Result<(), ValueError> {
        self.coll()?
            .write()
            .attributes
            .insert(key.to_string(), Value::new_string(value));
        Ok(())
    }

    pub fn coll_attribute_set_int(&self, key: &str, value: i64) -> Result<(), ValueError> {
        self.coll()?
            .write()
            .attributes
            .insert(key.to_string(), Value::new_int(value));
        Ok(())
    }

    /// Merge every string or int entry of `attrs` (a dict) into the attributes.
    pub fn coll_attributes_set(&self, attrs: &Value) -> Result<(), ValueError> {
        let lock = self.coll()?;
        let entries = attrs
            .dict_entries()
            .ok_or_else(|| attrs.mismatch(ValueType::Dict))?;
        let mut coll = lock.write();
        for (key, value) in entries {
            if matches!(value.get_type(), ValueType::String | ValueType::Int64) {
                coll.attributes.insert(key, value);
            }
        }
        Ok(())
    }

    pub fn coll_attribute_get(&self, key: &str) -> Option<Value> {
        self.coll().ok()?.read().attributes.get(key).cloned()
    }

    pub fn coll_attribute_get_string(&self, key: &str) -> Option<String> {
        self.coll_attribute_get(key)?.get_string()
    }

    pub fn coll_attribute_get_int(&self, key: &str) -> Option<i64> {
        self.coll_attribute_get(key)?.get_int()
    }

    pub fn coll_attribute_remove(&self, key: &str) -> Result<(), ValueError> {
        self.coll()?
            .write()
            .attributes
            .shift_remove(key)
            .map(|_| ())
            .ok_or_else(|| ValueError::MissingKey(key.to_string()))
    }

    /// Attributes as a fresh dict value.
    pub fn coll_attributes(&self) -> Option<Value> {
        let dict = Value::new_dict();
        for (key, value) in self.coll().ok()?.read().attributes.iter() {
            dict.dict_set(key, value).ok()?;
        }
        Some(dict)
    }

    pub fn coll_idlist(&self) -> Option<Vec<i64>> {
        self.coll().ok().map(|c| c.read().idlist.clone())
    }

    /// Replace the id list wholesale.
    pub fn coll_set_idlist(&self, ids: &[i64]) -> Result<(), ValueError> {
        self.coll()?.write().idlist = ids.to_vec();
        Ok(())
    }

    pub fn coll_idlist_len(&self) -> Option<usize> {
        self.coll().ok().map(|c| c.read().idlist.len())
    }

    pub fn coll_idlist_append(&self, id: i64) -> Result<(), ValueError> {
        self.coll()?.write().idlist.push(id);
        Ok(())
    }

    pub fn coll_idlist_insert(&self, pos: isize, id: i64) -> Result<(), ValueError> {
        let mut coll = self.coll()?.write();
        let idx = absolute_position(pos, coll.idlist.len(), true)?;
        coll.idlist.insert(idx, id);
        Ok(())
    }

    pub fn coll_idlist_get(&self, pos: isize) -> Result<i64, ValueError> {
        let coll = self.coll()?.read();
        let idx = absolute_position(pos, coll.idlist.len(), false)?;
        Ok(coll.idlist[idx])
    }

    pub fn coll_idlist_set(&self, pos: isize, id: i64) -> Result<(), ValueError> {
        let mut coll = self.coll()?.write();
        let idx = absolute_position(pos, coll.idlist.len(), false)?;
        coll.idlist[idx] = id;
        Ok(())
    }

    pub fn coll_idlist_remove(&self, pos: isize) -> Result<i64, ValueError> {
        let mut coll = self.coll()?.write();
        let idx = absolute_position(pos, coll.idlist.len(), false)?;
        Ok(coll.idlist.remove(idx))
    }

    pub fn coll_idlist_move(&self, old_pos: isize, new_pos: isize) -> Result<(), ValueError> {
        let mut coll = self.coll()?.write();
        let len = coll.idlist.len();
        let from = absolute_position(old_pos, len, false)?;
        let to = absolute_position(new_pos, len, false)?;
        let id = coll.idlist.remove(from);
        coll.idlist.insert(to, id);
        Ok(())
    }

    pub fn coll_idlist_clear(&self) -> Result<(), ValueError> {
        self.coll()?.write().idlist.clear();
        Ok(())
    }

    /// Wrap `self` in an ORDER node.
    ///
    /// `order` is either a dict of attributes used as-is, or a string: an
    /// optional leading `-` selects descending order, then `"id"`,
    /// `"random"`, or a property name such as `"artist"`.
    pub fn add_order_operator(&self, order: &Value) -> Result<Value, ValueError> {
        let attrs = normalize_order(order)?;
        let ordered = Value::new_coll(CollType::Order);
        ordered.coll_add_operand(self)?;
        ordered.coll_attributes_set(&attrs)?;
        Ok(ordered)
    }

    /// Apply each entry of `orders` (a list) with [`Value::add_order_operator`].
    ///
    /// The first entry ends up outermost, so it is the primary sort key.
    pub fn add_order_operators(&self, orders: &Value) -> Result<Value, ValueError> {
        let entries = orders
            .list_items()
            .ok_or_else(|| orders.mismatch(ValueType::List))?;
        let mut current = self.clone();
        for order in entries.iter().rev() {
            current = current.add_order_operator(order)?;
        }
        Ok(current)
    }

    /// Wrap `self` in a LIMIT node. Zero disables either bound; if both are
    /// zero `self` is returned unchanged.
    pub fn add_limit_operator(&self, start: u32, length: u32) -> Result<Value, ValueError> {
        self.coll()?;
        if start == 0 && length == 0 {
            return Ok(self.clone());
        }
        let limited = Value::new_coll(CollType::Limit);
        limited.coll_add_operand(self)?;
        if start != 0 {
            limited.coll_attribute_set("start", &start.to_string())?;
        }
        if length != 0 {
            limited.coll_attribute_set("length", &length.to_string())?;
        }
        Ok(limited)
    }
}

fn normalize_order(order: &Value) -> Result<Value, ValueError> {
    if order.is_type(ValueType::Dict) {
        return Ok(order.clone());
    }
    let spec = order
        .get_string()
        .ok_or_else(|| ValueError::InvalidOperand("order entry must be string or dict".into()))?;

    let attrs = Value::new_dict();
    let key = match spec.strip_prefix('-') {
        Some(rest) => {
            attrs.dict_set_string("direction", "DESC")?;
            rest
        }
        None => spec.as_str(),
    };
    match key {
        "random" | "id" => attrs.dict_set_string("type", key)?,
        field => {
            attrs.dict_set_string("type", "value")?;
            attrs.dict_set_string("field", field)?;
        }
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_operands_must_be_collections() {
        let union = Value::new_coll(CollType::Union);
        assert!(matches!(
            union.coll_add_operand(&Value::new_int(1)),
            Err(ValueError::InvalidOperand(_))
        ));
        let a = Value::universe();
        union.coll_add_operand(&a).unwrap();
        assert_eq!(union.coll_operands().unwrap().len(), 1);

        union.coll_remove_operand(&a).unwrap();
        assert!(union.coll_remove_operand(&a).is_err());
    }

    #[test]
    fn test_reference_takes_no_operands() {
        let reference = Value::new_coll(CollType::Reference);
        reference.coll_attribute_set("reference", "All Media").unwrap();
        assert!(reference.coll_add_operand(&Value::universe()).is_err());
    }

    #[test]
    fn test_operand_cycle_rejected() {
        let a = Value::new_coll(CollType::Union);
        let b = Value::new_coll(CollType::Intersection);
        a.coll_add_operand(&b).unwrap();
        assert_eq!(b.coll_add_operand(&a), Err(ValueError::Cycle));
    }

    #[test]
    fn test_attributes() {
        let has = Value::new_coll(CollType::Has);
        has.coll_attribute_set("field", "artist").unwrap();
        has.coll_attribute_set_int("order", 3).unwrap();
        assert_eq!(has.coll_attribute_get_string("field").as_deref(), Some("artist"));
        assert_eq!(has.coll_attribute_get_int("order"), Some(3));

        has.coll_attribute_remove("order").unwrap();
        assert!(has.coll_attribute_get("order").is_none());
        assert!(has.coll_attribute_remove("order").is_err());
        assert_eq!(has.coll_attributes().unwrap().dict_keys().unwrap(), vec!["field"]);
    }

    #[test]
    fn test_idlist_editing() {
        let ids = Value::new_coll(CollType::IdList);
        for id in [10, 20, 30] {
            ids.coll_idlist_append(id).unwrap();
        }
        ids.coll_idlist_insert(1, 15).unwrap();
        ids.coll_idlist_move(-1, 0).unwrap();
        assert_eq!(ids.coll_idlist().unwrap(), vec![30, 10, 15, 20]);
        assert_eq!(ids.coll_idlist_remove(2).unwrap(), 15);
        ids.coll_idlist_set(-1, 21).unwrap();
        assert_eq!(ids.coll_idlist_get(-1).unwrap(), 21);
        assert_eq!(ids.coll_idlist_len(), Some(3));
        ids.coll_idlist_clear().unwrap();
        assert_eq!(ids.coll_idlist_len(), Some(0));
    }

    #[test]
    fn test_order_operators() {
        let universe = Value::universe();
        let orders = Value::new_list();
        orders.list_append(&Value::new_string("-artist")).unwrap();
        orders.list_append(&Value::new_string("id")).unwrap();

        let ordered = universe.add_order_operators(&orders).unwrap();
        assert_eq!(ordered.coll_type(), Some(CollType::Order));
        assert_eq!(ordered.coll_attribute_get_string("direction").as_deref(), Some("DESC"));
        assert_eq!(ordered.coll_attribute_get_string("type").as_deref(), Some("value"));
        assert_eq!(ordered.coll_attribute_get_string("field").as_deref(), Some("artist"));

        let inner = &ordered.coll_operands().unwrap()[0];
        assert_eq!(inner.coll_attribute_get_string("type").as_deref(), Some("id"));
        assert!(inner.coll_attribute_get("direction").is_none());
        assert!(inner.coll_operands().unwrap()[0].ptr_eq(&universe));

        assert!(universe.add_order_operator(&Value::new_int(1)).is_err());
    }

    #[test]
    fn test_limit_operator() {
        let universe = Value::universe();
        let same = universe.add_limit_operator(0, 0).unwrap();
        assert!(same.ptr_eq(&universe));

        let limited = universe.add_limit_operator(0, 25).unwrap();
        assert_eq!(limited.coll_type(), Some(CollType::Limit));
        assert!(limited.coll_attribute_get("start").is_none());
        assert_eq!(limited.coll_attribute_get_string("length").as_deref(), Some("25"));
    }
}
