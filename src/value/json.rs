//! JSON bridge: `serde::Serialize` for values and conversion from
//! `serde_json::Value`.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use super::{Node, Value};

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.node() {
            Node::None => serializer.serialize_unit(),
            Node::Error(message) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", message)?;
                map.end()
            }
            Node::Int64(i) => serializer.serialize_i64(*i),
            Node::Float(f) => serializer.serialize_f32(*f),
            Node::String(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
            Node::Binary(bytes) => serializer.serialize_bytes(bytes),
            Node::List(list) => {
                let list = list.read_recursive();
                let mut seq = serializer.serialize_seq(Some(list.items().len()))?;
                for item in list.items() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Node::Dict(dict) => {
                let dict = dict.read_recursive();
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (key, value) in dict.iter() {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Node::Coll(coll) => {
                let coll = coll.read_recursive();
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("type", &format!("{:?}", coll.kind()).to_lowercase())?;
                map.serialize_entry("attributes", coll.attributes())?;
                map.serialize_entry("idlist", coll.idlist())?;
                map.serialize_entry("operands", coll.operands())?;
                map.end()
            }
            Node::BitBuffer(bb) => serializer.serialize_bytes(bb.lock().as_bytes()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::new_none(),
            serde_json::Value::Bool(b) => Value::new_int(i64::from(b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::new_int(i),
                None => Value::new_float(n.as_f64().unwrap_or(f64::NAN) as f32),
            },
            serde_json::Value::String(s) => Value::new_string(s),
            serde_json::Value::Array(items) => Value::build_list(items.into_iter().map(Value::from)),
            serde_json::Value::Object(map) => {
                Value::build_dict(map.into_iter().map(|(k, v)| (k, Value::from(v))))
            }
        }
    }
}
