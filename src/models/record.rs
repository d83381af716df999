//! Record and role types for prefclean.
//!
//! K_i: A record is an ordered mapping from field name to JSON value.
//! K_i: Stages only append fields; the pruner is the only stage that drops them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Well-known field names.
pub mod fields {
    pub const SYSTEM: &str = "system";
    pub const QUESTION: &str = "question";
    pub const INSTRUCTION: &str = "instruction";
    pub const CHOSEN: &str = "chosen";
    pub const REJECTED: &str = "rejected";
    pub const GENERATIONS: &str = "generations";
    pub const ORDER: &str = "order";
    pub const RATINGS: &str = "ratings";
    pub const RATIONALES: &str = "rationales";
    pub const MODEL_NAME: &str = "model_name";
}

/// Original role of a response in a preference pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Chosen,
    Rejected,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Chosen => fields::CHOSEN,
            Role::Rejected => fields::REJECTED,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named-field data unit flowing through the pipeline.
///
/// Field order is preserved through (de)serialization so that output JSONL
/// mirrors the order stages appended fields in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(IndexMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert or replace a field. New fields are appended at the end.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove a field, keeping the relative order of the remaining ones.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get a field as a string slice, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Get a field as a list of strings. Returns `None` if the field is
    /// missing, not an array, or contains a non-string element.
    pub fn get_str_array(&self, key: &str) -> Option<Vec<&str>> {
        self.0
            .get(key)?
            .as_array()?
            .iter()
            .map(Value::as_str)
            .collect()
    }

    /// Length of an array field, if present.
    fn array_len(&self, key: &str) -> Option<usize> {
        self.0.get(key).and_then(Value::as_array).map(Vec::len)
    }

    /// Rename keys according to `mapping` (source -> target).
    ///
    /// The renamed field keeps the position of its source key. Keys absent from
    /// the record are skipped. An existing field with the target name is
    /// replaced by the renamed value.
    pub fn rename_fields<'a, I>(&mut self, mapping: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (from, to) in mapping {
            if from == to {
                continue;
            }
            let Some(index) = self.0.get_index_of(from) else {
                continue;
            };
            if let Some(existing) = self.0.get_index_of(to) {
                self.0.shift_remove_index(existing);
            }
            // Removal above may have shifted the source one slot to the left.
            let index = self.0.get_index_of(from).unwrap_or(index);
            if let Some((_, value)) = self.0.shift_remove_index(index) {
                self.0.shift_insert(index, to.to_string(), value);
            }
        }
    }

    /// Check that `generations`, `order`, `ratings` and `rationales` agree in
    /// length where present.
    ///
    /// Returns the common length, or `None` when none of the fields exist.
    pub fn check_alignment(&self) -> Result<Option<usize>, String> {
        let mut expected: Option<(&str, usize)> = None;
        for key in [
            fields::GENERATIONS,
            fields::ORDER,
            fields::RATINGS,
            fields::RATIONALES,
        ] {
            let Some(len) = self.array_len(key) else {
                continue;
            };
            match expected {
                None => expected = Some((key, len)),
                Some((first, n)) if n != len => {
                    return Err(format!("'{first}' has {n} entries but '{key}' has {len}"));
                }
                Some(_) => {}
            }
        }
        Ok(expected.map(|(_, n)| n))
    }

    pub fn into_inner(self) -> IndexMap<String, Value> {
        self.0
    }
}

impl From<IndexMap<String, Value>> for Record {
    fn from(map: IndexMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl TryFrom<Value> for Record {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(format!("expected a JSON object, got {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::try_from(value).unwrap()
    }

    #[test]
    fn test_field_order_preserved_in_json() {
        let mut r = Record::new();
        r.insert("b", 1);
        r.insert("a", 2);
        assert_eq!(serde_json::to_string(&r).unwrap(), r#"{"b":1,"a":2}"#);

        let parsed: Record = serde_json::from_str(r#"{"z":1,"y":2,"x":3}"#).unwrap();
        assert_eq!(parsed.keys().collect::<Vec<_>>(), vec!["z", "y", "x"]);

        let from_value = record(json!({"question": "Q", "chosen": "A", "answer": "B"}));
        assert_eq!(
            from_value.keys().collect::<Vec<_>>(),
            vec!["question", "chosen", "answer"]
        );
    }

    #[test]
    fn test_rename_keeps_position() {
        let mut r = record(json!({"system": "", "question": "Q", "chosen": "A"}));
        r.rename_fields([("question", "instruction")]);
        assert_eq!(
            r.keys().collect::<Vec<_>>(),
            vec!["system", "instruction", "chosen"]
        );
        assert_eq!(r.get_str("instruction"), Some("Q"));
    }

    #[test]
    fn test_rename_absent_key_is_noop() {
        let mut r = record(json!({"instruction": "Q"}));
        let before = r.clone();
        r.rename_fields([("question", "instruction")]);
        assert_eq!(r, before);
    }

    #[test]
    fn test_rename_overwrites_existing_target() {
        let mut r = record(json!({"instruction": "old", "x": 1, "question": "new"}));
        r.rename_fields([("question", "instruction")]);
        assert_eq!(r.keys().collect::<Vec<_>>(), vec!["x", "instruction"]);
        assert_eq!(r.get_str("instruction"), Some("new"));
    }

    #[test]
    fn test_get_str_array() {
        let r = record(json!({"g": ["a", "b"], "mixed": ["a", 1]}));
        assert_eq!(r.get_str_array("g"), Some(vec!["a", "b"]));
        assert_eq!(r.get_str_array("mixed"), None);
        assert_eq!(r.get_str_array("missing"), None);
    }

    #[test]
    fn test_alignment() {
        let ok = record(json!({
            "generations": ["a", "b"],
            "order": ["chosen", "rejected"],
            "ratings": [5, null],
            "rationales": ["", ""],
        }));
        assert_eq!(ok.check_alignment(), Ok(Some(2)));

        let bad = record(json!({"generations": ["a", "b"], "ratings": [5]}));
        assert!(bad.check_alignment().is_err());

        assert_eq!(record(json!({"x": 1})).check_alignment(), Ok(None));
    }

    #[test]
    fn test_try_from_non_object_fails() {
        assert!(Record::try_from(json!([1, 2])).is_err());
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_value(Role::Chosen).unwrap(), json!("chosen"));
        assert_eq!(Role::Rejected.to_string(), "rejected");
    }
}
