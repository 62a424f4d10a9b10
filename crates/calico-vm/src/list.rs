//! Ordered value lists with Scratch's 1-based index semantics.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Clamp a 1-based list index to the valid range.
///
/// Returns 0 (the "no-op" sentinel) when the list is empty or the index is
/// out of range, otherwise the index unchanged. Callers treat 0 as "do
/// nothing" (or "empty result" for reads).
pub fn fix_index(index: i64, len: usize) -> usize {
    if len == 0 || index < 1 || index > len as i64 {
        0
    } else {
        index as usize
    }
}

/// An ordered sequence of [`Value`]s backing a Scratch list.
///
/// The external index domain is 1-based; this type's own API is 0-based and
/// the interpreter translates through [`fix_index`] and the `"last"` /
/// `"all"` / `"random"` index literals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct List {
    items: Vec<Value>,
}

impl List {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }

    /// Insert at a 0-based position. Out-of-range positions append.
    pub fn insert(&mut self, index: usize, value: Value) {
        if index >= self.items.len() {
            self.items.push(value);
        } else {
            self.items.insert(index, value);
        }
    }

    /// Remove the item at a 0-based position, if it exists.
    pub fn remove_at(&mut self, index: usize) {
        if index < self.items.len() {
            self.items.remove(index);
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    /// Replace the item at a 0-based position, if it exists.
    pub fn set(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.items.get_mut(index) {
            *slot = value;
        }
    }

    /// 0-based position of the first item equal to `value`.
    pub fn index_of(&self, value: &Value) -> Option<usize> {
        self.items.iter().position(|item| item == value)
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.index_of(value).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }
}

impl fmt::Display for List {
    /// The Scratch join rule: when every item renders as a single character
    /// the items are concatenated, otherwise they are joined with spaces.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.items.iter().map(|v| v.to_string()).collect();
        let all_single = !rendered.is_empty() && rendered.iter().all(|s| s.chars().count() == 1);
        let separator = if all_single { "" } else { " " };
        write!(f, "{}", rendered.join(separator))
    }
}

impl FromIterator<Value> for List {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(items: &[&str]) -> List {
        items.iter().map(|s| Value::from(*s)).collect()
    }

    #[test]
    fn fix_index_clamps_to_noop() {
        assert_eq!(fix_index(1, 0), 0);
        assert_eq!(fix_index(0, 3), 0);
        assert_eq!(fix_index(-2, 3), 0);
        assert_eq!(fix_index(4, 3), 0);
        assert_eq!(fix_index(1, 3), 1);
        assert_eq!(fix_index(3, 3), 3);
    }

    #[test]
    fn push_remove_and_get() {
        let mut list = list_of(&["a", "b", "c"]);
        list.remove_at(1);
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(1), Some(&Value::from("c")));
        list.push(Value::from("d"));
        assert_eq!(list.index_of(&Value::from("d")), Some(2));
        list.clear();
        assert!(list.is_empty());
    }

    #[test]
    fn insert_appends_when_out_of_range() {
        let mut list = list_of(&["a"]);
        list.insert(5, Value::from("b"));
        assert_eq!(list.get(1), Some(&Value::from("b")));
    }

    #[test]
    fn index_of_uses_value_equality() {
        let list: List = [Value::from(10.0), Value::from("twenty")].into_iter().collect();
        assert_eq!(list.index_of(&Value::from("10")), Some(0));
        assert_eq!(list.index_of(&Value::from("TWENTY")), Some(1));
        assert_eq!(list.index_of(&Value::from("thirty")), None);
    }

    #[test]
    fn join_rule_single_characters() {
        assert_eq!(list_of(&["a", "b", "c"]).to_string(), "abc");
        assert_eq!(list_of(&["ab", "c"]).to_string(), "ab c");
        assert_eq!(list_of(&[]).to_string(), "");
        // A single multi-character item still joins with spaces (trivially).
        assert_eq!(list_of(&["hello"]).to_string(), "hello");
    }

    #[test]
    fn join_rule_with_numbers() {
        let list: List = [Value::from(1.0), Value::from(2.0)].into_iter().collect();
        assert_eq!(list.to_string(), "12");
        let list: List = [Value::from(1.0), Value::from(23.0)].into_iter().collect();
        assert_eq!(list.to_string(), "1 23");
    }
}
