//! Live views over list and map storage.
//!
//! A view holds the same handle as the field (or variable) it was taken
//! from, so every mutation is visible through the owner immediately.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use super::error::RuntimeError;
use super::value::{ListRef, MapKey, MapRef, RecordRef, Value};

#[derive(Debug, Clone)]
pub struct ListView {
    items: ListRef,
}

#[derive(Debug, Clone)]
pub struct MapView {
    entries: MapRef,
}

/// Window `[from, to)` of a parent list that writes through to it.
#[derive(Debug)]
pub struct SubListView {
    parent: ListRef,
    from: usize,
    to: usize,
}

fn check_index(index: i64, len: usize) -> Result<usize, RuntimeError> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < len)
        .ok_or(RuntimeError::IndexOutOfBounds { index, len })
}

#[allow(clippy::cast_possible_wrap)]
fn out_of_bounds(index: usize, len: usize) -> RuntimeError {
    RuntimeError::IndexOutOfBounds { index: index as i64, len }
}

impl ListView {
    /// Wrap a list value. Anything else is a type mismatch.
    pub fn wrap(value: &Value) -> Result<Self, RuntimeError> {
        match value {
            Value::List(items) => Ok(Self {
                items: items.clone(),
            }),
            other => Err(RuntimeError::type_mismatch("list", other.type_name())),
        }
    }

    /// View over a list field, installing empty storage when the field is null.
    pub fn from_field(record: &RecordRef, index: usize) -> Result<Self, RuntimeError> {
        let current = record.borrow().get(index).cloned().unwrap_or(Value::Null);
        if current.is_null() {
            let items: ListRef = Rc::new(RefCell::new(Vec::new()));
            record.borrow_mut().set(index, Value::List(items.clone()))?;
            return Ok(Self { items });
        }
        Self::wrap(&current)
    }

    pub fn handle(&self) -> &ListRef {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    pub fn get(&self, index: i64) -> Result<Value, RuntimeError> {
        let items = self.items.borrow();
        let i = check_index(index, items.len())?;
        Ok(items.get(i).cloned().unwrap_or(Value::Null))
    }

    /// Replace element `index`, returning the previous value.
    pub fn set(&self, index: i64, value: Value) -> Result<Value, RuntimeError> {
        let mut items = self.items.borrow_mut();
        let i = check_index(index, items.len())?;
        Ok(items.get_mut(i).map_or(Value::Null, |slot| std::mem::replace(slot, value)))
    }

    /// Assignment semantics of `list[i] = v`: writing past the end pads
    /// the gap with nulls.
    pub fn set_or_extend(&self, index: i64, value: Value) -> Result<(), RuntimeError> {
        let mut items = self.items.borrow_mut();
        let len = items.len();
        let i = usize::try_from(index).map_err(|_| RuntimeError::IndexOutOfBounds { index, len })?;
        if i >= items.len() {
            items.resize(i + 1, Value::Null);
        }
        if let Some(slot) = items.get_mut(i) {
            *slot = value;
        }
        Ok(())
    }

    pub fn add(&self, value: Value) {
        self.items.borrow_mut().push(value);
    }

    pub fn insert(&self, index: i64, value: Value) -> Result<(), RuntimeError> {
        let mut items = self.items.borrow_mut();
        let len = items.len();
        let i = usize::try_from(index)
            .ok()
            .filter(|i| *i <= len)
            .ok_or(RuntimeError::IndexOutOfBounds { index, len })?;
        items.insert(i, value);
        Ok(())
    }

    pub fn remove(&self, index: i64) -> Result<Value, RuntimeError> {
        let mut items = self.items.borrow_mut();
        let i = check_index(index, items.len())?;
        Ok(items.remove(i))
    }

    pub fn clear(&self) {
        self.items.borrow_mut().clear();
    }

    /// Iterator-style removal: keep only elements for which `keep` is true.
    pub fn retain(&self, mut keep: impl FnMut(&Value) -> bool) {
        self.items.borrow_mut().retain(|v| keep(v));
    }

    pub fn extend(&self, values: impl IntoIterator<Item = Value>) {
        self.items.borrow_mut().extend(values);
    }

    /// Snapshot of the current elements (element handles are shared).
    pub fn to_vec(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }

    pub fn sub_list(&self, from: usize, to: usize) -> Result<SubListView, RuntimeError> {
        let len = self.len();
        if from > to || to > len {
            return Err(out_of_bounds(to.max(from), len));
        }
        Ok(SubListView {
            parent: self.items.clone(),
            from,
            to,
        })
    }
}

impl SubListView {
    pub fn len(&self) -> usize {
        self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.to == self.from
    }

    pub fn get(&self, index: usize) -> Result<Value, RuntimeError> {
        if index >= self.len() {
            return Err(out_of_bounds(index, self.len()));
        }
        Ok(self.parent.borrow().get(self.from + index).cloned().unwrap_or(Value::Null))
    }

    pub fn set(&self, index: usize, value: Value) -> Result<Value, RuntimeError> {
        if index >= self.len() {
            return Err(out_of_bounds(index, self.len()));
        }
        let mut parent = self.parent.borrow_mut();
        Ok(parent
            .get_mut(self.from + index)
            .map_or(Value::Null, |slot| std::mem::replace(slot, value)))
    }

    pub fn add(&mut self, value: Value) {
        self.parent.borrow_mut().insert(self.to, value);
        self.to += 1;
    }

    pub fn remove(&mut self, index: usize) -> Result<Value, RuntimeError> {
        if index >= self.len() {
            return Err(out_of_bounds(index, self.len()));
        }
        self.to -= 1;
        Ok(self.parent.borrow_mut().remove(self.from + index))
    }

    pub fn clear(&mut self) {
        self.parent.borrow_mut().drain(self.from..self.to);
        self.to = self.from;
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.parent
            .borrow()
            .iter()
            .skip(self.from)
            .take(self.len())
            .cloned()
            .collect()
    }
}

impl MapView {
    pub fn wrap(value: &Value) -> Result<Self, RuntimeError> {
        match value {
            Value::Map(entries) => Ok(Self {
                entries: entries.clone(),
            }),
            other => Err(RuntimeError::type_mismatch("map", other.type_name())),
        }
    }

    /// View over a map field, installing empty storage when the field is null.
    pub fn from_field(record: &RecordRef, index: usize) -> Result<Self, RuntimeError> {
        let current = record.borrow().get(index).cloned().unwrap_or(Value::Null);
        if current.is_null() {
            let entries: MapRef = Rc::new(RefCell::new(IndexMap::new()));
            record.borrow_mut().set(index, Value::Map(entries.clone()))?;
            return Ok(Self { entries });
        }
        Self::wrap(&current)
    }

    pub fn handle(&self) -> &MapRef {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Value under `key`; a missing key reads as null.
    pub fn get(&self, key: &Value) -> Result<Value, RuntimeError> {
        let key = MapKey::from_value(key)?;
        Ok(self.entries.borrow().get(&key).cloned().unwrap_or(Value::Null))
    }

    pub fn put(&self, key: &Value, value: Value) -> Result<Option<Value>, RuntimeError> {
        let key = MapKey::from_value(key)?;
        Ok(self.entries.borrow_mut().insert(key, value))
    }

    /// Remove `key`, keeping the insertion order of the remaining entries.
    pub fn remove(&self, key: &Value) -> Result<Option<Value>, RuntimeError> {
        let key = MapKey::from_value(key)?;
        Ok(self.entries.borrow_mut().shift_remove(&key))
    }

    pub fn contains_key(&self, key: &Value) -> Result<bool, RuntimeError> {
        let key = MapKey::from_value(key)?;
        Ok(self.entries.borrow().contains_key(&key))
    }

    pub fn contains_value(&self, value: &Value) -> bool {
        self.entries
            .borrow()
            .values()
            .any(|v| super::value::structural_eq(v, value))
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.borrow().keys().map(MapKey::to_value).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.borrow().values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.entries
            .borrow()
            .iter()
            .map(|(k, v)| (k.to_value(), v.clone()))
            .collect()
    }

    /// Entry-set removal: keep only entries for which `keep` is true.
    pub fn retain(&self, mut keep: impl FnMut(&Value, &Value) -> bool) {
        self.entries.borrow_mut().retain(|k, v| keep(&k.to_value(), v));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::record::{FieldMetadata, Record, RecordMetadata};
    use crate::model::types::CtlType;
    use crate::model::value::new_list;
    use std::sync::Arc;

    fn record() -> RecordRef {
        Record::new_ref(Arc::new(RecordMetadata::new(
            "r",
            vec![
                FieldMetadata::new("items", CtlType::list_of(CtlType::Integer)),
                FieldMetadata::new("attrs", CtlType::map_of(CtlType::String, CtlType::String)),
                FieldMetadata::new("n", CtlType::Integer),
            ],
        )))
    }

    #[test]
    fn list_add_writes_through_to_field() {
        let rec = record();
        let view = ListView::from_field(&rec, 0).unwrap();
        view.add(Value::Integer(1));
        view.add(Value::Integer(7));
        let field = rec.borrow().get(0).cloned().unwrap();
        let through_field = ListView::wrap(&field).unwrap();
        assert_eq!(through_field.len(), 2);
        assert!(matches!(through_field.get(1).unwrap(), Value::Integer(7)));
    }

    #[test]
    fn field_mutation_is_visible_through_view() {
        let rec = record();
        rec.borrow_mut().set(0, new_list(vec![Value::Integer(1)])).unwrap();
        let view = ListView::from_field(&rec, 0).unwrap();
        if let Some(Value::List(items)) = rec.borrow().get(0) {
            items.borrow_mut().push(Value::Integer(2));
        }
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn map_put_is_visible_via_field() {
        let rec = record();
        let view = MapView::from_field(&rec, 1).unwrap();
        view.put(&Value::String("k".into()), Value::String("v".into())).unwrap();
        let field = rec.borrow().get(1).cloned().unwrap();
        let got = MapView::wrap(&field).unwrap().get(&Value::String("k".into())).unwrap();
        assert_eq!(got.to_string(), "v");
    }

    #[test]
    fn missing_map_key_reads_null() {
        let rec = record();
        let view = MapView::from_field(&rec, 1).unwrap();
        assert!(view.get(&Value::String("absent".into())).unwrap().is_null());
        view.put(&Value::Null, Value::Null).unwrap();
        assert!(view.contains_key(&Value::Null).unwrap());
    }

    #[test]
    fn wrapping_a_scalar_is_a_type_error() {
        let err = ListView::wrap(&Value::Integer(3)).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));
        let rec = record();
        rec.borrow_mut().set(2, Value::Integer(1)).unwrap();
        assert!(MapView::from_field(&rec, 2).is_err());
    }

    #[test]
    fn out_of_range_access_is_an_index_error() {
        let view = ListView::wrap(&new_list(vec![Value::Null])).unwrap();
        assert!(view.get(0).unwrap().is_null());
        assert!(matches!(view.get(1), Err(RuntimeError::IndexOutOfBounds { index: 1, len: 1 })));
        assert!(view.get(-1).is_err());
        assert!(view.remove(5).is_err());
    }

    #[test]
    fn sub_list_writes_through() {
        let view = ListView::wrap(&new_list((0..5).map(Value::Integer).collect())).unwrap();
        let mut sub = view.sub_list(1, 3).unwrap();
        sub.set(0, Value::Integer(10)).unwrap();
        sub.add(Value::Integer(99));
        let items: Vec<String> = view.to_vec().iter().map(ToString::to_string).collect();
        assert_eq!(items, ["0", "10", "2", "99", "3", "4"]);
        sub.clear();
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn retain_removes_through_iteration() {
        let view = ListView::wrap(&new_list((0..6).map(Value::Integer).collect())).unwrap();
        view.retain(|v| matches!(v, Value::Integer(i) if i % 2 == 0));
        assert_eq!(view.len(), 3);
        let map = MapView::wrap(&crate::model::value::new_map(IndexMap::new())).unwrap();
        map.put(&Value::Integer(1), Value::Integer(1)).unwrap();
        map.put(&Value::Integer(2), Value::Integer(2)).unwrap();
        map.retain(|k, _| matches!(k, Value::Integer(2)));
        assert_eq!(map.keys().len(), 1);
    }

    #[test]
    fn set_or_extend_pads_with_nulls() {
        let view = ListView::wrap(&new_list(Vec::new())).unwrap();
        view.set_or_extend(2, Value::Integer(5)).unwrap();
        assert_eq!(view.to_vec().len(), 3);
        assert!(view.get(0).unwrap().is_null());
    }
}
