use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use indexmap::IndexMap;

use super::decimal;
use super::error::{DataError, RuntimeError};
use super::types::CtlType;
use super::value::{new_list, new_map, MapKey, RecordRef, Value};

/// Description of one field of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMetadata {
    pub name: String,
    pub ty: CtlType,
    pub nullable: bool,
    /// Total digits of a decimal field.
    pub length: Option<u32>,
    /// Fraction digits of a decimal field.
    pub scale: Option<u32>,
    pub label: Option<String>,
}

impl FieldMetadata {
    pub fn new(name: impl Into<String>, ty: CtlType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
            length: None,
            scale: None,
            label: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_precision(mut self, length: u32, scale: u32) -> Self {
        self.length = Some(length);
        self.scale = Some(scale);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Record schema. Records are identified by their metadata, not by instance.
#[derive(Debug, Clone)]
pub struct RecordMetadata {
    name: String,
    fields: Vec<FieldMetadata>,
    index: HashMap<String, usize>,
}

impl PartialEq for RecordMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.fields == other.fields
    }
}

impl RecordMetadata {
    pub fn new(name: impl Into<String>, fields: Vec<FieldMetadata>) -> Self {
        let index = fields.iter().enumerate().map(|(i, f)| (f.name.clone(), i)).collect();
        Self {
            name: name.into(),
            fields,
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldMetadata] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&FieldMetadata> {
        self.fields.get(index)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// One record instance: a value per metadata field.
#[derive(Debug, Clone)]
pub struct Record {
    metadata: Arc<RecordMetadata>,
    values: Vec<Value>,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.metadata.name() == other.metadata.name()
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| super::value::structural_eq(a, b))
    }
}

impl Record {
    pub fn new(metadata: Arc<RecordMetadata>) -> Self {
        let values = vec![Value::Null; metadata.field_count()];
        Self { metadata, values }
    }

    pub fn new_ref(metadata: Arc<RecordMetadata>) -> RecordRef {
        Rc::new(RefCell::new(Self::new(metadata)))
    }

    pub fn metadata(&self) -> &Arc<RecordMetadata> {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Field value. Containers come back as live handles into the record.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.metadata.field_index(name).and_then(|i| self.values.get(i))
    }

    /// Store a value after widening, nullability and decimal-scale checks.
    pub fn set(&mut self, index: usize, value: Value) -> Result<(), RuntimeError> {
        let Some(field) = self.metadata.field(index) else {
            return Err(RuntimeError::NoSuchField {
                record: self.metadata.name().to_string(),
                field: index.to_string(),
            });
        };
        if value.is_null() && !field.nullable {
            return Err(RuntimeError::NotNullable {
                record: self.metadata.name().to_string(),
                field: field.name.clone(),
            });
        }
        let mut value = value.coerce_to(&field.ty)?;
        if let (Value::Decimal(d), Some(length), Some(scale)) = (&value, field.length, field.scale)
        {
            value = Value::Decimal(decimal::fit(*d, length, scale)?);
        }
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
        Ok(())
    }

    pub fn set_by_name(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        let index = self.metadata.field_index(name).ok_or_else(|| RuntimeError::NoSuchField {
            record: self.metadata.name().to_string(),
            field: name.to_string(),
        })?;
        self.set(index, value)
    }

    pub fn reset(&mut self) {
        self.values.iter_mut().for_each(|v| *v = Value::Null);
    }

    pub fn deep_copy(&self) -> Record {
        Record {
            metadata: self.metadata.clone(),
            values: self.values.iter().map(Value::deep_copy).collect(),
        }
    }

    /// Copy every same-named field of `source` into this record by value.
    ///
    /// Fields whose types do not convert are left untouched.
    pub fn copy_by_name(&mut self, source: &Record) -> Result<(), RuntimeError> {
        for index in 0..self.metadata.field_count() {
            let Some(name) = self.metadata.field(index).map(|f| f.name.clone()) else {
                continue;
            };
            let Some(value) = source.get_by_name(&name) else {
                continue;
            };
            match self.set(index, value.deep_copy()) {
                Ok(()) | Err(RuntimeError::TypeMismatch { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Fill the record from a JSON object keyed by field name.
    pub fn populate_from_json(&mut self, json: &serde_json::Value) -> Result<(), DataError> {
        let serde_json::Value::Object(map) = json else {
            return Err(DataError::NotAnObject {
                record: self.metadata.name().to_string(),
            });
        };
        self.reset();
        for (key, raw) in map {
            let Some(index) = self.metadata.field_index(key) else {
                return Err(DataError::UnknownField {
                    record: self.metadata.name().to_string(),
                    field: key.clone(),
                });
            };
            let Some(field) = self.metadata.field(index) else {
                continue;
            };
            let value = json_to_value(&field.ty, raw).ok_or_else(|| self.bad_format(field, raw))?;
            let record = self.metadata.name().to_string();
            let field_name = field.name.clone();
            self.set(index, value).map_err(|e| match e {
                RuntimeError::NotNullable { .. } => {
                    DataError::NullValue { record, field: field_name }
                }
                other => DataError::BadFormat {
                    record,
                    field: field_name,
                    value: raw.to_string(),
                    target: other.to_string(),
                },
            })?;
        }
        Ok(())
    }

    fn bad_format(&self, field: &FieldMetadata, raw: &serde_json::Value) -> DataError {
        DataError::BadFormat {
            record: self.metadata.name().to_string(),
            field: field.name.clone(),
            value: raw.to_string(),
            target: field.ty.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .metadata
            .fields()
            .iter()
            .zip(&self.values)
            .map(|(f, v)| (f.name.clone(), value_to_json(v)))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (field, value)) in self.metadata.fields().iter().zip(&self.values).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={value}", field.name)?;
        }
        write!(f, "}}")
    }
}

// ── Text and JSON conversion ────────────────────────────────────────

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.3f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Parse a date in one of the accepted layouts, or with an explicit
/// chrono `pattern` when one is given.
pub fn parse_date(text: &str, pattern: Option<&str>) -> Option<chrono::DateTime<Utc>> {
    let text = text.trim();
    let date_only =
        |p: &str| NaiveDate::parse_from_str(text, p).ok().and_then(|d| d.and_hms_opt(0, 0, 0));
    let naive = match pattern {
        Some(p) => NaiveDateTime::parse_from_str(text, p).ok().or_else(|| date_only(p)),
        None => DATE_FORMATS
            .iter()
            .find_map(|p| NaiveDateTime::parse_from_str(text, p).ok())
            .or_else(|| date_only("%Y-%m-%d")),
    }?;
    Utc.from_local_datetime(&naive).single()
}

/// Convert field text to a scalar of type `ty`.
pub fn parse_scalar(ty: &CtlType, text: &str) -> Option<Value> {
    let trimmed = text.trim();
    Some(match ty {
        CtlType::String => Value::String(text.to_string()),
        CtlType::Integer => Value::Integer(trimmed.parse().ok()?),
        CtlType::Long => Value::Long(trimmed.parse().ok()?),
        CtlType::Number => Value::Number(trimmed.parse().ok()?),
        CtlType::Decimal => Value::Decimal(decimal::parse(trimmed)?),
        CtlType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => Value::Boolean(true),
            "false" | "f" | "no" | "0" => Value::Boolean(false),
            _ => return None,
        },
        CtlType::Date => Value::Date(parse_date(trimmed, None)?),
        _ => return None,
    })
}

pub fn json_to_value(ty: &CtlType, json: &serde_json::Value) -> Option<Value> {
    use serde_json::Value as J;
    Some(match (ty, json) {
        (_, J::Null) => Value::Null,
        (CtlType::Integer, J::Number(n)) => Value::Integer(i32::try_from(n.as_i64()?).ok()?),
        (CtlType::Long, J::Number(n)) => Value::Long(n.as_i64()?),
        (CtlType::Number, J::Number(n)) => Value::Number(n.as_f64()?),
        (CtlType::Decimal, J::Number(n)) => Value::Decimal(decimal::parse(&n.to_string())?),
        (CtlType::Boolean, J::Bool(b)) => Value::Boolean(*b),
        (CtlType::List(elem), J::Array(items)) => new_list(
            items.iter().map(|item| json_to_value(elem, item)).collect::<Option<Vec<_>>>()?,
        ),
        (CtlType::Map(key_ty, value_ty), J::Object(entries)) => {
            let mut map = IndexMap::new();
            for (k, v) in entries {
                let key = MapKey::from_value(&parse_scalar(key_ty, k)?).ok()?;
                map.insert(key, json_to_value(value_ty, v)?);
            }
            new_map(map)
        }
        (ty, J::String(s)) => parse_scalar(ty, s)?,
        _ => return None,
    })
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as J;
    match value {
        Value::Null => J::Null,
        Value::Integer(i) => J::from(*i),
        Value::Long(l) => J::from(*l),
        Value::Number(n) => serde_json::Number::from_f64(*n).map_or(J::Null, J::Number),
        Value::Boolean(b) => J::Bool(*b),
        Value::Decimal(_) | Value::String(_) | Value::Date(_) => J::String(value.to_string()),
        Value::List(items) => J::Array(items.borrow().iter().map(value_to_json).collect()),
        Value::Map(entries) => J::Object(
            entries
                .borrow()
                .iter()
                .map(|(k, v)| (k.to_value().to_string(), value_to_json(v)))
                .collect(),
        ),
        Value::Record(rec) => rec.borrow().to_json(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn person() -> Arc<RecordMetadata> {
        Arc::new(RecordMetadata::new(
            "person",
            vec![
                FieldMetadata::new("name", CtlType::String).not_null(),
                FieldMetadata::new("age", CtlType::Integer),
                FieldMetadata::new("salary", CtlType::Decimal).with_precision(10, 2),
                FieldMetadata::new("tags", CtlType::list_of(CtlType::String)),
            ],
        ))
    }

    #[test]
    fn access_by_name_and_position() {
        let mut rec = Record::new(person());
        rec.set_by_name("age", Value::Integer(42)).unwrap();
        assert!(matches!(rec.get(1), Some(Value::Integer(42))));
        assert!(matches!(rec.get_by_name("age"), Some(Value::Integer(42))));
        assert!(rec.get_by_name("missing").is_none());
    }

    #[test]
    fn non_nullable_field_rejects_null() {
        let mut rec = Record::new(person());
        let err = rec.set_by_name("name", Value::Null).unwrap_err();
        assert!(matches!(err, RuntimeError::NotNullable { .. }));
    }

    #[test]
    fn decimal_field_is_rescaled() {
        let mut rec = Record::new(person());
        rec.set_by_name("salary", Value::Integer(5)).unwrap();
        assert_eq!(rec.get_by_name("salary").unwrap().to_string(), "5.00");
        rec.set_by_name("salary", Value::Decimal(Decimal::new(12345, 3))).unwrap();
        assert_eq!(rec.get_by_name("salary").unwrap().to_string(), "12.34");
    }

    #[test]
    fn copy_by_name_is_independent() {
        let mut a = Record::new(person());
        let mut b = Record::new(person());
        b.set_by_name("name", Value::String("Ann".into())).unwrap();
        b.set_by_name("tags", new_list(vec![Value::String("x".into())])).unwrap();
        a.copy_by_name(&b).unwrap();
        a.set_by_name("name", Value::String("Bob".into())).unwrap();
        if let Some(Value::List(tags)) = a.get_by_name("tags") {
            tags.borrow_mut().clear();
        }
        assert_eq!(b.get_by_name("name").unwrap().to_string(), "Ann");
        assert_eq!(b.get_by_name("tags").unwrap().to_string(), "[x]");
    }

    #[test]
    fn copy_by_name_skips_missing_fields() {
        let other = Arc::new(RecordMetadata::new(
            "other",
            vec![FieldMetadata::new("age", CtlType::Long), FieldMetadata::new("x", CtlType::Date)],
        ));
        let mut src = Record::new(other);
        src.set_by_name("age", Value::Long(7)).unwrap();
        let mut dst = Record::new(person());
        dst.copy_by_name(&src).unwrap();
        assert!(dst.get_by_name("age").unwrap().is_null());
    }

    #[test]
    fn populate_from_json_reports_bad_data() {
        let mut rec = Record::new(person());
        let json = serde_json::json!({"name": "Ann", "age": "41", "tags": ["a"]});
        rec.populate_from_json(&json).unwrap();
        assert!(matches!(rec.get_by_name("age"), Some(Value::Integer(41))));

        let json = serde_json::json!({"name": "Ann", "age": "old"});
        let err = rec.populate_from_json(&json).unwrap_err();
        assert!(matches!(err, DataError::BadFormat { .. }));
        let err = rec.populate_from_json(&serde_json::json!({"name": null})).unwrap_err();
        assert!(matches!(err, DataError::NullValue { .. }));
        let err = rec.populate_from_json(&serde_json::json!({"nope": 1})).unwrap_err();
        assert!(matches!(err, DataError::UnknownField { .. }));
    }

    #[test]
    fn json_round_trip_of_record() {
        let mut rec = Record::new(person());
        rec.populate_from_json(&serde_json::json!({"name": "Ann", "salary": "3.5"})).unwrap();
        let json = rec.to_json();
        assert_eq!(json["name"], "Ann");
        assert_eq!(json["salary"], "3.50");
        assert!(json["age"].is_null());
    }

    #[test]
    fn date_parsing_layouts() {
        assert!(parse_date("2024-03-01", None).is_some());
        assert!(parse_date("2024-03-01 10:11:12", None).is_some());
        assert!(parse_date("01/03/2024", Some("%d/%m/%Y")).is_some());
        assert!(parse_date("garbage", None).is_none());
    }
}
