//! Caller-owned execution state and the value operations both back-ends
//! share: stores, indexing, iteration and resource access.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use super::ast::{BinaryOp, LookupOp, SequenceOp};
use super::program::SequenceRef;
use super::scope::SymbolTable;
use crate::model::value::{arithmetic, compare_values};
use crate::model::{
    CtlType, ListView, MapView, OpKind, Record, RecordMetadata, RecordRef, RuntimeError, Value,
};
use crate::resources::Resources;

pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Default)]
struct LookupCursor {
    rows: Vec<Vec<Value>>,
    next: usize,
}

/// Global variables, resource bindings and call bookkeeping of one program
/// instance.
///
/// The caller owns it. Reusing a context across records keeps the global
/// scope alive; [`ExecutionContext::reset`] discards it.
#[derive(Debug)]
pub struct ExecutionContext {
    globals: Vec<Value>,
    initialized: bool,
    resources: Resources,
    cursors: HashMap<String, LookupCursor>,
    call_depth: usize,
    max_call_depth: usize,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            globals: Vec::new(),
            initialized: false,
            resources: Resources::default(),
            cursors: HashMap::new(),
            call_depth: 0,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Whether global code has completed in this context.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    /// Drop every global and lookup cursor.
    pub fn reset(&mut self) {
        self.globals.clear();
        self.cursors.clear();
        self.initialized = false;
        self.call_depth = 0;
    }

    /// Allocate default-valued slots for globals not yet present.
    pub(crate) fn ensure_globals(&mut self, symbols: &SymbolTable) {
        for slot in symbols.globals.iter().skip(self.globals.len()) {
            self.globals.push(Value::default_for(&slot.ty));
        }
    }

    /// Current value of global `slot`; `None` before global code ran.
    pub fn global(&self, slot: usize) -> Option<&Value> {
        self.globals.get(slot)
    }

    pub(crate) fn load_global(&self, slot: u16) -> Value {
        self.globals.get(usize::from(slot)).cloned().unwrap_or(Value::Null)
    }

    pub(crate) fn store_global(&mut self, slot: u16, value: Value) {
        let slot = usize::from(slot);
        if slot >= self.globals.len() {
            self.globals.resize(slot + 1, Value::Null);
        }
        if let Some(target) = self.globals.get_mut(slot) {
            *target = value;
        }
    }

    pub(crate) fn enter_call(&mut self) -> Result<(), RuntimeError> {
        if self.call_depth >= self.max_call_depth {
            return Err(RuntimeError::StackOverflow(self.max_call_depth));
        }
        self.call_depth += 1;
        Ok(())
    }

    pub(crate) fn leave_call(&mut self) {
        self.call_depth = self.call_depth.saturating_sub(1);
    }

    // ── Resources ─────────────────────────────────────────────────

    pub(crate) fn sequence(
        &self,
        sequence: &SequenceRef,
        op: SequenceOp,
    ) -> Result<Value, RuntimeError> {
        let name = &sequence.name;
        let fail = |message: String| RuntimeError::Sequence { name: name.clone(), message };
        let handle = self.resources.sequence(name).map_err(|e| fail(e.to_string()))?;
        let raw = match op {
            SequenceOp::Next => handle.next_value(),
            SequenceOp::Current => handle.current_value(),
            SequenceOp::Reset => {
                return handle.reset().map(|()| Value::Null).map_err(|e| fail(e.to_string()));
            }
        }
        .map_err(|e| fail(e.to_string()))?;
        match sequence.ty {
            CtlType::Long => Ok(Value::Long(raw)),
            CtlType::String => Ok(Value::String(raw.to_string())),
            _ => i32::try_from(raw)
                .map(Value::Integer)
                .map_err(|_| fail(format!("value {raw} does not fit integer"))),
        }
    }

    /// Run a lookup operation. `get` remembers its matches so `next` can
    /// walk through duplicate keys.
    pub(crate) fn lookup(
        &mut self,
        name: &str,
        op: LookupOp,
        keys: &[Value],
    ) -> Result<Value, RuntimeError> {
        let fail = |message: String| RuntimeError::Lookup { name: name.to_string(), message };
        let table = Rc::clone(self.resources.lookup(name).map_err(|e| fail(e.to_string()))?);
        match op {
            LookupOp::Init => table.init().map(|()| Value::Null).map_err(|e| fail(e.to_string())),
            LookupOp::Free => {
                self.cursors.remove(name);
                table.free().map(|()| Value::Null).map_err(|e| fail(e.to_string()))
            }
            LookupOp::Count => {
                let rows = table.find(keys).map_err(|e| fail(e.to_string()))?;
                i32::try_from(rows.len())
                    .map(Value::Integer)
                    .map_err(|_| fail("too many matches".into()))
            }
            LookupOp::Get => {
                let rows = table.find(keys).map_err(|e| fail(e.to_string()))?;
                let cursor = self.cursors.entry(name.to_string()).or_default();
                *cursor = LookupCursor { rows, next: 0 };
                advance(cursor, table.metadata()).map_err(|e| fail(e.to_string()))
            }
            LookupOp::Next => match self.cursors.get_mut(name) {
                Some(cursor) => advance(cursor, table.metadata()).map_err(|e| fail(e.to_string())),
                None => Ok(Value::Null),
            },
        }
    }
}

fn advance(
    cursor: &mut LookupCursor,
    metadata: &Arc<RecordMetadata>,
) -> Result<Value, RuntimeError> {
    let Some(row) = cursor.rows.get(cursor.next) else {
        return Ok(Value::Null);
    };
    cursor.next += 1;
    let record = Record::new_ref(metadata.clone());
    {
        let mut record = record.borrow_mut();
        for (index, value) in row.iter().enumerate() {
            record.set(index, value.clone())?;
        }
    }
    Ok(Value::Record(record))
}

// ── Shared value operations ───────────────────────────────────────

/// Value to store into a slot of type `ty`: widened, with lists and maps
/// copied so the slot owns its container.
pub(crate) fn prepare_store(value: Value, ty: &CtlType) -> Result<Value, RuntimeError> {
    let value = value.coerce_to(ty)?;
    Ok(match value {
        Value::List(_) | Value::Map(_) => value.deep_copy(),
        other => other,
    })
}

/// Non-short-circuit binary operator with operands promoted to `kind`.
pub(crate) fn binary(
    op: BinaryOp,
    lhs: &Value,
    rhs: &Value,
    kind: OpKind,
) -> Result<Value, RuntimeError> {
    if let Some(arith) = op.arith() {
        return arithmetic(arith, lhs, rhs, kind);
    }
    if let Some(compare) = op.compare() {
        return compare_values(compare, lhs, rhs, kind).map(Value::Boolean);
    }
    let (a, b) = (lhs.as_bool()?, rhs.as_bool()?);
    Ok(Value::Boolean(if op == BinaryOp::And { a && b } else { a || b }))
}

pub(crate) fn load_field(record: &Value, index: usize) -> Result<Value, RuntimeError> {
    let record = record_of(record, "field access")?;
    let record = record.borrow();
    record.get(index).cloned().ok_or_else(|| RuntimeError::NoSuchField {
        record: record.metadata().name().to_string(),
        field: index.to_string(),
    })
}

pub(crate) fn store_field(record: &Value, index: usize, value: Value) -> Result<(), RuntimeError> {
    let record = record_of(record, "field assignment")?;
    let value = match value {
        Value::List(_) | Value::Map(_) => value.deep_copy(),
        other => other,
    };
    record.borrow_mut().set(index, value)
}

/// `target.* = source.*`: value copy of every same-named field.
pub(crate) fn copy_record(target: &Value, source: &Value) -> Result<(), RuntimeError> {
    let target = record_of(target, "record copy")?;
    let source = record_of(source, "record copy")?;
    if Rc::ptr_eq(target, source) {
        return Ok(());
    }
    let source = source.borrow();
    target.borrow_mut().copy_by_name(&source)
}

fn record_of<'v>(value: &'v Value, operation: &str) -> Result<&'v RecordRef, RuntimeError> {
    match value {
        Value::Null => Err(RuntimeError::null_operand(operation)),
        other => other.as_record(),
    }
}

pub(crate) fn load_index(container: &Value, index: &Value) -> Result<Value, RuntimeError> {
    match container {
        Value::Null => Err(RuntimeError::null_operand("index access")),
        Value::Map(_) => MapView::wrap(container)?.get(index),
        _ => ListView::wrap(container)?.get(list_position(index)?),
    }
}

pub(crate) fn store_index(
    container: &Value,
    index: &Value,
    value: Value,
) -> Result<(), RuntimeError> {
    let value = match value {
        Value::List(_) | Value::Map(_) => value.deep_copy(),
        other => other,
    };
    match container {
        Value::Null => Err(RuntimeError::null_operand("index assignment")),
        Value::Map(_) => MapView::wrap(container)?.put(index, value).map(drop),
        _ => ListView::wrap(container)?.set(list_position(index)?, value).map(drop),
    }
}

fn list_position(index: &Value) -> Result<i64, RuntimeError> {
    match index {
        Value::Null => Err(RuntimeError::null_operand("list index")),
        other => other.as_i64(),
    }
}

/// Snapshot of the values a `foreach` over `collection` binds, each
/// converted to the loop variable type `element`.
///
/// Records yield the fields whose declared type equals `element`.
pub(crate) fn foreach_items(
    collection: &Value,
    element: &CtlType,
) -> Result<Vec<Value>, RuntimeError> {
    let items = match collection {
        Value::Null => return Err(RuntimeError::null_operand("foreach")),
        Value::List(_) => ListView::wrap(collection)?.to_vec(),
        Value::Map(_) => MapView::wrap(collection)?.values(),
        Value::Record(record) => {
            let record = record.borrow();
            return Ok(record
                .metadata()
                .fields()
                .iter()
                .enumerate()
                .filter(|(_, f)| f.ty == *element)
                .filter_map(|(i, _)| record.get(i).cloned())
                .collect());
        }
        other => return Err(RuntimeError::type_mismatch("list, map or record", other.type_name())),
    };
    items.into_iter().map(|item| item.coerce_to(element)).collect()
}

/// Whether a switch scrutinee selects the arm labelled `label`.
pub(crate) fn case_matches(
    scrutinee: &Value,
    label: &Value,
    kind: OpKind,
) -> Result<bool, RuntimeError> {
    crate::model::value::equals(scrutinee, label, kind)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::model::value::{new_list, new_map};
    use crate::model::{FieldMetadata, MapKey};
    use crate::resources::{InMemoryLookup, InMemorySequence};

    fn rate_meta() -> Arc<RecordMetadata> {
        Arc::new(RecordMetadata::new(
            "rate",
            vec![
                FieldMetadata::new("code", CtlType::String),
                FieldMetadata::new("value", CtlType::Integer),
            ],
        ))
    }

    fn context() -> ExecutionContext {
        let table = InMemoryLookup::new(rate_meta(), vec![0])
            .with_row(vec![Value::String("EUR".into()), Value::Integer(1)])
            .with_row(vec![Value::String("EUR".into()), Value::Integer(2)]);
        let resources = Resources::new()
            .with_sequence("ids", Arc::new(InMemorySequence::new(5, 1)))
            .with_lookup("rates", Rc::new(table));
        ExecutionContext::new().with_resources(resources)
    }

    #[test]
    fn sequence_results_follow_requested_type() {
        let ctx = context();
        let long = SequenceRef {
            name: "ids".into(),
            ty: CtlType::Long,
        };
        let text = SequenceRef {
            name: "ids".into(),
            ty: CtlType::String,
        };
        assert!(matches!(ctx.sequence(&long, SequenceOp::Next).unwrap(), Value::Long(5)));
        let next = ctx.sequence(&text, SequenceOp::Next).unwrap();
        assert!(matches!(next, Value::String(s) if s == "6"));
        let missing = SequenceRef {
            name: "nope".into(),
            ty: CtlType::Integer,
        };
        let err = ctx.sequence(&missing, SequenceOp::Next);
        assert!(matches!(err, Err(RuntimeError::Sequence { .. })));
    }

    #[test]
    fn lookup_get_then_next_walks_duplicates() {
        let mut ctx = context();
        let key = [Value::String("EUR".into())];
        let first = ctx.lookup("rates", LookupOp::Get, &key).unwrap();
        assert_eq!(load_field(&first, 1).unwrap().as_i64().unwrap(), 1);
        let second = ctx.lookup("rates", LookupOp::Next, &[]).unwrap();
        assert_eq!(load_field(&second, 1).unwrap().as_i64().unwrap(), 2);
        assert!(ctx.lookup("rates", LookupOp::Next, &[]).unwrap().is_null());
        assert!(matches!(ctx.lookup("rates", LookupOp::Count, &key).unwrap(), Value::Integer(2)));
    }

    #[test]
    fn call_depth_is_bounded() {
        let mut ctx = ExecutionContext::new().with_max_call_depth(2);
        ctx.enter_call().unwrap();
        ctx.enter_call().unwrap();
        assert!(matches!(ctx.enter_call(), Err(RuntimeError::StackOverflow(2))));
        ctx.leave_call();
        ctx.enter_call().unwrap();
    }

    #[test]
    fn stores_copy_containers_but_alias_records() {
        let list = new_list(vec![Value::Integer(1)]);
        let stored = prepare_store(list.clone(), &CtlType::list_of(CtlType::Integer)).unwrap();
        ListView::wrap(&list).unwrap().add(Value::Integer(2));
        assert_eq!(ListView::wrap(&stored).unwrap().len(), 1);

        let record = Value::Record(Record::new_ref(rate_meta()));
        let alias = prepare_store(record.clone(), &CtlType::Record(rate_meta())).unwrap();
        store_field(&alias, 0, Value::String("X".into())).unwrap();
        assert_eq!(load_field(&record, 0).unwrap().as_str().unwrap(), "X");
    }

    #[test]
    fn index_access_on_lists_and_maps() {
        let list = new_list(vec![Value::Integer(1)]);
        assert!(matches!(
            load_index(&list, &Value::Integer(3)),
            Err(RuntimeError::IndexOutOfBounds { index: 3, len: 1 })
        ));
        let map = new_map(IndexMap::new());
        assert!(load_index(&map, &Value::String("k".into())).unwrap().is_null());
        store_index(&map, &Value::String("k".into()), Value::Integer(7)).unwrap();
        let Value::Map(entries) = &map else {
            unreachable!();
        };
        assert!(entries.borrow().contains_key(&MapKey::String("k".into())));
    }

    #[test]
    fn foreach_over_record_fields_by_type() {
        let record = Record::new_ref(rate_meta());
        record.borrow_mut().set(0, Value::String("EUR".into())).unwrap();
        record.borrow_mut().set(1, Value::Integer(3)).unwrap();
        let strings = foreach_items(&Value::Record(record), &CtlType::String).unwrap();
        assert_eq!(strings.len(), 1);
        let list = new_list(vec![Value::String("x".into())]);
        let err = foreach_items(&list, &CtlType::Integer);
        assert!(matches!(err, Err(RuntimeError::TypeMismatch { .. })));
    }

    #[test]
    fn record_copy_onto_itself_is_a_no_op() {
        let record = Value::Record(Record::new_ref(rate_meta()));
        copy_record(&record, &record).unwrap();
    }
}
