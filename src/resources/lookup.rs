use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

use super::ResourceError;
use crate::model::{MapKey, RecordMetadata, Value};

/// Keyed read access to host data.
///
/// Rows are returned as field values in `metadata()` order. Tables live on
/// the program's thread.
pub trait LookupTable {
    fn metadata(&self) -> &Arc<RecordMetadata>;

    /// Positions of the key fields within a row.
    fn key_fields(&self) -> &[usize];

    fn init(&self) -> Result<(), ResourceError>;

    fn free(&self) -> Result<(), ResourceError>;

    /// Every row whose key fields equal `keys`.
    fn find(&self, keys: &[Value]) -> Result<Vec<Vec<Value>>, ResourceError>;
}

/// Table held entirely in memory and indexed by key on insertion.
#[derive(Debug)]
pub struct InMemoryLookup {
    metadata: Arc<RecordMetadata>,
    key_fields: Vec<usize>,
    rows: Vec<Vec<Value>>,
    index: HashMap<Vec<MapKey>, Vec<usize>>,
    initialized: Cell<bool>,
    /// Reject `find` before `init`.
    strict: bool,
}

impl InMemoryLookup {
    pub fn new(metadata: Arc<RecordMetadata>, key_fields: Vec<usize>) -> Self {
        Self {
            metadata,
            key_fields,
            rows: Vec::new(),
            index: HashMap::new(),
            initialized: Cell::new(false),
            strict: false,
        }
    }

    pub fn require_init(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Add a row. Rows with a non-scalar key are stored but never found.
    pub fn insert(&mut self, row: Vec<Value>) {
        let position = self.rows.len();
        if let Some(key) = self.key_of(&row) {
            self.index.entry(key).or_default().push(position);
        }
        self.rows.push(row);
    }

    pub fn with_row(mut self, row: Vec<Value>) -> Self {
        self.insert(row);
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    fn key_of(&self, row: &[Value]) -> Option<Vec<MapKey>> {
        self.key_fields
            .iter()
            .map(|i| row.get(*i).and_then(|v| MapKey::from_value(v).ok()))
            .collect()
    }
}

impl LookupTable for InMemoryLookup {
    fn metadata(&self) -> &Arc<RecordMetadata> {
        &self.metadata
    }

    fn key_fields(&self) -> &[usize] {
        &self.key_fields
    }

    fn init(&self) -> Result<(), ResourceError> {
        self.initialized.set(true);
        Ok(())
    }

    fn free(&self) -> Result<(), ResourceError> {
        self.initialized.set(false);
        Ok(())
    }

    fn find(&self, keys: &[Value]) -> Result<Vec<Vec<Value>>, ResourceError> {
        if self.strict && !self.initialized.get() {
            return Err(ResourceError::NotInitialized);
        }
        if keys.len() != self.key_fields.len() {
            return Err(ResourceError::KeyCount {
                expected: self.key_fields.len(),
                found: keys.len(),
            });
        }
        let Ok(key) = keys.iter().map(MapKey::from_value).collect::<Result<Vec<_>, _>>() else {
            return Ok(Vec::new());
        };
        let positions = self.index.get(&key).map(Vec::as_slice).unwrap_or_default();
        Ok(positions.iter().filter_map(|p| self.rows.get(*p).cloned()).collect())
    }
}
