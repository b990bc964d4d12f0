//! Sequences and lookup tables a program reaches through `sequence(...)`
//! and `lookup(...)`.
//!
//! Their storage belongs to the host. The crate only consumes the two
//! traits below and ships in-memory implementations for tests and the CLI.

pub mod lookup;
pub mod sequence;

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;

pub use lookup::{InMemoryLookup, LookupTable};
pub use sequence::{InMemorySequence, Sequence};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("not registered")]
    NotRegistered,
    #[error("not initialized")]
    NotInitialized,
    #[error("expected {expected} key(s), got {found}")]
    KeyCount { expected: usize, found: usize },
    #[error("value out of range for {0}")]
    OutOfRange(&'static str),
    #[error("{0}")]
    Backend(String),
}

/// Named resources handed to an `ExecutionContext`.
#[derive(Default, Clone)]
pub struct Resources {
    sequences: HashMap<String, Arc<dyn Sequence>>,
    lookups: HashMap<String, Rc<dyn LookupTable>>,
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("sequences", &self.sequences.keys().collect::<Vec<_>>())
            .field("lookups", &self.lookups.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sequence(mut self, name: impl Into<String>, sequence: Arc<dyn Sequence>) -> Self {
        self.sequences.insert(name.into(), sequence);
        self
    }

    pub fn with_lookup(mut self, name: impl Into<String>, table: Rc<dyn LookupTable>) -> Self {
        self.lookups.insert(name.into(), table);
        self
    }

    pub fn sequence(&self, name: &str) -> Result<&Arc<dyn Sequence>, ResourceError> {
        self.sequences.get(name).ok_or(ResourceError::NotRegistered)
    }

    pub fn lookup(&self, name: &str) -> Result<&Rc<dyn LookupTable>, ResourceError> {
        self.lookups.get(name).ok_or(ResourceError::NotRegistered)
    }

    pub fn lookup_names(&self) -> impl Iterator<Item = &str> {
        self.lookups.keys().map(String::as_str)
    }
}
