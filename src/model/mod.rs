pub mod container;
pub mod decimal;
pub mod error;
pub mod record;
pub mod types;
pub mod value;

// Re-export commonly used types at the model level.
pub use container::{ListView, MapView, SubListView};
pub use error::{DataError, RuntimeError};
pub use record::{FieldMetadata, Record, RecordMetadata};
pub use types::{CtlType, OpKind};
pub use value::{ArithOp, CompareOp, ListRef, MapKey, MapRef, RecordRef, Value};
