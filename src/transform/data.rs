use serde::{Deserialize, Serialize};

use super::TransformError;
use crate::model::DataError;

/// What to do with a record whose raw data cannot be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataErrorPolicy {
    /// Abort the run.
    #[default]
    Strict,
    /// Log the record and continue with the next one.
    Skip,
}

/// Applies a `DataErrorPolicy` to record population results.
#[derive(Debug, Clone, Default)]
pub struct DataErrorHandler {
    policy: DataErrorPolicy,
    skipped: usize,
}

impl DataErrorHandler {
    pub fn new(policy: DataErrorPolicy) -> Self {
        Self { policy, skipped: 0 }
    }

    pub fn policy(&self) -> DataErrorPolicy {
        self.policy
    }

    /// Records dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// `Some(value)` on success, `None` when the record is skipped.
    pub fn handle<T>(&mut self, result: Result<T, DataError>) -> Result<Option<T>, TransformError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if self.policy == DataErrorPolicy::Skip => {
                self.skipped += 1;
                log::warn!("skipping record: {e}");
                Ok(None)
            }
            Err(e) => Err(TransformError::Data(e)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn bad() -> Result<(), DataError> {
        Err(DataError::NotAnObject {
            record: "person".into(),
        })
    }

    #[test]
    fn strict_aborts() {
        let mut handler = DataErrorHandler::new(DataErrorPolicy::Strict);
        assert!(matches!(handler.handle(bad()), Err(TransformError::Data(_))));
        assert_eq!(handler.skipped(), 0);
    }

    #[test]
    fn skip_counts_and_continues() {
        let mut handler = DataErrorHandler::new(DataErrorPolicy::Skip);
        assert!(handler.handle(bad()).unwrap().is_none());
        assert_eq!(handler.handle(Ok(5)).unwrap(), Some(5));
        assert_eq!(handler.skipped(), 1);
    }
}
