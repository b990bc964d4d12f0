use std::error::Error as _;

use thiserror::Error;

use super::decimal::DecimalError;

/// Failure raised while a CTL program runs.
///
/// These abort the current record unless an `...OnError` variant of the
/// failing entry point catches them.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("null value in {operation}")]
    NullOperand { operation: String },
    #[error("field '{field}' of record '{record}' is not nullable")]
    NotNullable { record: String, field: String },
    #[error("field '{field}' does not exist in record '{record}'")]
    NoSuchField { record: String, field: String },
    #[error("{0}")]
    Decimal(DecimalError),
    #[error("cannot convert '{value}' to {target}")]
    Conversion { value: String, target: String },
    #[error("function '{0}' is not declared")]
    UnknownFunction(String),
    #[error("lookup '{name}': {message}")]
    Lookup { name: String, message: String },
    #[error("sequence '{name}': {message}")]
    Sequence { name: String, message: String },
    #[error("call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("record port {0} is not bound")]
    UnboundPort(String),
    #[error("{0}")]
    User(String),
    #[error("function '{function}' failed")]
    FunctionFailed {
        function: String,
        #[source]
        source: Box<RuntimeError>,
    },
}

impl RuntimeError {
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        RuntimeError::TypeMismatch { expected: expected.into(), found: found.into() }
    }

    pub fn null_operand(operation: impl Into<String>) -> Self {
        RuntimeError::NullOperand { operation: operation.into() }
    }

    /// Wrap this error with the name of the function it escaped from.
    pub fn in_function(self, function: impl Into<String>) -> Self {
        RuntimeError::FunctionFailed { function: function.into(), source: Box::new(self) }
    }

    /// Innermost error, skipping the function frames.
    pub fn root(&self) -> &RuntimeError {
        match self {
            RuntimeError::FunctionFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// One line per frame, outermost first, ending with the root cause.
    pub fn stack_trace(&self) -> String {
        let mut lines = vec![self.to_string()];
        let mut current = self.source();
        while let Some(cause) = current {
            lines.push(format!("caused by: {cause}"));
            current = cause.source();
        }
        lines.join("\n")
    }
}

impl From<DecimalError> for RuntimeError {
    fn from(e: DecimalError) -> Self {
        match e {
            DecimalError::DivisionByZero => RuntimeError::DivisionByZero,
            other => RuntimeError::Decimal(other),
        }
    }
}

/// Recoverable conversion failure while populating a record from raw input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("record '{record}', field '{field}': cannot parse '{value}' as {target}")]
    BadFormat {
        record: String,
        field: String,
        value: String,
        target: String,
    },
    #[error("record '{record}', field '{field}': null value in non-nullable field")]
    NullValue { record: String, field: String },
    #[error("record '{record}': unknown field '{field}'")]
    UnknownField { record: String, field: String },
    #[error("record '{record}': expected a JSON object")]
    NotAnObject { record: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn stack_trace_lists_every_frame() {
        let err = RuntimeError::DivisionByZero.in_function("inner").in_function("transform");
        let trace = err.stack_trace();
        let lines: Vec<&str> = trace.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "function 'transform' failed");
        assert_eq!(lines[2], "caused by: division by zero");
        assert!(matches!(err.root(), RuntimeError::DivisionByZero));
    }

    #[test]
    fn decimal_division_by_zero_maps_to_common_variant() {
        let err: RuntimeError = DecimalError::DivisionByZero.into();
        assert!(matches!(err, RuntimeError::DivisionByZero));
    }
}
