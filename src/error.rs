use std::fmt;

use crate::dsl::error::CompileError;
use crate::metadata::MetadataError;
use crate::model::DataError;
use crate::transform::TransformError;

/// Crate-level error for the CLI and file-based entry points.
#[derive(Debug)]
pub enum CtlError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Metadata(MetadataError),
    Compile(Vec<CompileError>),
    Transform(TransformError),
    Data(DataError),
    Usage(String),
}

impl fmt::Display for CtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtlError::Io(e) => write!(f, "I/O error: {e}"),
            CtlError::Json(e) => write!(f, "JSON error: {e}"),
            CtlError::Metadata(e) => write!(f, "{e}"),
            CtlError::Compile(errors) => {
                write!(f, "{} compile error(s)", errors.len())?;
                if let Some(first) = errors.first() {
                    write!(f, ", first: {first}")?;
                }
                Ok(())
            }
            CtlError::Transform(e) => write!(f, "{e}"),
            CtlError::Data(e) => write!(f, "Data error: {e}"),
            CtlError::Usage(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for CtlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CtlError::Io(e) => Some(e),
            CtlError::Json(e) => Some(e),
            CtlError::Metadata(e) => Some(e),
            CtlError::Transform(e) => Some(e),
            CtlError::Data(e) => Some(e),
            CtlError::Compile(_) | CtlError::Usage(_) => None,
        }
    }
}

impl From<std::io::Error> for CtlError {
    fn from(e: std::io::Error) -> Self {
        CtlError::Io(e)
    }
}

impl From<serde_json::Error> for CtlError {
    fn from(e: serde_json::Error) -> Self {
        CtlError::Json(e)
    }
}

impl From<MetadataError> for CtlError {
    fn from(e: MetadataError) -> Self {
        CtlError::Metadata(e)
    }
}

impl From<Vec<CompileError>> for CtlError {
    fn from(errors: Vec<CompileError>) -> Self {
        CtlError::Compile(errors)
    }
}

impl From<TransformError> for CtlError {
    fn from(e: TransformError) -> Self {
        match e {
            TransformError::Compile(errors) => CtlError::Compile(errors),
            TransformError::Data(e) => CtlError::Data(e),
            other => CtlError::Transform(other),
        }
    }
}

impl From<DataError> for CtlError {
    fn from(e: DataError) -> Self {
        CtlError::Data(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::ast::Span;
    use crate::model::RuntimeError;

    #[test]
    fn compile_errors_summarize() {
        let first = CompileError::type_error("Variable 'x' is not declared", Span::default());
        let err = CtlError::from(vec![first]);
        assert_eq!(err.to_string(), "1 compile error(s), first: Variable 'x' is not declared");
    }

    #[test]
    fn transform_errors_keep_their_chain() {
        let err =
            CtlError::from(TransformError::runtime("transform", RuntimeError::DivisionByZero));
        assert_eq!(err.to_string(), "error in function 'transform': division by zero");
        assert!(std::error::Error::source(&err).is_some());
    }
}
