//! Entry-point adapter: binds a compiled program's functions to the
//! lifecycle of Reformat, Denormalize and Normalize components.

pub mod adapter;
pub mod data;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use adapter::Transform;
pub use data::{DataErrorHandler, DataErrorPolicy};

use crate::dsl::ast::Span;
use crate::dsl::error::CompileError;
use crate::dsl::program::CompileEnv;
use crate::dsl::scope::SymbolTable;
use crate::dsl::{compile_source, ExecutionMode, TransformProgram};
use crate::model::{CtlType, DataError, RuntimeError};

/// Component family a program is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPointKind {
    Reformat,
    Denormalize,
    Normalize,
}

/// A function of the entry-point contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Init,
    PreExecute,
    PostExecute,
    Clean,
    Finished,
    Transform,
    TransformOnError,
    Append,
    AppendOnError,
    Count,
    CountOnError,
}

const COMMON_HOOKS: [(Hook, bool); 5] = [
    (Hook::Init, false),
    (Hook::PreExecute, false),
    (Hook::PostExecute, false),
    (Hook::Clean, false),
    (Hook::Finished, false),
];

impl EntryPointKind {
    /// Kind-specific hooks and whether each is mandatory.
    fn specific_hooks(self) -> &'static [(Hook, bool)] {
        match self {
            EntryPointKind::Reformat => &[(Hook::Transform, true), (Hook::TransformOnError, false)],
            EntryPointKind::Denormalize => &[
                (Hook::Append, true),
                (Hook::Transform, true),
                (Hook::AppendOnError, false),
                (Hook::TransformOnError, false),
            ],
            EntryPointKind::Normalize => &[
                (Hook::Count, true),
                (Hook::Transform, true),
                (Hook::CountOnError, false),
                (Hook::TransformOnError, false),
            ],
        }
    }

    pub fn hooks(self) -> impl Iterator<Item = (Hook, bool)> {
        COMMON_HOOKS.into_iter().chain(self.specific_hooks().iter().copied())
    }

    /// Problems binding `symbols` to this contract: missing mandatory
    /// functions and functions declared with the wrong return type.
    pub fn check(self, symbols: &SymbolTable) -> Vec<String> {
        let mut problems = Vec::new();
        for (hook, required) in self.hooks() {
            let params = hook.params(self);
            match symbols.find_function(hook.name(), &params) {
                Some(index) => {
                    let declared = symbols.functions.get(index).map(|f| &f.ret);
                    if declared != Some(&hook.ret()) {
                        problems.push(format!(
                            "Function '{}' must return {}",
                            hook.signature(self),
                            hook.ret()
                        ));
                    }
                }
                None if required => {
                    problems.push(format!(
                        "Required function '{}' is not declared",
                        hook.signature(self)
                    ));
                }
                None => {}
            }
        }
        problems
    }
}

impl fmt::Display for EntryPointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryPointKind::Reformat => "Reformat",
            EntryPointKind::Denormalize => "Denormalize",
            EntryPointKind::Normalize => "Normalize",
        })
    }
}

impl Hook {
    pub fn name(self) -> &'static str {
        match self {
            Hook::Init => "init",
            Hook::PreExecute => "preExecute",
            Hook::PostExecute => "postExecute",
            Hook::Clean => "clean",
            Hook::Finished => "finished",
            Hook::Transform => "transform",
            Hook::TransformOnError => "transformOnError",
            Hook::Append => "append",
            Hook::AppendOnError => "appendOnError",
            Hook::Count => "count",
            Hook::CountOnError => "countOnError",
        }
    }

    pub fn params(self, kind: EntryPointKind) -> Vec<CtlType> {
        let normalize = kind == EntryPointKind::Normalize;
        match self {
            Hook::Transform if normalize => vec![CtlType::Integer],
            Hook::TransformOnError if normalize => {
                vec![CtlType::String, CtlType::String, CtlType::Integer]
            }
            Hook::TransformOnError | Hook::AppendOnError | Hook::CountOnError => {
                vec![CtlType::String, CtlType::String]
            }
            _ => Vec::new(),
        }
    }

    pub fn ret(self) -> CtlType {
        match self {
            Hook::Init => CtlType::Boolean,
            Hook::PreExecute | Hook::PostExecute | Hook::Clean | Hook::Finished => CtlType::Void,
            _ => CtlType::Integer,
        }
    }

    /// Error variant a failure of this hook is redirected to.
    pub fn on_error(self) -> Option<Hook> {
        match self {
            Hook::Transform => Some(Hook::TransformOnError),
            Hook::Append => Some(Hook::AppendOnError),
            Hook::Count => Some(Hook::CountOnError),
            _ => None,
        }
    }

    pub fn signature(self, kind: EntryPointKind) -> String {
        let params =
            self.params(kind).iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        format!("{}({params})", self.name())
    }
}

/// Outcome of a record-level function, decoded from its integer result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransformStatus {
    /// Send the record to output port N.
    Ok(usize),
    /// Drop the record.
    Skip,
    /// Fail the record with the returned code.
    Error(i32),
}

impl TransformStatus {
    pub const SKIP: i32 = -1;

    pub fn from_code(code: i32) -> Self {
        match usize::try_from(code) {
            Ok(port) => TransformStatus::Ok(port),
            Err(_) if code == Self::SKIP => TransformStatus::Skip,
            Err(_) => TransformStatus::Error(code),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{0}")]
    Configuration(String),
    #[error("compilation failed with {} error(s)", .0.len())]
    Compile(Vec<CompileError>),
    #[error("error in function '{function}': {source}")]
    Runtime {
        function: String,
        #[source]
        source: RuntimeError,
    },
    #[error(transparent)]
    Data(#[from] DataError),
}

impl TransformError {
    pub(crate) fn runtime(function: impl Into<String>, source: RuntimeError) -> Self {
        TransformError::Runtime { function: function.into(), source }
    }
}

// ── Compiler façade ─────────────────────────────────────────────────

/// Compiles CTL sources for one entry-point kind and holds the result.
#[derive(Debug)]
pub struct TransformCompiler {
    env: CompileEnv,
    default_mode: ExecutionMode,
    program: Option<Box<dyn TransformProgram>>,
}

impl TransformCompiler {
    pub fn new(env: CompileEnv) -> Self {
        Self {
            env,
            default_mode: ExecutionMode::default(),
            program: None,
        }
    }

    /// Back-end used when the source has no pragma.
    pub fn with_default_mode(mut self, mode: ExecutionMode) -> Self {
        self.default_mode = mode;
        self
    }

    /// Compile `source`, replacing any previously held program. Returns
    /// every diagnostic; an empty list means `program()` is available.
    pub fn compile(
        &mut self,
        source: &str,
        kind: EntryPointKind,
        identifier: &str,
    ) -> Vec<CompileError> {
        self.program = None;
        let program = match compile_source(source, &self.env, self.default_mode) {
            Ok(program) => program,
            Err(errors) => {
                log::debug!("'{identifier}' failed to compile with {} error(s)", errors.len());
                return errors;
            }
        };
        let errors: Vec<CompileError> = kind
            .check(program.symbols())
            .into_iter()
            .map(|message| CompileError::type_error(message, Span::default()))
            .collect();
        if errors.is_empty() {
            log::debug!(
                "compiled '{identifier}' as {kind} ({} mode, {} function(s))",
                program.mode(),
                program.symbols().functions.len()
            );
            self.program = Some(program);
        }
        errors
    }

    pub fn program(&self) -> Option<&dyn TransformProgram> {
        self.program.as_deref()
    }

    pub fn take_program(&mut self) -> Option<Box<dyn TransformProgram>> {
        self.program.take()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(TransformStatus::from_code(0), TransformStatus::Ok(0));
        assert_eq!(TransformStatus::from_code(3), TransformStatus::Ok(3));
        assert_eq!(TransformStatus::from_code(-1), TransformStatus::Skip);
        assert_eq!(TransformStatus::from_code(-2), TransformStatus::Error(-2));
    }

    #[test]
    fn missing_mandatory_function_is_named() {
        let mut compiler = TransformCompiler::new(CompileEnv::new());
        let errors = compiler.compile("integer x = 1;", EntryPointKind::Reformat, "t.ctl");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Required function 'transform()' is not declared");
        assert!(compiler.program().is_none());
    }

    #[test]
    fn normalize_needs_count_and_indexed_transform() {
        let mut compiler = TransformCompiler::new(CompileEnv::new());
        let src = "function integer transform() { return 0; }";
        let errors = compiler.compile(src, EntryPointKind::Normalize, "n");
        let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
        assert!(messages.contains(&"Required function 'count()' is not declared"));
        assert!(messages.contains(&"Required function 'transform(integer)' is not declared"));
    }

    #[test]
    fn wrong_return_type_is_reported() {
        let mut compiler = TransformCompiler::new(CompileEnv::new());
        let errors =
            compiler.compile("function void transform() { }", EntryPointKind::Reformat, "t");
        assert_eq!(errors[0].message, "Function 'transform()' must return integer");
    }

    #[test]
    fn successful_compile_holds_the_program() {
        let mut compiler =
            TransformCompiler::new(CompileEnv::new()).with_default_mode(ExecutionMode::Compile);
        let src = "function integer transform() { return 0; }";
        let errors = compiler.compile(src, EntryPointKind::Reformat, "t");
        assert!(errors.is_empty());
        assert_eq!(compiler.program().unwrap().mode(), ExecutionMode::Compile);
        assert!(compiler.take_program().is_some());
        assert!(compiler.program().is_none());
    }
}
