//! CTL: an embedded transformation language with a tree-walking
//! interpreter and a bytecode compiler sharing one value model.

pub mod dsl;
pub mod error;
pub mod metadata;
pub mod model;
pub mod resources;
pub mod settings;
pub mod transform;

pub use dsl::context::ExecutionContext;
pub use dsl::program::CompileEnv;
pub use dsl::{compile_source, ExecutionMode, TransformProgram};
pub use error::CtlError;
pub use transform::{EntryPointKind, Transform, TransformCompiler, TransformError, TransformStatus};
