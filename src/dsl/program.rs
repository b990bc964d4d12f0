use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::ast::{Ast, NodeId};
use super::scope::SymbolTable;
use super::ExecutionMode;
use crate::model::{CtlType, RecordMetadata};

/// Loads the source of `import "file";` statements.
pub trait ImportResolver {
    /// Canonical identity and source text of `path`, imported from the unit
    /// identified by `from` (or from the main program when `None`).
    fn resolve(&self, from: Option<&str>, path: &str) -> io::Result<(String, String)>;
}

/// Resolves imports against the file system, relative to the importing
/// file's directory (or `base` for the main program).
#[derive(Debug, Clone)]
pub struct FileImportResolver {
    base: PathBuf,
}

impl FileImportResolver {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl ImportResolver for FileImportResolver {
    fn resolve(&self, from: Option<&str>, path: &str) -> io::Result<(String, String)> {
        let dir = from
            .map(Path::new)
            .and_then(Path::parent)
            .map_or_else(|| self.base.clone(), Path::to_path_buf);
        let full = dir.join(path);
        let canonical = full.canonicalize().unwrap_or(full);
        let source = std::fs::read_to_string(&canonical)?;
        Ok((canonical.display().to_string(), source))
    }
}

/// Compile-time view of a lookup table: the record it returns and the
/// types of its key fields.
#[derive(Debug, Clone)]
pub struct LookupSignature {
    pub metadata: Arc<RecordMetadata>,
    pub key_types: Vec<CtlType>,
}

/// Everything the resolver needs to know about the host: bound record
/// ports, record types usable in declarations, lookup tables and imports.
#[derive(Default)]
pub struct CompileEnv {
    pub inputs: Vec<Arc<RecordMetadata>>,
    pub outputs: Vec<Arc<RecordMetadata>>,
    record_types: HashMap<String, Arc<RecordMetadata>>,
    lookups: HashMap<String, LookupSignature>,
    imports: Option<Box<dyn ImportResolver>>,
}

impl fmt::Debug for CompileEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileEnv")
            .field("inputs", &self.inputs.iter().map(|m| m.name()).collect::<Vec<_>>())
            .field("outputs", &self.outputs.iter().map(|m| m.name()).collect::<Vec<_>>())
            .field("record_types", &self.record_types.keys().collect::<Vec<_>>())
            .field("lookups", &self.lookups.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl CompileEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, metadata: Arc<RecordMetadata>) -> Self {
        self.record_types.insert(metadata.name().to_string(), metadata.clone());
        self.inputs.push(metadata);
        self
    }

    pub fn with_output(mut self, metadata: Arc<RecordMetadata>) -> Self {
        self.record_types.insert(metadata.name().to_string(), metadata.clone());
        self.outputs.push(metadata);
        self
    }

    pub fn with_record_type(mut self, metadata: Arc<RecordMetadata>) -> Self {
        self.record_types.insert(metadata.name().to_string(), metadata);
        self
    }

    /// Declare lookup `name` returning `metadata` records keyed by the
    /// fields at `key_fields`.
    pub fn with_lookup(
        mut self,
        name: impl Into<String>,
        metadata: Arc<RecordMetadata>,
        key_fields: &[usize],
    ) -> Self {
        let key_types = key_fields
            .iter()
            .filter_map(|i| metadata.field(*i).map(|f| f.ty.clone()))
            .collect();
        self.record_types.insert(metadata.name().to_string(), metadata.clone());
        self.lookups.insert(name.into(), LookupSignature { metadata, key_types });
        self
    }

    pub fn with_import_resolver(mut self, resolver: impl ImportResolver + 'static) -> Self {
        self.imports = Some(Box::new(resolver));
        self
    }

    pub fn record_type(&self, name: &str) -> Option<&Arc<RecordMetadata>> {
        self.record_types.get(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&LookupSignature> {
        self.lookups.get(name)
    }

    pub fn import_resolver(&self) -> Option<&dyn ImportResolver> {
        self.imports.as_deref()
    }
}

/// A sequence referenced by the program with the result type requested.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRef {
    pub name: String,
    pub ty: CtlType,
}

/// Output of semantic analysis.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub symbols: SymbolTable,
    /// Top-level statements in source order, imports flattened.
    pub global_code: Vec<NodeId>,
    pub sequences: Vec<SequenceRef>,
    pub lookups: Vec<String>,
}

/// A checked program ready for either back-end.
#[derive(Debug, Clone)]
pub struct Program {
    pub ast: Ast,
    pub symbols: SymbolTable,
    pub global_code: Vec<NodeId>,
    pub sequences: Vec<SequenceRef>,
    pub lookups: Vec<String>,
    pub inputs: Vec<Arc<RecordMetadata>>,
    pub outputs: Vec<Arc<RecordMetadata>>,
    pub mode: ExecutionMode,
}

impl Program {
    pub fn new(ast: Ast, resolved: Resolved, env: &CompileEnv, mode: ExecutionMode) -> Self {
        Self {
            ast,
            symbols: resolved.symbols,
            global_code: resolved.global_code,
            sequences: resolved.sequences,
            lookups: resolved.lookups,
            inputs: env.inputs.clone(),
            outputs: env.outputs.clone(),
            mode,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::FieldMetadata;

    #[test]
    fn ports_register_their_record_types() {
        let fields = vec![FieldMetadata::new("id", CtlType::Integer)];
        let meta = Arc::new(RecordMetadata::new("person", fields));
        let env = CompileEnv::new().with_input(meta.clone());
        assert!(env.record_type("person").is_some());
        assert_eq!(env.inputs.len(), 1);
    }

    #[test]
    fn lookup_keys_take_field_types() {
        let meta = Arc::new(RecordMetadata::new(
            "rate",
            vec![
                FieldMetadata::new("code", CtlType::String),
                FieldMetadata::new("value", CtlType::Decimal),
            ],
        ));
        let env = CompileEnv::new().with_lookup("rates", meta, &[0]);
        assert_eq!(env.lookup("rates").unwrap().key_types, vec![CtlType::String]);
    }

    #[test]
    fn file_imports_are_relative_to_the_importer() {
        let dir = std::env::temp_dir().join(format!("ctl-import-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        std::fs::write(dir.join("lib").join("a.ctl"), "integer a = 1;").unwrap();
        let resolver = FileImportResolver::new(&dir);
        let (id, source) = resolver.resolve(None, "lib/a.ctl").unwrap();
        assert_eq!(source, "integer a = 1;");
        std::fs::write(dir.join("lib").join("b.ctl"), "integer b = 2;").unwrap();
        let (_, nested) = resolver.resolve(Some(&id), "b.ctl").unwrap();
        assert_eq!(nested, "integer b = 2;");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
