#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod ast;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod error;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod lexer;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod parser;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod builtins;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod scope;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod program;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod typeck;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod context;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod interpreter;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod optimize;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod compiler;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod vm;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use ast::{Ast, NodeId, NodeKind, Span};
use context::ExecutionContext;
use error::CompileError;
use interpreter::Interpreter;
use program::{CompileEnv, Program};
use scope::SymbolTable;
use vm::Vm;

use crate::model::{CtlType, RecordRef, RuntimeError, Value};

/// Back-end that runs a program.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Walk the resolved AST.
    #[default]
    Interpret,
    /// Lower to bytecode and run on the stack VM.
    Compile,
}

const PRAGMA: &str = "//#CTL2";

impl ExecutionMode {
    /// Mode requested by a `//#CTL2[:MODE]` pragma on the first non-blank
    /// line, or `None` when the source carries no pragma.
    pub fn from_pragma(source: &str) -> Option<ExecutionMode> {
        let first = source.lines().map(str::trim).find(|line| !line.is_empty())?;
        let suffix = first.strip_prefix(PRAGMA)?.trim();
        if suffix.eq_ignore_ascii_case(":COMPILE") {
            Some(ExecutionMode::Compile)
        } else {
            if !suffix.is_empty() && !suffix.eq_ignore_ascii_case(":INTERPRET") {
                log::warn!("unknown CTL pragma '{first}', using the interpreter");
            }
            Some(ExecutionMode::Interpret)
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Interpret => "interpret",
            ExecutionMode::Compile => "compile",
        })
    }
}

/// A compiled CTL program, independent of the back-end that runs it.
///
/// The caller owns the `ExecutionContext`; one context belongs to one
/// program instance at a time.
pub trait TransformProgram: fmt::Debug {
    fn symbols(&self) -> &SymbolTable;

    fn mode(&self) -> ExecutionMode;

    /// Run the global code once, initializing global variables.
    fn run_global(&self, ctx: &mut ExecutionContext) -> Result<(), RuntimeError>;

    /// Call function `function` (an index into `symbols().functions`) with
    /// `args`, binding `$in.N` / `$out.N` to `inputs` / `outputs`.
    fn execute_function(
        &self,
        ctx: &mut ExecutionContext,
        function: usize,
        args: Vec<Value>,
        inputs: &[RecordRef],
        outputs: &[RecordRef],
    ) -> Result<Value, RuntimeError>;

    fn find_function(&self, name: &str, params: &[CtlType]) -> Option<usize> {
        self.symbols().find_function(name, params)
    }

    /// Current value of the top-level global `name`.
    fn get_variable_value(&self, ctx: &ExecutionContext, name: &str) -> Option<Value> {
        let slot = self.symbols().global_slot(name)?;
        ctx.global(slot).cloned()
    }

    /// Bytecode listing, for back-ends that have one.
    fn listing(&self) -> Option<String> {
        None
    }
}

// ── Pipeline ──────────────────────────────────────────────────────

/// Parse, splice imports, resolve and fold `source` into a `Program` for
/// `mode`. Shared by both back-ends.
pub fn check_source(
    source: &str,
    env: &CompileEnv,
    mode: ExecutionMode,
) -> Result<Program, Vec<CompileError>> {
    let tokens = lexer::lex(source)?;
    let mut ast = parser::parse(tokens)?;
    resolve_imports(&mut ast, env)?;
    let resolved = typeck::resolve(&mut ast, env)?;
    let folded = optimize::fold_constants(&mut ast);
    log::debug!(
        "resolved {} function(s) and {} global(s), folded {folded} constant expression(s)",
        resolved.symbols.functions.len(),
        resolved.symbols.globals.len()
    );
    Ok(Program::new(ast, resolved, env, mode))
}

/// Hand a checked program to the back-end its mode names.
pub fn build_program(program: Program) -> Result<Box<dyn TransformProgram>, Vec<CompileError>> {
    Ok(match program.mode {
        ExecutionMode::Interpret => Box::new(Interpreter::new(program)),
        ExecutionMode::Compile => {
            let mut unit = compiler::compile(&program).map_err(|e| vec![e])?;
            optimize::peephole(&mut unit);
            Box::new(Vm::new(unit))
        }
    })
}

/// Compile a CTL source string into a runnable program.
///
/// source → lex → parse → imports → resolve → fold → back-end. The pragma
/// wins over `default_mode`.
pub fn compile_source(
    source: &str,
    env: &CompileEnv,
    default_mode: ExecutionMode,
) -> Result<Box<dyn TransformProgram>, Vec<CompileError>> {
    let mode = ExecutionMode::from_pragma(source).unwrap_or(default_mode);
    build_program(check_source(source, env, mode)?)
}

// ── Imports ───────────────────────────────────────────────────────

/// Splice every `import "file";` under its `Import` node, recursively.
/// Each unit is loaded once; a unit importing one of its importers is an
/// error.
fn resolve_imports(ast: &mut Ast, env: &CompileEnv) -> Result<(), Vec<CompileError>> {
    let Some(root) = ast.root() else {
        return Ok(());
    };
    let mut loader = ImportLoader {
        env,
        active: Vec::new(),
        loaded: HashSet::new(),
        errors: Vec::new(),
    };
    loader.expand(ast, root, None);
    if loader.errors.is_empty() {
        Ok(())
    } else {
        Err(loader.errors)
    }
}

struct ImportLoader<'e> {
    env: &'e CompileEnv,
    /// Units currently being expanded, outermost first.
    active: Vec<String>,
    loaded: HashSet<String>,
    errors: Vec<CompileError>,
}

impl ImportLoader<'_> {
    fn expand(&mut self, ast: &mut Ast, container: NodeId, from: Option<&str>) {
        let imports: Vec<(NodeId, String, Span)> = ast
            .children(container)
            .iter()
            .filter_map(|c| match ast.kind(*c) {
                NodeKind::Import { path } => Some((*c, path.clone(), ast.span(*c))),
                _ => None,
            })
            .collect();

        for (node, path, span) in imports {
            let Some(resolver) = self.env.import_resolver() else {
                let message = format!("Cannot import '{path}': no import resolver");
                self.errors.push(CompileError::parser(message, span));
                continue;
            };
            let (unit, source) = match resolver.resolve(from, &path) {
                Ok(found) => found,
                Err(e) => {
                    let message = format!("Cannot import '{path}': {e}");
                    self.errors.push(CompileError::parser(message, span));
                    continue;
                }
            };
            if self.active.contains(&unit) {
                self.errors.push(CompileError::parser(format!("Cyclic import of '{path}'"), span));
                continue;
            }
            if !self.loaded.insert(unit.clone()) {
                log::debug!("'{unit}' is already imported");
                continue;
            }
            log::debug!("importing '{unit}'");
            let parsed =
                lexer::lex(&source).and_then(|tokens| parser::parse_into(tokens, ast, node));
            if let Err(errors) = parsed {
                self.errors.extend(
                    errors
                        .into_iter()
                        .map(|e| CompileError { message: format!("{unit}: {}", e.message), ..e }),
                );
                continue;
            }
            self.active.push(unit.clone());
            self.expand(ast, node, Some(&unit));
            self.active.pop();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::collections::HashMap;
    use std::io;

    use super::program::ImportResolver;
    use super::*;

    struct MemoryImports(HashMap<&'static str, &'static str>);

    impl ImportResolver for MemoryImports {
        fn resolve(&self, _from: Option<&str>, path: &str) -> io::Result<(String, String)> {
            self.0
                .get(path)
                .map(|src| (path.to_string(), (*src).to_string()))
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not found"))
        }
    }

    fn env(files: &[(&'static str, &'static str)]) -> CompileEnv {
        CompileEnv::new().with_import_resolver(MemoryImports(files.iter().copied().collect()))
    }

    #[test]
    fn pragma_selects_the_back_end() {
        assert_eq!(
            ExecutionMode::from_pragma("//#CTL2:COMPILE\ninteger x;"),
            Some(ExecutionMode::Compile)
        );
        assert_eq!(ExecutionMode::from_pragma("\n  //#CTL2\n"), Some(ExecutionMode::Interpret));
        assert_eq!(ExecutionMode::from_pragma("//#CTL2:INTERPRET"), Some(ExecutionMode::Interpret));
        assert_eq!(ExecutionMode::from_pragma("integer x;"), None);
    }

    #[test]
    fn compile_source_honors_pragma_over_default() {
        let env = CompileEnv::new();
        let src = "//#CTL2:COMPILE\ninteger x = 1;";
        let program = compile_source(src, &env, ExecutionMode::Interpret).unwrap();
        assert_eq!(program.mode(), ExecutionMode::Compile);
        assert!(program.listing().is_some());
        let program = compile_source("integer x = 1;", &env, ExecutionMode::Interpret).unwrap();
        assert_eq!(program.mode(), ExecutionMode::Interpret);
    }

    #[test]
    fn imported_functions_are_callable() {
        let env = env(&[("lib.ctl", "function integer twice(integer a) { return a * 2; }")]);
        let src = "import \"lib.ctl\"; integer r = twice(21);";
        let program = compile_source(src, &env, ExecutionMode::Interpret).unwrap();
        let mut ctx = ExecutionContext::new();
        program.run_global(&mut ctx).unwrap();
        assert!(matches!(program.get_variable_value(&ctx, "r"), Some(Value::Integer(42))));
    }

    #[test]
    fn diamond_imports_load_once() {
        let env = env(&[
            ("a.ctl", "import \"c.ctl\";"),
            ("b.ctl", "import \"c.ctl\";"),
            ("c.ctl", "function integer one() { return 1; }"),
        ]);
        let src = "import \"a.ctl\"; import \"b.ctl\";";
        assert!(compile_source(src, &env, ExecutionMode::Interpret).is_ok());
    }

    #[test]
    fn cyclic_and_missing_imports_are_reported() {
        let env = env(&[("a.ctl", "import \"b.ctl\";"), ("b.ctl", "import \"a.ctl\";")]);
        let errors =
            compile_source("import \"a.ctl\";", &env, ExecutionMode::Interpret).unwrap_err();
        assert!(errors[0].message.contains("Cyclic import of 'a.ctl'"));

        let errors =
            compile_source("import \"nope.ctl\";", &env, ExecutionMode::Interpret).unwrap_err();
        assert!(errors[0].message.starts_with("Cannot import 'nope.ctl'"));
    }
}
