use std::collections::HashMap;
use std::fmt;

use super::ast::{NodeId, Resolution};
use crate::model::CtlType;

/// Signature of a user-declared function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub params: Vec<CtlType>,
    pub ret: CtlType,
    /// The `FunctionDeclaration` node.
    pub node: NodeId,
    /// Frame size: parameters first, then every local declared in the body.
    pub local_count: u16,
}

impl FunctionInfo {
    pub fn matches(&self, name: &str, params: &[CtlType]) -> bool {
        self.name == name && self.params == params
    }
}

impl fmt::Display for FunctionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.ret, self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ")")
    }
}

/// Storage slot of a global variable.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSlot {
    pub name: String,
    pub ty: CtlType,
    /// Declared directly at the top level rather than inside a nested block
    /// of the global code.
    pub top_level: bool,
}

/// Everything a back-end needs to know about a program's symbols.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub functions: Vec<FunctionInfo>,
    pub globals: Vec<GlobalSlot>,
}

impl SymbolTable {
    pub fn find_function(&self, name: &str, params: &[CtlType]) -> Option<usize> {
        self.functions.iter().position(|f| f.matches(name, params))
    }

    pub fn functions_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = (usize, &'a FunctionInfo)> {
        self.functions.iter().enumerate().filter(move |(_, f)| f.name == name)
    }

    /// Slot of the top-level global `name`.
    pub fn global_slot(&self, name: &str) -> Option<usize> {
        self.globals.iter().position(|g| g.top_level && g.name == name)
    }
}

// ── Overload resolution ───────────────────────────────────────────

/// Outcome of picking among overloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadMatch<T> {
    Unique(T),
    Ambiguous,
    NotFound,
}

/// Pick the candidate with the unique minimum total conversion distance.
///
/// Candidates scored `None` cannot accept the arguments at all. User
/// functions and builtins go through this same routine.
pub fn best_overload<T: Copy>(
    candidates: impl IntoIterator<Item = (T, Option<u32>)>,
) -> OverloadMatch<T> {
    let mut best: Option<(T, u32)> = None;
    let mut tied = false;
    for (candidate, score) in candidates {
        let Some(score) = score else { continue };
        match best {
            Some((_, current)) if score > current => {}
            Some((_, current)) if score == current => tied = true,
            _ => {
                best = Some((candidate, score));
                tied = false;
            }
        }
    }
    match best {
        Some(_) if tied => OverloadMatch::Ambiguous,
        Some((candidate, _)) => OverloadMatch::Unique(candidate),
        None => OverloadMatch::NotFound,
    }
}

/// Summed distance of `args` against a user function's parameter list.
pub fn signature_distance(params: &[CtlType], args: &[CtlType]) -> Option<u32> {
    if params.len() != args.len() {
        return None;
    }
    params
        .iter()
        .zip(args)
        .map(|(p, a)| crate::model::types::distance(a, p))
        .sum()
}

pub fn format_arg_types(args: &[CtlType]) -> String {
    args.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

// ── Lexical scopes ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Symbol {
    pub ty: CtlType,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    Global,
    Local,
}

/// Chain of scopes: the global frame at the bottom, then nested block
/// frames. Variables declared outside any function live in global slots;
/// inside a function they get frame slots that are never reused.
#[derive(Debug)]
pub struct ScopeStack {
    frames: Vec<(Storage, HashMap<String, Symbol>)>,
    next_local: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    AlreadyDefined,
    TooManyLocals,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        Self {
            frames: vec![(Storage::Global, HashMap::new())],
            next_local: 0,
        }
    }

    /// Open a nested block scope with the same storage as its parent.
    pub fn push(&mut self) {
        let storage = self.frames.last().map_or(Storage::Global, |(s, _)| *s);
        self.frames.push((storage, HashMap::new()));
    }

    /// Open the outermost scope of a function body.
    pub fn push_function(&mut self) {
        self.next_local = 0;
        self.frames.push((Storage::Local, HashMap::new()));
    }

    pub fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn in_function(&self) -> bool {
        self.frames.last().is_some_and(|(s, _)| *s == Storage::Local)
    }

    /// Frame slots allocated since the last `push_function`.
    pub fn local_count(&self) -> u16 {
        self.next_local
    }

    /// Declare `name` in the innermost scope.
    ///
    /// `globals` receives a new slot when the scope is global storage.
    pub fn declare(
        &mut self,
        name: &str,
        ty: CtlType,
        globals: &mut Vec<GlobalSlot>,
    ) -> Result<Resolution, ScopeError> {
        let top_level = self.frames.len() == 1;
        let Some((storage, frame)) = self.frames.last_mut() else {
            return Err(ScopeError::AlreadyDefined);
        };
        if frame.contains_key(name) {
            return Err(ScopeError::AlreadyDefined);
        }
        let resolution = match storage {
            Storage::Global => {
                let slot = u16::try_from(globals.len()).map_err(|_| ScopeError::TooManyLocals)?;
                globals.push(GlobalSlot {
                    name: name.to_string(),
                    ty: ty.clone(),
                    top_level,
                });
                Resolution::Global(slot)
            }
            Storage::Local => {
                let slot = self.next_local;
                self.next_local = slot.checked_add(1).ok_or(ScopeError::TooManyLocals)?;
                Resolution::Local(slot)
            }
        };
        frame.insert(name.to_string(), Symbol { ty, resolution });
        Ok(resolution)
    }

    /// Innermost visible symbol called `name`.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.frames.iter().rev().find_map(|(_, frame)| frame.get(name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unique_minimum_wins() {
        let picked = best_overload([(0, Some(3)), (1, Some(1)), (2, None)]);
        assert_eq!(picked, OverloadMatch::Unique(1));
    }

    #[test]
    fn ties_are_ambiguous() {
        assert_eq!(best_overload([(0, Some(2)), (1, Some(2))]), OverloadMatch::Ambiguous);
        let best = best_overload([(0, Some(2)), (1, Some(2)), (2, Some(0))]);
        assert_eq!(best, OverloadMatch::Unique(2));
        assert_eq!(best_overload::<usize>([(0, None)]), OverloadMatch::NotFound);
    }

    #[test]
    fn signature_distance_sums_promotions() {
        let params = [CtlType::Long, CtlType::Decimal];
        assert_eq!(signature_distance(&params, &[CtlType::Integer, CtlType::Number]), Some(2));
        assert_eq!(signature_distance(&params, &[CtlType::String, CtlType::Number]), None);
        assert_eq!(signature_distance(&params, &[CtlType::Long]), None);
    }

    #[test]
    fn shadowing_and_redeclaration() {
        let mut globals = Vec::new();
        let mut scopes = ScopeStack::new();
        scopes.declare("x", CtlType::Integer, &mut globals).unwrap();
        let again = scopes.declare("x", CtlType::Long, &mut globals);
        assert_eq!(again, Err(ScopeError::AlreadyDefined));
        scopes.push_function();
        let inner = scopes.declare("x", CtlType::String, &mut globals).unwrap();
        assert_eq!(inner, Resolution::Local(0));
        assert_eq!(scopes.lookup("x").unwrap().ty, CtlType::String);
        scopes.pop();
        assert_eq!(scopes.lookup("x").unwrap().resolution, Resolution::Global(0));
        assert_eq!(globals.len(), 1);
    }

    #[test]
    fn nested_global_blocks_are_not_top_level() {
        let mut globals = Vec::new();
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.declare("i", CtlType::Integer, &mut globals).unwrap();
        scopes.pop();
        let table = SymbolTable {
            functions: Vec::new(),
            globals,
        };
        assert_eq!(table.global_slot("i"), None);
    }

    #[test]
    fn signature_display() {
        let f = FunctionInfo {
            name: "sum".into(),
            params: vec![CtlType::Integer, CtlType::Integer],
            ret: CtlType::Integer,
            node: NodeId::new(0),
            local_count: 2,
        };
        assert_eq!(f.to_string(), "integer sum(integer, integer)");
    }
}
