use std::fmt;

use super::ast::*;
use super::error::CompileError;
use super::program::{Program, SequenceRef};
use super::scope::SymbolTable;
use crate::model::{ArithOp, CompareOp, CtlType, OpKind};

/// A program lowered to bytecode: one chunk for global code plus one per
/// declared function, sharing constant, type and switch-table pools.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub global: CompiledFunction,
    /// Indexed like `SymbolTable::functions`.
    pub functions: Vec<CompiledFunction>,
    pub constants: Vec<Literal>,
    /// Types referenced by conversion and construction ops.
    pub types: Vec<CtlType>,
    pub switches: Vec<SwitchTable>,
    pub symbols: SymbolTable,
    pub sequences: Vec<SequenceRef>,
    pub lookups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub name: String,
    pub params: Vec<CtlType>,
    pub ret: CtlType,
    pub local_count: u16,
    pub ops: Vec<Op>,
}

/// Jump table of one `switch`. Targets are op offsets within the chunk.
#[derive(Debug, Clone, Default)]
pub struct SwitchTable {
    pub kind: Option<OpKind>,
    /// (constant index, target) in source order.
    pub cases: Vec<(u16, u16)>,
    pub default: Option<u16>,
    pub end: u16,
}

/// Assignable location an in-place op works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Local(u16),
    Global(u16),
    /// Record popped from the stack.
    Field(u16),
    /// Index and container popped from the stack.
    Element,
}

/// Bytecode operations for the stack-based VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Push a constant from the constant pool.
    PushConst(u16),
    PushNull,
    PushBool(bool),
    /// Push the declaration default of `types[n]`.
    PushDefault(u16),
    Pop,
    Dup,

    LoadLocal(u16),
    /// Pop into a local slot without conversion.
    StoreLocal(u16),
    LoadGlobal(u16),
    StoreGlobal(u16),

    // Records
    LoadInput(u16),
    LoadOutput(u16),
    /// Pop record → push field value.
    GetField(u16),
    /// Pop value, pop record → store, push the value.
    SetField(u16),
    /// Pop source, pop target → copy fields by name, push target.
    CopyRecord,

    // Containers
    /// Pop index, pop container → push element.
    GetIndex,
    /// Pop value, pop index, pop container → store, push the value.
    SetIndex,
    /// Pop `count` values → push a list of `types[ty]`.
    NewList { count: u16, ty: u16 },
    /// Pop `pairs` key/value pairs → push a map of `types[ty]`.
    NewMap { pairs: u16, ty: u16 },

    // Operators
    Arith(ArithOp, OpKind),
    Compare(CompareOp, OpKind),
    Neg(OpKind),
    Not,
    /// `++`/`--` on a slot; pushes the new value when `prefix`, else the old.
    Step { slot: Slot, delta: i8, prefix: bool },

    // Conversion
    /// Widen the top of stack to `types[n]`.
    Convert(u16),
    /// Widen to `types[n]` and copy lists and maps, as stores require.
    Prepare(u16),

    // Control flow
    Jump(u16),
    /// Pop a boolean; jump if false.
    JumpIfFalse(u16),
    /// Pop a boolean; jump if true.
    JumpIfTrue(u16),
    /// Pop the scrutinee and jump through `switches[n]`.
    Switch(u16),
    /// Pop a collection and start iterating a snapshot converted to `types[n]`.
    IterInit(u16),
    /// Push the next item, or drop the iterator and jump when exhausted.
    IterNext(u16),
    /// Drop the innermost iterator.
    IterEnd,

    // Calls and resources
    Call { function: u16, argc: u8 },
    CallBuiltin { builtin: u16, argc: u8 },
    Sequence(u16, SequenceOp),
    Lookup { lookup: u16, op: LookupOp, argc: u8 },
    /// Pop the return value and leave the chunk.
    Return,
}

impl fmt::Display for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_chunk(f, "<global>", &self.global)?;
        for function in &self.functions {
            writeln!(f)?;
            let params =
                function.params.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
            let header = format!("{} {}({})", function.ret, function.name, params);
            self.write_chunk(f, &header, function)?;
        }
        Ok(())
    }
}

impl CompiledUnit {
    fn write_chunk(
        &self,
        f: &mut fmt::Formatter<'_>,
        header: &str,
        chunk: &CompiledFunction,
    ) -> fmt::Result {
        writeln!(f, "{header}  ; locals={}", chunk.local_count)?;
        for (offset, op) in chunk.ops.iter().enumerate() {
            write!(f, "  {offset:04}  {op:?}")?;
            match op {
                Op::PushConst(i) => {
                    if let Some(lit) = self.constants.get(usize::from(*i)) {
                        write!(f, "  ; {}", lit.to_value())?;
                    }
                }
                Op::Convert(t) | Op::Prepare(t) | Op::PushDefault(t) | Op::IterInit(t) => {
                    if let Some(ty) = self.types.get(usize::from(*t)) {
                        write!(f, "  ; {ty}")?;
                    }
                }
                Op::Call { function, .. } => {
                    if let Some(callee) = self.functions.get(usize::from(*function)) {
                        write!(f, "  ; {}", callee.name)?;
                    }
                }
                Op::CallBuiltin { builtin, .. } => {
                    if let Some(b) = super::builtins::BUILTINS.get(usize::from(*builtin)) {
                        write!(f, "  ; {}", b.name)?;
                    }
                }
                _ => {}
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ── Lowering ──────────────────────────────────────────────────────

pub fn compile(program: &Program) -> Result<CompiledUnit, CompileError> {
    let mut compiler = Compiler::new(program);

    for stmt in &program.global_code {
        compiler.stmt(*stmt)?;
    }
    compiler.emit(Op::PushNull)?;
    compiler.emit(Op::Return)?;
    let global = CompiledFunction {
        name: "<global>".to_string(),
        params: Vec::new(),
        ret: CtlType::Void,
        local_count: 0,
        ops: std::mem::take(&mut compiler.ops),
    };

    let mut functions = Vec::with_capacity(program.symbols.functions.len());
    for info in &program.symbols.functions {
        if let Some(body) = program.ast.child(info.node, 1) {
            compiler.stmt(body)?;
        }
        compiler.emit(Op::PushNull)?;
        compiler.emit(Op::Return)?;
        functions.push(CompiledFunction {
            name: info.name.clone(),
            params: info.params.clone(),
            ret: info.ret.clone(),
            local_count: info.local_count,
            ops: std::mem::take(&mut compiler.ops),
        });
    }

    log::debug!(
        "compiled {} function(s), {} constant(s), {} op(s) of global code",
        functions.len(),
        compiler.constants.len(),
        global.ops.len()
    );

    Ok(CompiledUnit {
        global,
        functions,
        constants: compiler.constants,
        types: compiler.types,
        switches: compiler.switches,
        symbols: program.symbols.clone(),
        sequences: program.sequences.clone(),
        lookups: program.lookups.clone(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Loop,
    Switch,
}

/// Pending jumps of an enclosing loop or switch.
struct JumpScope {
    kind: ScopeKind,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

struct Compiler<'p> {
    program: &'p Program,
    ops: Vec<Op>,
    constants: Vec<Literal>,
    types: Vec<CtlType>,
    switches: Vec<SwitchTable>,
    scopes: Vec<JumpScope>,
    /// Span of the node being lowered, for diagnostics.
    span: Span,
}

impl<'p> Compiler<'p> {
    fn new(program: &'p Program) -> Self {
        Self {
            program,
            ops: Vec::new(),
            constants: Vec::new(),
            types: Vec::new(),
            switches: Vec::new(),
            scopes: Vec::new(),
            span: Span::default(),
        }
    }

    fn ast(&self) -> &'p Ast {
        &self.program.ast
    }

    fn error(&self, message: &str) -> CompileError {
        CompileError::compiler(message, self.span)
    }

    fn emit(&mut self, op: Op) -> Result<usize, CompileError> {
        if self.ops.len() >= usize::from(u16::MAX) {
            return Err(self.error("Bytecode too large (max 65535 ops)"));
        }
        self.ops.push(op);
        Ok(self.ops.len() - 1)
    }

    fn here(&self) -> Result<u16, CompileError> {
        u16::try_from(self.ops.len()).map_err(|_| self.error("Bytecode too large (max 65535 ops)"))
    }

    fn patch_jump(&mut self, idx: usize, target: u16) {
        match &mut self.ops[idx] {
            Op::Jump(dest) | Op::JumpIfFalse(dest) | Op::JumpIfTrue(dest) | Op::IterNext(dest) => {
                *dest = target;
            }
            _ => {}
        }
    }

    fn patch_here(&mut self, idx: usize) -> Result<(), CompileError> {
        let target = self.here()?;
        self.patch_jump(idx, target);
        Ok(())
    }

    fn constant(&mut self, lit: &Literal) -> Result<u16, CompileError> {
        if let Some(i) = self.constants.iter().position(|c| c == lit) {
            return u16::try_from(i).map_err(|_| self.error("Too many constants (max 65535)"));
        }
        let idx = u16::try_from(self.constants.len())
            .map_err(|_| self.error("Too many constants (max 65535)"))?;
        self.constants.push(lit.clone());
        Ok(idx)
    }

    fn type_index(&mut self, ty: &CtlType) -> Result<u16, CompileError> {
        let position = match self.types.iter().position(|t| t == ty) {
            Some(i) => i,
            None => {
                self.types.push(ty.clone());
                self.types.len() - 1
            }
        };
        u16::try_from(position).map_err(|_| self.error("Too many types (max 65535)"))
    }

    fn small(&self, n: usize, what: &str) -> Result<u16, CompileError> {
        u16::try_from(n).map_err(|_| self.error(&format!("Too many {what} (max 65535)")))
    }

    fn argc(&self, n: usize) -> Result<u8, CompileError> {
        u8::try_from(n).map_err(|_| self.error("Too many arguments (max 255)"))
    }

    fn store_slot(&mut self, id: NodeId) -> Result<(), CompileError> {
        match self.ast().resolution(id) {
            Resolution::Local(slot) => self.emit(Op::StoreLocal(slot))?,
            Resolution::Global(slot) => self.emit(Op::StoreGlobal(slot))?,
            _ => return Err(self.error("Unresolved variable")),
        };
        Ok(())
    }

    fn innermost(&mut self, kind: Option<ScopeKind>) -> Result<&mut JumpScope, CompileError> {
        let span = self.span;
        self.scopes
            .iter_mut()
            .rev()
            .find(|s| kind.map_or(true, |k| s.kind == k))
            .ok_or_else(|| CompileError::compiler("Jump outside of loop or switch", span))
    }

    fn close_scope(&mut self, break_target: u16, continue_target: Option<u16>) {
        if let Some(scope) = self.scopes.pop() {
            for idx in scope.breaks {
                self.patch_jump(idx, break_target);
            }
            if let Some(target) = continue_target {
                for idx in scope.continues {
                    self.patch_jump(idx, target);
                }
            }
        }
    }

    fn open_scope(&mut self, kind: ScopeKind) {
        self.scopes.push(JumpScope {
            kind,
            breaks: Vec::new(),
            continues: Vec::new(),
        });
    }

    // ── Statements ────────────────────────────────────────────────

    fn stmt(&mut self, id: NodeId) -> Result<(), CompileError> {
        self.span = self.ast().span(id);
        let children = self.ast().children(id);
        match self.ast().kind(id) {
            NodeKind::VariableDeclaration { .. } => {
                let ty = self.type_index(self.ast().ty(id))?;
                match children.first() {
                    Some(init) => {
                        self.expr(*init)?;
                        self.emit(Op::Prepare(ty))?;
                    }
                    None => {
                        self.emit(Op::PushDefault(ty))?;
                    }
                }
                self.store_slot(id)?;
            }
            NodeKind::Block => {
                for stmt in children {
                    self.stmt(*stmt)?;
                }
            }
            NodeKind::Empty => {}
            NodeKind::If => {
                let [cond, then_branch, rest @ ..] = children else {
                    return Ok(());
                };
                self.expr(*cond)?;
                let skip_then = self.emit(Op::JumpIfFalse(0))?;
                self.stmt(*then_branch)?;
                match rest.first() {
                    Some(else_branch) => {
                        let skip_else = self.emit(Op::Jump(0))?;
                        self.patch_here(skip_then)?;
                        self.stmt(*else_branch)?;
                        self.patch_here(skip_else)?;
                    }
                    None => self.patch_here(skip_then)?,
                }
            }
            NodeKind::While => {
                let [cond, body] = children else {
                    return Ok(());
                };
                let start = self.here()?;
                self.expr(*cond)?;
                let exit = self.emit(Op::JumpIfFalse(0))?;
                self.open_scope(ScopeKind::Loop);
                self.stmt(*body)?;
                self.emit(Op::Jump(start))?;
                let end = self.here()?;
                self.patch_jump(exit, end);
                self.close_scope(end, Some(start));
            }
            NodeKind::DoWhile => {
                let [body, cond] = children else {
                    return Ok(());
                };
                let start = self.here()?;
                self.open_scope(ScopeKind::Loop);
                self.stmt(*body)?;
                let check = self.here()?;
                self.expr(*cond)?;
                self.emit(Op::JumpIfTrue(start))?;
                let end = self.here()?;
                self.close_scope(end, Some(check));
            }
            NodeKind::For => {
                let [init, cond, update, body] = children else {
                    return Ok(());
                };
                self.stmt(*init)?;
                let start = self.here()?;
                let exit = if matches!(self.ast().kind(*cond), NodeKind::Empty) {
                    None
                } else {
                    self.expr(*cond)?;
                    Some(self.emit(Op::JumpIfFalse(0))?)
                };
                self.open_scope(ScopeKind::Loop);
                self.stmt(*body)?;
                let next = self.here()?;
                if !matches!(self.ast().kind(*update), NodeKind::Empty) {
                    self.expr(*update)?;
                    self.emit(Op::Pop)?;
                }
                self.emit(Op::Jump(start))?;
                let end = self.here()?;
                if let Some(exit) = exit {
                    self.patch_jump(exit, end);
                }
                self.close_scope(end, Some(next));
            }
            NodeKind::Foreach => {
                let [decl, iterable, body] = children else {
                    return Ok(());
                };
                self.expr(*iterable)?;
                let element = self.type_index(self.ast().ty(*decl))?;
                self.emit(Op::IterInit(element))?;
                let next = self.here()?;
                let exhausted = self.emit(Op::IterNext(0))?;
                self.store_slot(*decl)?;
                self.open_scope(ScopeKind::Loop);
                self.stmt(*body)?;
                self.emit(Op::Jump(next))?;
                let exit = self.here()?;
                self.emit(Op::IterEnd)?;
                let end = self.here()?;
                self.patch_jump(exhausted, end);
                self.close_scope(exit, Some(next));
            }
            NodeKind::Switch => self.switch(id, children)?,
            NodeKind::Break => {
                let jump = self.emit(Op::Jump(0))?;
                self.innermost(None)?.breaks.push(jump);
            }
            NodeKind::Continue => {
                let jump = self.emit(Op::Jump(0))?;
                self.innermost(Some(ScopeKind::Loop))?.continues.push(jump);
            }
            NodeKind::Return => {
                match children.first() {
                    Some(value) => self.expr(*value)?,
                    None => {
                        self.emit(Op::PushNull)?;
                    }
                }
                self.emit(Op::Return)?;
            }
            _ => {
                self.expr(id)?;
                self.emit(Op::Pop)?;
            }
        }
        Ok(())
    }

    fn switch(&mut self, id: NodeId, children: &[NodeId]) -> Result<(), CompileError> {
        let Some((scrutinee, arms)) = children.split_first() else {
            return Ok(());
        };
        self.expr(*scrutinee)?;
        let table_index = self.small(self.switches.len(), "switch statements")?;
        let kind = match self.ast().resolution(id) {
            Resolution::Operands(kind) => Some(kind),
            _ => None,
        };
        self.switches.push(SwitchTable { kind, ..SwitchTable::default() });
        self.emit(Op::Switch(table_index))?;

        let mut table = SwitchTable { kind, ..SwitchTable::default() };
        self.open_scope(ScopeKind::Switch);
        for arm in arms {
            match self.ast().kind(*arm) {
                NodeKind::Case { is_default: true } => table.default = Some(self.here()?),
                NodeKind::Case { is_default: false } => {
                    let Some(label) = self.ast().child(*arm, 0) else {
                        continue;
                    };
                    let NodeKind::Literal(lit) = self.ast().kind(label) else {
                        return Err(self.error("Case label must be a literal"));
                    };
                    let constant = self.constant(lit)?;
                    table.cases.push((constant, self.here()?));
                }
                _ => self.stmt(*arm)?,
            }
        }
        let end = self.here()?;
        table.end = end;
        self.close_scope(end, None);
        if let Some(slot) = self.switches.get_mut(usize::from(table_index)) {
            *slot = table;
        }
        Ok(())
    }

    // ── Expressions ───────────────────────────────────────────────

    fn expr(&mut self, id: NodeId) -> Result<(), CompileError> {
        self.span = self.ast().span(id);
        let children = self.ast().children(id);
        match self.ast().kind(id) {
            NodeKind::Literal(lit) => {
                let idx = self.constant(lit)?;
                self.emit(Op::PushConst(idx))?;
            }
            NodeKind::ListLiteral => {
                for item in children {
                    self.expr(*item)?;
                }
                let count = self.small(children.len(), "list elements")?;
                let ty = self.type_index(self.ast().ty(id))?;
                self.emit(Op::NewList { count, ty })?;
            }
            NodeKind::MapLiteral => {
                for item in children {
                    self.expr(*item)?;
                }
                let pairs = self.small(children.len() / 2, "map entries")?;
                let ty = self.type_index(self.ast().ty(id))?;
                self.emit(Op::NewMap { pairs, ty })?;
            }
            NodeKind::Identifier { .. } => match self.ast().resolution(id) {
                Resolution::Local(slot) => {
                    self.emit(Op::LoadLocal(slot))?;
                }
                Resolution::Global(slot) => {
                    self.emit(Op::LoadGlobal(slot))?;
                }
                _ => return Err(self.error("Unresolved variable")),
            },
            NodeKind::Assignment { .. } => {
                let [lhs, rhs] = children else {
                    return Err(self.error("Malformed assignment"));
                };
                self.assignment(id, *lhs, *rhs)?;
            }
            NodeKind::Binary { op: BinaryOp::And } | NodeKind::Binary { op: BinaryOp::Or } => {
                let [lhs, rhs] = children else {
                    return Err(self.error("Malformed expression"));
                };
                let is_and = matches!(self.ast().kind(id), NodeKind::Binary { op: BinaryOp::And });
                let short =
                    |target| if is_and { Op::JumpIfFalse(target) } else { Op::JumpIfTrue(target) };
                self.expr(*lhs)?;
                let first = self.emit(short(0))?;
                self.expr(*rhs)?;
                let second = self.emit(short(0))?;
                self.emit(Op::PushBool(is_and))?;
                let done = self.emit(Op::Jump(0))?;
                self.patch_here(first)?;
                self.patch_here(second)?;
                self.emit(Op::PushBool(!is_and))?;
                self.patch_here(done)?;
            }
            NodeKind::Binary { op } => {
                let op = *op;
                let [lhs, rhs] = children else {
                    return Err(self.error("Malformed expression"));
                };
                let kind = self.operands(id);
                self.expr(*lhs)?;
                self.expr(*rhs)?;
                if let Some(arith) = op.arith() {
                    self.emit(Op::Arith(arith, kind))?;
                } else if let Some(compare) = op.compare() {
                    self.emit(Op::Compare(compare, kind))?;
                }
            }
            NodeKind::Unary { op } => {
                let op = *op;
                if let Some(operand) = children.first() {
                    self.expr(*operand)?;
                }
                match op {
                    UnaryOp::Neg => self.emit(Op::Neg(self.operands(id)))?,
                    UnaryOp::Not => self.emit(Op::Not)?,
                };
            }
            NodeKind::IncDec { op, prefix } => {
                let (delta, prefix) = (*op, *prefix);
                let delta = if delta.delta() > 0 { 1 } else { -1 };
                let Some(target) = children.first() else {
                    return Err(self.error("Malformed increment"));
                };
                let slot = self.place(*target)?;
                self.emit(Op::Step { slot, delta, prefix })?;
            }
            NodeKind::Conditional => {
                let [cond, then_branch, else_branch] = children else {
                    return Err(self.error("Malformed conditional"));
                };
                let ty = self.type_index(self.ast().ty(id))?;
                self.expr(*cond)?;
                let to_else = self.emit(Op::JumpIfFalse(0))?;
                self.expr(*then_branch)?;
                self.emit(Op::Convert(ty))?;
                let to_end = self.emit(Op::Jump(0))?;
                self.patch_here(to_else)?;
                self.expr(*else_branch)?;
                self.emit(Op::Convert(ty))?;
                self.patch_here(to_end)?;
            }
            NodeKind::Call { .. } => {
                for arg in children {
                    self.expr(*arg)?;
                }
                let argc = self.argc(children.len())?;
                match self.ast().resolution(id) {
                    Resolution::Function(f) => {
                        let function = self.small(f, "functions")?;
                        self.emit(Op::Call { function, argc })?;
                    }
                    Resolution::Builtin(b) => {
                        let builtin = self.small(b, "builtins")?;
                        self.emit(Op::CallBuiltin { builtin, argc })?;
                    }
                    _ => return Err(self.error("Unresolved function call")),
                }
            }
            NodeKind::Port { dir, .. } => {
                let Resolution::Port(index) = self.ast().resolution(id) else {
                    return Err(self.error("Unresolved record port"));
                };
                let index = self.small(index, "ports")?;
                match dir {
                    PortDir::Input => self.emit(Op::LoadInput(index))?,
                    PortDir::Output => self.emit(Op::LoadOutput(index))?,
                };
            }
            NodeKind::Member { .. } => {
                let Some(receiver) = children.first() else {
                    return Err(self.error("Malformed field access"));
                };
                self.expr(*receiver)?;
                match self.ast().resolution(id) {
                    Resolution::Field(index) => {
                        let index = self.small(index, "fields")?;
                        self.emit(Op::GetField(index))?;
                    }
                    Resolution::RecordCopy => {}
                    _ => return Err(self.error("Unresolved field")),
                }
            }
            NodeKind::Index => {
                let [container, index] = children else {
                    return Err(self.error("Malformed index"));
                };
                self.expr(*container)?;
                self.expr(*index)?;
                self.emit(Op::GetIndex)?;
            }
            NodeKind::Sequence { op, .. } => {
                let op = *op;
                let Resolution::Resource(index) = self.ast().resolution(id) else {
                    return Err(self.error("Unresolved sequence"));
                };
                let index = self.small(index, "sequences")?;
                self.emit(Op::Sequence(index, op))?;
            }
            NodeKind::Lookup { op, .. } => {
                let op = *op;
                for key in children {
                    self.expr(*key)?;
                }
                let Resolution::Resource(index) = self.ast().resolution(id) else {
                    return Err(self.error("Unresolved lookup"));
                };
                let lookup = self.small(index, "lookups")?;
                let argc = self.argc(children.len())?;
                self.emit(Op::Lookup { lookup, op, argc })?;
            }
            NodeKind::Empty => {
                self.emit(Op::PushNull)?;
            }
            other => return Err(self.error(&format!("{} is not an expression", other.name()))),
        }
        Ok(())
    }

    fn operands(&self, id: NodeId) -> OpKind {
        match self.ast().resolution(id) {
            Resolution::Operands(kind) => kind,
            _ => OpKind::Other,
        }
    }

    /// Emit the operands an lvalue needs and return the slot it names.
    fn place(&mut self, id: NodeId) -> Result<Slot, CompileError> {
        match (self.ast().kind(id), self.ast().resolution(id)) {
            (NodeKind::Identifier { .. }, Resolution::Local(slot)) => Ok(Slot::Local(slot)),
            (NodeKind::Identifier { .. }, Resolution::Global(slot)) => Ok(Slot::Global(slot)),
            (NodeKind::Member { .. }, Resolution::Field(index)) => {
                let receiver =
                    self.ast().child(id, 0).ok_or_else(|| self.error("Malformed field access"))?;
                self.expr(receiver)?;
                Ok(Slot::Field(self.small(index, "fields")?))
            }
            (NodeKind::Index, _) => {
                let (Some(container), Some(index)) =
                    (self.ast().child(id, 0), self.ast().child(id, 1))
                else {
                    return Err(self.error("Malformed index"));
                };
                self.expr(container)?;
                self.expr(index)?;
                Ok(Slot::Element)
            }
            _ => Err(self.error("Invalid assignment target")),
        }
    }

    fn assignment(&mut self, id: NodeId, lhs: NodeId, rhs: NodeId) -> Result<(), CompileError> {
        if self.ast().resolution(id) == Resolution::RecordCopy {
            let receiver =
                self.ast().child(lhs, 0).ok_or_else(|| self.error("Malformed record copy"))?;
            self.expr(receiver)?;
            self.expr(rhs)?;
            self.emit(Op::CopyRecord)?;
            return Ok(());
        }
        let ty = self.type_index(self.ast().ty(lhs))?;
        let slot = self.place(lhs)?;
        self.expr(rhs)?;
        self.emit(Op::Prepare(ty))?;
        match slot {
            Slot::Local(s) => {
                self.emit(Op::Dup)?;
                self.emit(Op::StoreLocal(s))?;
            }
            Slot::Global(s) => {
                self.emit(Op::Dup)?;
                self.emit(Op::StoreGlobal(s))?;
            }
            Slot::Field(index) => {
                self.emit(Op::SetField(index))?;
            }
            Slot::Element => {
                self.emit(Op::SetIndex)?;
            }
        }
        Ok(())
    }
}
