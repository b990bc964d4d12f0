//! Tree-walking back-end. Evaluates the resolved AST directly.

use indexmap::IndexMap;

use super::ast::*;
use super::builtins;
use super::context::{
    binary, case_matches, copy_record, foreach_items, load_field, load_index, prepare_store,
    store_field, store_index, ExecutionContext,
};
use super::program::Program;
use super::scope::SymbolTable;
use super::{ExecutionMode, TransformProgram};
use crate::model::value::{negate, new_list, new_map, step};
use crate::model::{CtlType, MapKey, OpKind, RecordRef, RuntimeError, Value};

/// Control state after a statement.
#[derive(Debug)]
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Assignable location resolved from an lvalue expression.
enum Place {
    Local(u16),
    Global(u16),
    Field(Value, usize),
    Element(Value, Value),
}

#[derive(Debug, Clone)]
pub struct Interpreter {
    program: Program,
}

impl Interpreter {
    pub fn new(program: Program) -> Self {
        Self { program }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }
}

impl TransformProgram for Interpreter {
    fn symbols(&self) -> &SymbolTable {
        &self.program.symbols
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Interpret
    }

    fn run_global(&self, ctx: &mut ExecutionContext) -> Result<(), RuntimeError> {
        ctx.ensure_globals(&self.program.symbols);
        let mut eval = Eval {
            program: &self.program,
            ctx,
            locals: Vec::new(),
            inputs: &[],
            outputs: &[],
        };
        for stmt in &self.program.global_code {
            eval.exec(*stmt)?;
        }
        ctx.mark_initialized();
        Ok(())
    }

    fn execute_function(
        &self,
        ctx: &mut ExecutionContext,
        function: usize,
        args: Vec<Value>,
        inputs: &[RecordRef],
        outputs: &[RecordRef],
    ) -> Result<Value, RuntimeError> {
        ctx.ensure_globals(&self.program.symbols);
        let mut eval = Eval {
            program: &self.program,
            ctx,
            locals: Vec::new(),
            inputs,
            outputs,
        };
        eval.call(function, args)
    }
}

struct Eval<'a> {
    program: &'a Program,
    ctx: &'a mut ExecutionContext,
    locals: Vec<Value>,
    inputs: &'a [RecordRef],
    outputs: &'a [RecordRef],
}

fn unresolved(ast: &Ast, id: NodeId) -> RuntimeError {
    RuntimeError::type_mismatch("resolved expression", ast.kind(id).name())
}

impl<'a> Eval<'a> {
    fn ast(&self) -> &'a Ast {
        let program: &'a Program = self.program;
        &program.ast
    }

    fn operands(&self, id: NodeId) -> OpKind {
        match self.ast().resolution(id) {
            Resolution::Operands(kind) => kind,
            _ => OpKind::Other,
        }
    }

    fn call(&mut self, function: usize, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let program: &'a Program = self.program;
        let Some(info) = program.symbols.functions.get(function) else {
            return Err(RuntimeError::UnknownFunction(format!("#{function}")));
        };
        self.ctx.enter_call()?;
        let result =
            self.call_body(info.node, &info.params, &info.ret, usize::from(info.local_count), args);
        self.ctx.leave_call();
        result.map_err(|e| e.in_function(&info.name))
    }

    fn call_body(
        &mut self,
        node: NodeId,
        params: &[CtlType],
        ret: &CtlType,
        local_count: usize,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let mut frame = Vec::with_capacity(local_count.max(args.len()));
        for (value, ty) in args.into_iter().zip(params) {
            frame.push(value.coerce_to(ty)?);
        }
        frame.resize(local_count.max(frame.len()), Value::Null);
        let saved = std::mem::replace(&mut self.locals, frame);
        let flow = match self.ast().child(node, 1) {
            Some(body) => self.exec(body),
            None => Ok(Flow::Normal),
        };
        self.locals = saved;
        match flow? {
            Flow::Return(value) if *ret != CtlType::Void => value.coerce_to(ret),
            _ => Ok(Value::Null),
        }
    }

    // ── Statements ────────────────────────────────────────────────

    fn exec(&mut self, id: NodeId) -> Result<Flow, RuntimeError> {
        let children = self.ast().children(id).to_vec();
        match self.ast().kind(id) {
            NodeKind::VariableDeclaration { .. } => {
                let ty = self.ast().ty(id).clone();
                let value = match children.first() {
                    Some(init) => prepare_store(self.eval(*init)?, &ty)?,
                    None => Value::default_for(&ty),
                };
                self.bind(id, value)?;
                Ok(Flow::Normal)
            }
            NodeKind::Block => self.exec_all(&children),
            NodeKind::Empty => Ok(Flow::Normal),
            NodeKind::If => {
                let [cond, then_branch, rest @ ..] = children.as_slice() else {
                    return Ok(Flow::Normal);
                };
                if self.eval(*cond)?.as_bool()? {
                    self.exec(*then_branch)
                } else if let Some(else_branch) = rest.first() {
                    self.exec(*else_branch)
                } else {
                    Ok(Flow::Normal)
                }
            }
            NodeKind::While => {
                let [cond, body] = children.as_slice() else {
                    return Ok(Flow::Normal);
                };
                while self.eval(*cond)?.as_bool()? {
                    match self.exec(*body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            NodeKind::DoWhile => {
                let [body, cond] = children.as_slice() else {
                    return Ok(Flow::Normal);
                };
                loop {
                    match self.exec(*body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if !self.eval(*cond)?.as_bool()? {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            NodeKind::For => {
                let [init, cond, update, body] = children.as_slice() else {
                    return Ok(Flow::Normal);
                };
                self.exec(*init)?;
                loop {
                    let go = matches!(self.ast().kind(*cond), NodeKind::Empty)
                        || self.eval(*cond)?.as_bool()?;
                    if !go {
                        break;
                    }
                    match self.exec(*body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    self.exec(*update)?;
                }
                Ok(Flow::Normal)
            }
            NodeKind::Foreach => {
                let [decl, iterable, body] = children.as_slice() else {
                    return Ok(Flow::Normal);
                };
                let element = self.ast().ty(*decl).clone();
                let collection = self.eval(*iterable)?;
                for item in foreach_items(&collection, &element)? {
                    self.bind(*decl, item)?;
                    match self.exec(*body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            NodeKind::Switch => self.exec_switch(id, &children),
            NodeKind::Break => Ok(Flow::Break),
            NodeKind::Continue => Ok(Flow::Continue),
            NodeKind::Return => {
                let value = match children.first() {
                    Some(v) => self.eval(*v)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            _ => {
                self.eval(id)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn exec_all(&mut self, statements: &[NodeId]) -> Result<Flow, RuntimeError> {
        for stmt in statements {
            match self.exec(*stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    /// Jump to the matching label (or `default`) and fall through the
    /// remaining arms in source order until a `break`.
    fn exec_switch(&mut self, id: NodeId, children: &[NodeId]) -> Result<Flow, RuntimeError> {
        let Some((scrutinee, arms)) = children.split_first() else {
            return Ok(Flow::Normal);
        };
        let kind = self.operands(id);
        let value = self.eval(*scrutinee)?;
        let mut start = None;
        let mut default = None;
        for (position, arm) in arms.iter().enumerate() {
            match self.ast().kind(*arm) {
                NodeKind::Case { is_default: true } => default = default.or(Some(position)),
                NodeKind::Case { is_default: false } => {
                    let Some(label) = self.ast().child(*arm, 0) else {
                        continue;
                    };
                    let label = self.eval(label)?;
                    if case_matches(&value, &label, kind)? {
                        start = Some(position);
                        break;
                    }
                }
                _ => {}
            }
        }
        let Some(start) = start.or(default) else {
            return Ok(Flow::Normal);
        };
        for arm in arms.iter().skip(start) {
            if matches!(self.ast().kind(*arm), NodeKind::Case { .. }) {
                continue;
            }
            match self.exec(*arm)? {
                Flow::Normal => {}
                Flow::Break => break,
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    /// Store into the slot a declaration was bound to.
    fn bind(&mut self, decl: NodeId, value: Value) -> Result<(), RuntimeError> {
        match self.ast().resolution(decl) {
            Resolution::Local(slot) => self.set_local(slot, value),
            Resolution::Global(slot) => self.ctx.store_global(slot, value),
            _ => return Err(unresolved(self.ast(), decl)),
        }
        Ok(())
    }

    fn set_local(&mut self, slot: u16, value: Value) {
        let slot = usize::from(slot);
        if slot >= self.locals.len() {
            self.locals.resize(slot + 1, Value::Null);
        }
        self.locals[slot] = value;
    }

    // ── Expressions ───────────────────────────────────────────────

    fn eval(&mut self, id: NodeId) -> Result<Value, RuntimeError> {
        let children = self.ast().children(id).to_vec();
        match self.ast().kind(id).clone() {
            NodeKind::Literal(lit) => Ok(lit.to_value()),
            NodeKind::ListLiteral => {
                let elem = self.ast().ty(id).element_type().cloned().unwrap_or(CtlType::Any);
                let mut items = Vec::with_capacity(children.len());
                for item in children {
                    items.push(self.eval(item)?.coerce_to(&elem)?);
                }
                Ok(new_list(items))
            }
            NodeKind::MapLiteral => {
                let (key_ty, value_ty) = match self.ast().ty(id) {
                    CtlType::Map(k, v) => ((**k).clone(), (**v).clone()),
                    _ => (CtlType::Any, CtlType::Any),
                };
                let mut entries = IndexMap::new();
                for pair in children.chunks(2) {
                    let [key, value] = pair else { continue };
                    let key = self.eval(*key)?.coerce_to(&key_ty)?;
                    let value = self.eval(*value)?.coerce_to(&value_ty)?;
                    entries.insert(MapKey::from_value(&key)?, value);
                }
                Ok(new_map(entries))
            }
            NodeKind::Identifier { .. } => match self.ast().resolution(id) {
                Resolution::Local(slot) => {
                    Ok(self.locals.get(usize::from(slot)).cloned().unwrap_or(Value::Null))
                }
                Resolution::Global(slot) => Ok(self.ctx.load_global(slot)),
                _ => Err(unresolved(self.ast(), id)),
            },
            NodeKind::Assignment { .. } => {
                let [lhs, rhs] = children.as_slice() else {
                    return Err(unresolved(self.ast(), id));
                };
                if self.ast().resolution(id) == Resolution::RecordCopy {
                    let target = match self.ast().child(*lhs, 0) {
                        Some(receiver) => self.eval(receiver)?,
                        None => return Err(unresolved(self.ast(), id)),
                    };
                    let source = self.eval(*rhs)?;
                    copy_record(&target, &source)?;
                    return Ok(target);
                }
                let place = self.place(*lhs)?;
                let value = self.eval(*rhs)?;
                let ty = self.ast().ty(*lhs).clone();
                self.write(place, value, &ty)
            }
            NodeKind::Binary { op } => {
                let [lhs, rhs] = children.as_slice() else {
                    return Err(unresolved(self.ast(), id));
                };
                let left = self.eval(*lhs)?;
                match op {
                    BinaryOp::And if !left.as_bool()? => Ok(Value::Boolean(false)),
                    BinaryOp::Or if left.as_bool()? => Ok(Value::Boolean(true)),
                    _ => {
                        let right = self.eval(*rhs)?;
                        binary(op, &left, &right, self.operands(id))
                    }
                }
            }
            NodeKind::Unary { op } => {
                let operand = children.first().map_or(Ok(Value::Null), |c| self.eval(*c))?;
                match op {
                    UnaryOp::Neg => negate(&operand, self.operands(id)),
                    UnaryOp::Not => Ok(Value::Boolean(!operand.as_bool()?)),
                }
            }
            NodeKind::IncDec { op, prefix } => {
                let Some(target) = children.first() else {
                    return Err(unresolved(self.ast(), id));
                };
                let place = self.place(*target)?;
                let old = self.read(&place)?;
                let new = step(&old, op.delta())?;
                let ty = self.ast().ty(*target).clone();
                self.write(place, new.clone(), &ty)?;
                Ok(if prefix { new } else { old })
            }
            NodeKind::Conditional => {
                let [cond, then_branch, else_branch] = children.as_slice() else {
                    return Err(unresolved(self.ast(), id));
                };
                let ty = self.ast().ty(id).clone();
                let chosen = if self.eval(*cond)?.as_bool()? { *then_branch } else { *else_branch };
                self.eval(chosen)?.coerce_to(&ty)
            }
            NodeKind::Call { name } => {
                let mut args = Vec::with_capacity(children.len());
                for arg in children {
                    args.push(self.eval(arg)?);
                }
                match self.ast().resolution(id) {
                    Resolution::Function(function) => self.call(function, args),
                    Resolution::Builtin(builtin) => builtins::invoke(builtin, args),
                    _ => Err(RuntimeError::UnknownFunction(name)),
                }
            }
            NodeKind::Port { dir, .. } => {
                let Resolution::Port(index) = self.ast().resolution(id) else {
                    return Err(unresolved(self.ast(), id));
                };
                let (records, prefix) = match dir {
                    PortDir::Input => (self.inputs, "$in"),
                    PortDir::Output => (self.outputs, "$out"),
                };
                records
                    .get(index)
                    .map(|r| Value::Record(r.clone()))
                    .ok_or_else(|| RuntimeError::UnboundPort(format!("{prefix}.{index}")))
            }
            NodeKind::Member { .. } => {
                let Some(receiver) = children.first() else {
                    return Err(unresolved(self.ast(), id));
                };
                let record = self.eval(*receiver)?;
                match self.ast().resolution(id) {
                    Resolution::Field(index) => load_field(&record, index),
                    Resolution::RecordCopy => Ok(record),
                    _ => Err(unresolved(self.ast(), id)),
                }
            }
            NodeKind::Index => {
                let [container, index] = children.as_slice() else {
                    return Err(unresolved(self.ast(), id));
                };
                let container = self.eval(*container)?;
                let index = self.eval(*index)?;
                load_index(&container, &index)
            }
            NodeKind::Sequence { op, .. } => {
                let Resolution::Resource(index) = self.ast().resolution(id) else {
                    return Err(unresolved(self.ast(), id));
                };
                let program: &'a Program = self.program;
                let sequence =
                    program.sequences.get(index).ok_or_else(|| unresolved(self.ast(), id))?;
                self.ctx.sequence(sequence, op)
            }
            NodeKind::Lookup { name, op } => {
                let mut keys = Vec::with_capacity(children.len());
                for key in children {
                    keys.push(self.eval(key)?);
                }
                self.ctx.lookup(&name, op, &keys)
            }
            NodeKind::Empty => Ok(Value::Null),
            _ => Err(unresolved(self.ast(), id)),
        }
    }

    fn place(&mut self, id: NodeId) -> Result<Place, RuntimeError> {
        let resolution = self.ast().resolution(id);
        match (self.ast().kind(id), resolution) {
            (NodeKind::Identifier { .. }, Resolution::Local(slot)) => Ok(Place::Local(slot)),
            (NodeKind::Identifier { .. }, Resolution::Global(slot)) => Ok(Place::Global(slot)),
            (NodeKind::Member { .. }, Resolution::Field(index)) => {
                let receiver = self.ast().child(id, 0).ok_or_else(|| unresolved(self.ast(), id))?;
                Ok(Place::Field(self.eval(receiver)?, index))
            }
            (NodeKind::Index, _) => {
                let (Some(container), Some(index)) =
                    (self.ast().child(id, 0), self.ast().child(id, 1))
                else {
                    return Err(unresolved(self.ast(), id));
                };
                Ok(Place::Element(self.eval(container)?, self.eval(index)?))
            }
            _ => Err(unresolved(self.ast(), id)),
        }
    }

    fn read(&self, place: &Place) -> Result<Value, RuntimeError> {
        match place {
            Place::Local(slot) => {
                Ok(self.locals.get(usize::from(*slot)).cloned().unwrap_or(Value::Null))
            }
            Place::Global(slot) => Ok(self.ctx.load_global(*slot)),
            Place::Field(record, index) => load_field(record, *index),
            Place::Element(container, index) => load_index(container, index),
        }
    }

    /// Store `value` (widened to `ty`) and return what was stored.
    fn write(&mut self, place: Place, value: Value, ty: &CtlType) -> Result<Value, RuntimeError> {
        let value = prepare_store(value, ty)?;
        match place {
            Place::Local(slot) => self.set_local(slot, value.clone()),
            Place::Global(slot) => self.ctx.store_global(slot, value.clone()),
            Place::Field(record, index) => store_field(&record, index, value.clone())?,
            Place::Element(container, index) => store_index(&container, &index, value.clone())?,
        }
        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dsl::program::CompileEnv;
    use crate::dsl::{lexer, parser, typeck};
    use crate::model::{FieldMetadata, Record, RecordMetadata};

    fn person() -> Arc<RecordMetadata> {
        Arc::new(RecordMetadata::new(
            "person",
            vec![
                FieldMetadata::new("name", CtlType::String),
                FieldMetadata::new("age", CtlType::Integer),
            ],
        ))
    }

    fn build(src: &str) -> Interpreter {
        let env = CompileEnv::new().with_input(person()).with_output(person());
        let mut ast = parser::parse(lexer::lex(src).unwrap()).unwrap();
        let resolved = typeck::resolve(&mut ast, &env).unwrap();
        Interpreter::new(Program::new(ast, resolved, &env, ExecutionMode::Interpret))
    }

    fn global(src: &str, name: &str) -> Value {
        let interp = build(src);
        let mut ctx = ExecutionContext::new();
        interp.run_global(&mut ctx).unwrap();
        interp.get_variable_value(&ctx, name).unwrap()
    }

    #[test]
    fn arithmetic_and_promotion() {
        assert!(matches!(global("long r = 2147483647 + 1L;", "r"), Value::Long(2_147_483_648)));
        assert!(matches!(global("integer r = 7 / 2;", "r"), Value::Integer(3)));
        assert_eq!(global("decimal r = 1.1D + 2;", "r").to_string(), "3.1");
    }

    #[test]
    fn compound_assignment_and_increments() {
        let src = "integer a = 5; a += 3; a *= 2; integer r = a++;";
        assert!(matches!(global(src, "r"), Value::Integer(16)));
        assert!(matches!(global("integer a = 5; integer r = --a;", "r"), Value::Integer(4)));
    }

    #[test]
    fn loops_with_break_and_continue() {
        let src = "integer total; for (integer i = 0; i < 10; i++) \
                   { if (i % 2 == 0) continue; if (i > 7) break; total += i; }";
        assert!(matches!(global(src, "total"), Value::Integer(16)));
        let src = "integer n; do { n++; } while (n < 3);";
        assert!(matches!(global(src, "n"), Value::Integer(3)));
    }

    #[test]
    fn switch_falls_through_until_break() {
        let src = "string trace; integer x = 0;\n\
                   switch (x) { case 0: trace = trace + \"0\"; \
                   case 1: trace = trace + \"1\"; break; case 2: trace = trace + \"2\"; }";
        assert_eq!(global(src, "trace").to_string(), "01");
        let src = "string t; \
                   switch (9) { case 1: t = \"a\"; \
                   default: t = t + \"d\"; case 2: t = t + \"2\"; }";
        assert_eq!(global(src, "t").to_string(), "d2");
    }

    #[test]
    fn recursion_and_overloads() {
        let src = "function integer fact(integer n) \
                   { if (n <= 1) return 1; return n * fact(n - 1); }\n\
                   function string fact(string s) { return s + \"!\"; }\n\
                   integer a = fact(5); string b = fact(\"x\");";
        assert!(matches!(global(src, "a"), Value::Integer(120)));
        assert_eq!(global(src, "b").to_string(), "x!");
    }

    #[test]
    fn list_declaration_copies_but_arguments_alias() {
        let src = "integer[] a = [1]; integer[] b = a; append(b, 2); \
                   integer la = length(a); integer lb = length(b);";
        assert!(matches!(global(src, "la"), Value::Integer(1)));
        assert!(matches!(global(src, "lb"), Value::Integer(2)));
    }

    #[test]
    fn record_fields_and_copy() {
        let interp = build(
            "function integer transform() \
             { $out.0.* = $in.0.*; $out.0.age = $in.0.age + 1; return 0; }",
        );
        let input = Record::new_ref(person());
        input.borrow_mut().set(0, Value::String("Ann".into())).unwrap();
        input.borrow_mut().set(1, Value::Integer(30)).unwrap();
        let output = Record::new_ref(person());
        let mut ctx = ExecutionContext::new();
        interp.run_global(&mut ctx).unwrap();
        let f = interp.find_function("transform", &[]).unwrap();
        interp
            .execute_function(&mut ctx, f, Vec::new(), &[input.clone()], &[output.clone()])
            .unwrap();
        assert_eq!(output.borrow().get(0).unwrap().to_string(), "Ann");
        assert!(matches!(output.borrow().get(1), Some(Value::Integer(31))));
        assert!(matches!(input.borrow().get(1), Some(Value::Integer(30))));
    }

    #[test]
    fn errors_carry_the_call_chain() {
        let interp = build(
            "function integer inner() { return 1 / 0; } \
             function integer outer() { return inner(); }",
        );
        let mut ctx = ExecutionContext::new();
        let f = interp.find_function("outer", &[]).unwrap();
        let err = interp.execute_function(&mut ctx, f, Vec::new(), &[], &[]).unwrap_err();
        assert_eq!(err.stack_trace().lines().count(), 3);
        assert!(matches!(err.root(), RuntimeError::DivisionByZero));
    }

    #[test]
    fn runaway_recursion_is_stopped() {
        let interp = build("function integer f(integer n) { return f(n + 1); }");
        let mut ctx = ExecutionContext::new().with_max_call_depth(32);
        let f = interp.find_function("f", &[CtlType::Integer]).unwrap();
        let err =
            interp.execute_function(&mut ctx, f, vec![Value::Integer(0)], &[], &[]).unwrap_err();
        assert!(matches!(err.root(), RuntimeError::StackOverflow(32)));
    }

    #[test]
    fn short_circuit_skips_the_right_operand() {
        let src = "integer[] l; boolean r = false && l[5] == 1;";
        assert!(matches!(global(src, "r"), Value::Boolean(false)));
        let src = "integer[] l; boolean r = true || l[5] == 1;";
        assert!(matches!(global(src, "r"), Value::Boolean(true)));
    }

    #[test]
    fn foreach_over_map_values() {
        let src = "map[string, integer] m = {\"a\" -> 1, \"b\" -> 2}; \
                   integer sum; foreach (integer v : m) { sum += v; }";
        assert!(matches!(global(src, "sum"), Value::Integer(3)));
    }
}
