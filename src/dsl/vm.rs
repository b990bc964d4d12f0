//! Stack-machine back-end. Executes the bytecode produced by `compiler`.

use indexmap::IndexMap;

use super::builtins;
use super::compiler::{CompiledFunction, CompiledUnit, Op, Slot};
use super::context::{
    case_matches, copy_record, foreach_items, load_field, load_index, prepare_store, store_field,
    store_index, ExecutionContext,
};
use super::scope::SymbolTable;
use super::{ExecutionMode, TransformProgram};
use crate::model::value::{arithmetic, compare_values, negate, new_list, new_map, step};
use crate::model::{CtlType, MapKey, OpKind, RecordRef, RuntimeError, Value};

/// Maximum operand stack depth per call frame.
const MAX_STACK: usize = 1024;

#[derive(Debug, Clone)]
pub struct Vm {
    unit: CompiledUnit,
    /// Constant pool materialized once.
    constants: Vec<Value>,
}

impl Vm {
    pub fn new(unit: CompiledUnit) -> Self {
        let constants = unit.constants.iter().map(|c| c.to_value()).collect();
        Self { unit, constants }
    }

    pub fn unit(&self) -> &CompiledUnit {
        &self.unit
    }
}

impl TransformProgram for Vm {
    fn symbols(&self) -> &SymbolTable {
        &self.unit.symbols
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Compile
    }

    fn run_global(&self, ctx: &mut ExecutionContext) -> Result<(), RuntimeError> {
        ctx.ensure_globals(&self.unit.symbols);
        let mut machine = Machine {
            vm: self,
            ctx,
            inputs: &[],
            outputs: &[],
        };
        machine.run(&self.unit.global, Vec::new())?;
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
        ctx.ensure_globals(&self.unit.symbols);
        let mut machine = Machine {
            vm: self,
            ctx,
            inputs,
            outputs,
        };
        machine.call(function, args)
    }

    fn listing(&self) -> Option<String> {
        Some(self.unit.to_string())
    }
}

/// Live iteration over a snapshot of a collection.
struct Iteration {
    items: std::vec::IntoIter<Value>,
}

struct Machine<'a> {
    vm: &'a Vm,
    ctx: &'a mut ExecutionContext,
    inputs: &'a [RecordRef],
    outputs: &'a [RecordRef],
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, RuntimeError> {
    stack.pop().ok_or_else(|| RuntimeError::type_mismatch("operand", "empty stack"))
}

/// Pop the top `n` values, preserving their push order.
fn pop_n(stack: &mut Vec<Value>, n: usize) -> Result<Vec<Value>, RuntimeError> {
    let at = stack
        .len()
        .checked_sub(n)
        .ok_or_else(|| RuntimeError::type_mismatch("operands", "empty stack"))?;
    Ok(stack.split_off(at))
}

impl<'a> Machine<'a> {
    fn unit(&self) -> &'a CompiledUnit {
        let vm: &'a Vm = self.vm;
        &vm.unit
    }

    fn constant(&self, index: u16) -> Value {
        self.vm.constants.get(usize::from(index)).cloned().unwrap_or(Value::Null)
    }

    fn ty(&self, index: u16) -> Result<&'a CtlType, RuntimeError> {
        self.unit()
            .types
            .get(usize::from(index))
            .ok_or_else(|| RuntimeError::type_mismatch("type", format!("#{index}")))
    }

    fn call(&mut self, function: usize, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let Some(chunk) = self.unit().functions.get(function) else {
            return Err(RuntimeError::UnknownFunction(format!("#{function}")));
        };
        self.ctx.enter_call()?;
        let result = self.run(chunk, args);
        self.ctx.leave_call();
        result.map_err(|e| e.in_function(&chunk.name))
    }

    #[allow(clippy::too_many_lines)]
    fn run(
        &mut self,
        chunk: &'a CompiledFunction,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let mut locals = Vec::with_capacity(usize::from(chunk.local_count).max(args.len()));
        for (value, ty) in args.into_iter().zip(&chunk.params) {
            locals.push(value.coerce_to(ty)?);
        }
        locals.resize(usize::from(chunk.local_count).max(locals.len()), Value::Null);

        let mut stack: Vec<Value> = Vec::with_capacity(16);
        let mut iterations: Vec<Iteration> = Vec::new();
        let ops = &chunk.ops;
        let mut ip: usize = 0;

        while ip < ops.len() {
            if stack.len() >= MAX_STACK {
                return Err(RuntimeError::StackOverflow(MAX_STACK));
            }
            let op = ops[ip];
            ip += 1;

            match op {
                Op::PushConst(idx) => stack.push(self.constant(idx)),
                Op::PushNull => stack.push(Value::Null),
                Op::PushBool(b) => stack.push(Value::Boolean(b)),
                Op::PushDefault(t) => stack.push(Value::default_for(self.ty(t)?)),
                Op::Pop => {
                    pop(&mut stack)?;
                }
                Op::Dup => {
                    let top = stack.last().cloned().unwrap_or(Value::Null);
                    stack.push(top);
                }

                Op::LoadLocal(slot) => {
                    stack.push(locals.get(usize::from(slot)).cloned().unwrap_or(Value::Null));
                }
                Op::StoreLocal(slot) => {
                    let value = pop(&mut stack)?;
                    let slot = usize::from(slot);
                    if slot >= locals.len() {
                        locals.resize(slot + 1, Value::Null);
                    }
                    locals[slot] = value;
                }
                Op::LoadGlobal(slot) => stack.push(self.ctx.load_global(slot)),
                Op::StoreGlobal(slot) => {
                    let value = pop(&mut stack)?;
                    self.ctx.store_global(slot, value);
                }

                // Records
                Op::LoadInput(idx) => stack.push(self.port(self.inputs, "$in", idx)?),
                Op::LoadOutput(idx) => stack.push(self.port(self.outputs, "$out", idx)?),
                Op::GetField(idx) => {
                    let record = pop(&mut stack)?;
                    stack.push(load_field(&record, usize::from(idx))?);
                }
                Op::SetField(idx) => {
                    let value = pop(&mut stack)?;
                    let record = pop(&mut stack)?;
                    store_field(&record, usize::from(idx), value.clone())?;
                    stack.push(value);
                }
                Op::CopyRecord => {
                    let source = pop(&mut stack)?;
                    let target = pop(&mut stack)?;
                    copy_record(&target, &source)?;
                    stack.push(target);
                }

                // Containers
                Op::GetIndex => {
                    let index = pop(&mut stack)?;
                    let container = pop(&mut stack)?;
                    stack.push(load_index(&container, &index)?);
                }
                Op::SetIndex => {
                    let value = pop(&mut stack)?;
                    let index = pop(&mut stack)?;
                    let container = pop(&mut stack)?;
                    store_index(&container, &index, value.clone())?;
                    stack.push(value);
                }
                Op::NewList { count, ty } => {
                    let elem = self.ty(ty)?.element_type().cloned().unwrap_or(CtlType::Any);
                    let items = pop_n(&mut stack, usize::from(count))?
                        .into_iter()
                        .map(|v| v.coerce_to(&elem))
                        .collect::<Result<Vec<_>, _>>()?;
                    stack.push(new_list(items));
                }
                Op::NewMap { pairs, ty } => {
                    let (key_ty, value_ty) = match self.ty(ty)? {
                        CtlType::Map(k, v) => ((**k).clone(), (**v).clone()),
                        _ => (CtlType::Any, CtlType::Any),
                    };
                    let flat = pop_n(&mut stack, usize::from(pairs) * 2)?;
                    let mut entries = IndexMap::with_capacity(usize::from(pairs));
                    let mut flat = flat.into_iter();
                    while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
                        let key = key.coerce_to(&key_ty)?;
                        entries.insert(MapKey::from_value(&key)?, value.coerce_to(&value_ty)?);
                    }
                    stack.push(new_map(entries));
                }

                // Operators
                Op::Arith(arith, kind) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    stack.push(arithmetic(arith, &lhs, &rhs, kind)?);
                }
                Op::Compare(compare, kind) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    stack.push(Value::Boolean(compare_values(compare, &lhs, &rhs, kind)?));
                }
                Op::Neg(kind) => {
                    let value = pop(&mut stack)?;
                    stack.push(negate(&value, kind)?);
                }
                Op::Not => {
                    let value = pop(&mut stack)?;
                    stack.push(Value::Boolean(!value.as_bool()?));
                }
                Op::Step { slot, delta, prefix } => {
                    let result =
                        self.step(&mut stack, &mut locals, slot, i32::from(delta), prefix)?;
                    stack.push(result);
                }

                Op::Convert(t) => {
                    let value = pop(&mut stack)?;
                    stack.push(value.coerce_to(self.ty(t)?)?);
                }
                Op::Prepare(t) => {
                    let value = pop(&mut stack)?;
                    stack.push(prepare_store(value, self.ty(t)?)?);
                }

                // Control flow
                Op::Jump(target) => ip = usize::from(target),
                Op::JumpIfFalse(target) => {
                    if !pop(&mut stack)?.as_bool()? {
                        ip = usize::from(target);
                    }
                }
                Op::JumpIfTrue(target) => {
                    if pop(&mut stack)?.as_bool()? {
                        ip = usize::from(target);
                    }
                }
                Op::Switch(table) => {
                    let scrutinee = pop(&mut stack)?;
                    ip = self.switch_target(table, &scrutinee)?;
                }
                Op::IterInit(t) => {
                    let collection = pop(&mut stack)?;
                    let items = foreach_items(&collection, self.ty(t)?)?;
                    iterations.push(Iteration {
                        items: items.into_iter(),
                    });
                }
                Op::IterNext(exhausted) => {
                    match iterations.last_mut().and_then(|it| it.items.next()) {
                        Some(item) => stack.push(item),
                        None => {
                            iterations.pop();
                            ip = usize::from(exhausted);
                        }
                    }
                }
                Op::IterEnd => {
                    iterations.pop();
                }

                // Calls and resources
                Op::Call { function, argc } => {
                    let args = pop_n(&mut stack, usize::from(argc))?;
                    let result = self.call(usize::from(function), args)?;
                    stack.push(result);
                }
                Op::CallBuiltin { builtin, argc } => {
                    let args = pop_n(&mut stack, usize::from(argc))?;
                    stack.push(builtins::invoke(usize::from(builtin), args)?);
                }
                Op::Sequence(idx, op) => {
                    let unit = self.unit();
                    let sequence = unit
                        .sequences
                        .get(usize::from(idx))
                        .ok_or_else(|| RuntimeError::type_mismatch("sequence", format!("#{idx}")))?;
                    stack.push(self.ctx.sequence(sequence, op)?);
                }
                Op::Lookup { lookup, op, argc } => {
                    let keys = pop_n(&mut stack, usize::from(argc))?;
                    let unit = self.unit();
                    let name = unit
                        .lookups
                        .get(usize::from(lookup))
                        .ok_or_else(|| {
                            RuntimeError::type_mismatch("lookup", format!("#{lookup}"))
                        })?;
                    stack.push(self.ctx.lookup(name, op, &keys)?);
                }
                Op::Return => {
                    let value = pop(&mut stack)?;
                    return if chunk.ret == CtlType::Void {
                        Ok(Value::Null)
                    } else {
                        value.coerce_to(&chunk.ret)
                    };
                }
            }
        }
        Ok(Value::Null)
    }

    fn port(&self, records: &[RecordRef], prefix: &str, idx: u16) -> Result<Value, RuntimeError> {
        records
            .get(usize::from(idx))
            .map(|r| Value::Record(r.clone()))
            .ok_or_else(|| RuntimeError::UnboundPort(format!("{prefix}.{idx}")))
    }

    /// First matching case label in source order, else `default`, else the end.
    fn switch_target(&self, table: u16, scrutinee: &Value) -> Result<usize, RuntimeError> {
        let table = self
            .unit()
            .switches
            .get(usize::from(table))
            .ok_or_else(|| RuntimeError::type_mismatch("switch table", format!("#{table}")))?;
        let kind = table.kind.unwrap_or(OpKind::Other);
        for (constant, target) in &table.cases {
            let label = self.constant(*constant);
            if case_matches(scrutinee, &label, kind)? {
                return Ok(usize::from(*target));
            }
        }
        Ok(usize::from(table.default.unwrap_or(table.end)))
    }

    fn step(
        &mut self,
        stack: &mut Vec<Value>,
        locals: &mut [Value],
        slot: Slot,
        delta: i32,
        prefix: bool,
    ) -> Result<Value, RuntimeError> {
        let (old, new) = match slot {
            Slot::Local(s) => {
                let cell = locals
                    .get_mut(usize::from(s))
                    .ok_or_else(|| RuntimeError::type_mismatch("local", format!("#{s}")))?;
                let old = cell.clone();
                let new = step(&old, delta)?;
                *cell = new.clone();
                (old, new)
            }
            Slot::Global(s) => {
                let old = self.ctx.load_global(s);
                let new = step(&old, delta)?;
                self.ctx.store_global(s, new.clone());
                (old, new)
            }
            Slot::Field(index) => {
                let record = pop(stack)?;
                let old = load_field(&record, usize::from(index))?;
                let new = step(&old, delta)?;
                store_field(&record, usize::from(index), new.clone())?;
                (old, new)
            }
            Slot::Element => {
                let index = pop(stack)?;
                let container = pop(stack)?;
                let old = load_index(&container, &index)?;
                let new = step(&old, delta)?;
                store_index(&container, &index, new.clone())?;
                (old, new)
            }
        };
        Ok(if prefix { new } else { old })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dsl::compiler::compile;
    use crate::dsl::program::{CompileEnv, Program};
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

    fn build(src: &str) -> Vm {
        let env = CompileEnv::new().with_input(person()).with_output(person());
        let mut ast = parser::parse(lexer::lex(src).unwrap()).unwrap();
        let resolved = typeck::resolve(&mut ast, &env).unwrap();
        let program = Program::new(ast, resolved, &env, ExecutionMode::Compile);
        Vm::new(compile(&program).unwrap())
    }

    fn global(src: &str, name: &str) -> Value {
        let vm = build(src);
        let mut ctx = ExecutionContext::new();
        vm.run_global(&mut ctx).unwrap();
        vm.get_variable_value(&ctx, name).unwrap()
    }

    #[test]
    fn arithmetic_and_promotion() {
        assert!(matches!(global("long r = 2147483647 + 1L;", "r"), Value::Long(2_147_483_648)));
        let r = global("number r = 1 + 0.5;", "r");
        assert!(matches!(r, Value::Number(n) if (n - 1.5).abs() < f64::EPSILON));
    }

    #[test]
    fn increments_on_every_slot_kind() {
        let src = "integer[] l = [1]; integer a = 1; integer b = a++; integer c = ++a; \
                   l[0]++; integer d = l[0];";
        assert!(matches!(global(src, "b"), Value::Integer(1)));
        assert!(matches!(global(src, "c"), Value::Integer(3)));
        assert!(matches!(global(src, "d"), Value::Integer(2)));
    }

    #[test]
    fn nested_loops_break_the_inner_only() {
        let src = "integer n; for (integer i = 0; i < 3; i++) \
                   { integer j = 0; while (true) { if (j == 2) break; j++; n++; } }";
        assert!(matches!(global(src, "n"), Value::Integer(6)));
    }

    #[test]
    fn foreach_with_break_and_continue() {
        let src = "integer s; foreach (integer v : [1, 2, 3, 4, 5]) \
                   { if (v == 2) continue; if (v == 4) break; s += v; }";
        assert!(matches!(global(src, "s"), Value::Integer(4)));
    }

    #[test]
    fn switch_uses_default_when_nothing_matches() {
        let src = "string s; switch (9) { case 1: s = \"one\"; default: s = \"other\"; }";
        assert_eq!(global(src, "s").to_string(), "other");
    }

    #[test]
    fn conditional_and_short_circuit() {
        assert!(matches!(global("boolean r = true || 1 / 0 == 1;", "r"), Value::Boolean(true)));
        let r = global("number r = false ? 1 : 2.5;", "r");
        assert!(matches!(r, Value::Number(n) if (n - 2.5).abs() < f64::EPSILON));
    }

    #[test]
    fn functions_read_and_write_ports() {
        let vm = build(
            "function integer transform() \
             { $out.0.name = $in.0.name; $out.0.age = $in.0.age + 1; return 0; }",
        );
        let input = Record::new_ref(person());
        input.borrow_mut().set(0, Value::String("Ann".into())).unwrap();
        input.borrow_mut().set(1, Value::Integer(41)).unwrap();
        let output = Record::new_ref(person());
        let mut ctx = ExecutionContext::new();
        vm.run_global(&mut ctx).unwrap();
        let function = vm.find_function("transform", &[]).unwrap();
        let status = vm
            .execute_function(&mut ctx, function, Vec::new(), &[input], &[output.clone()])
            .unwrap();
        assert!(matches!(status, Value::Integer(0)));
        assert!(matches!(output.borrow().get(1), Some(Value::Integer(42))));
    }

    #[test]
    fn errors_carry_the_call_chain() {
        let vm = build(
            "function integer inner() { return 1 / 0; } \
             function integer outer() { return inner(); }",
        );
        let mut ctx = ExecutionContext::new();
        let function = vm.find_function("outer", &[]).unwrap();
        let err = vm.execute_function(&mut ctx, function, Vec::new(), &[], &[]).unwrap_err();
        assert_eq!(err.stack_trace().lines().count(), 3);
        assert!(matches!(err.root(), RuntimeError::DivisionByZero));
    }

    #[test]
    fn runaway_recursion_is_stopped() {
        let vm = build("function integer down(integer n) { return down(n + 1); }");
        let mut ctx = ExecutionContext::new().with_max_call_depth(32);
        let function = vm.find_function("down", &[CtlType::Integer]).unwrap();
        let err = vm
            .execute_function(&mut ctx, function, vec![Value::Integer(0)], &[], &[])
            .unwrap_err();
        assert!(matches!(err.root(), RuntimeError::StackOverflow(32)));
    }
}
