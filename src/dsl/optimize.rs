use std::collections::HashSet;

use super::ast::*;
use super::compiler::{CompiledFunction, CompiledUnit, Op, SwitchTable};
use super::context::binary;
use crate::model::value::negate;
use crate::model::{OpKind, Value};

// ── Pass 1: Constant Folding on the resolved AST ──────────────────

/// Replace operator nodes whose operands are all non-null literals with
/// the literal they evaluate to. Returns the number of folded nodes.
///
/// Expressions that would fail at run time (division by zero, overflow)
/// are left alone so the error surfaces where the program runs.
pub fn fold_constants(ast: &mut Ast) -> usize {
    match ast.root() {
        Some(root) => fold_node(ast, root),
        None => 0,
    }
}

fn fold_node(ast: &mut Ast, id: NodeId) -> usize {
    let mut folded = 0;
    for child in ast.children(id).to_vec() {
        folded += fold_node(ast, child);
    }
    let Some(lit) = fold_value(ast, id) else {
        return folded;
    };
    let node = ast.node_mut(id);
    node.kind = NodeKind::Literal(lit);
    node.children.clear();
    node.resolution = Resolution::Unresolved;
    folded + 1
}

fn fold_value(ast: &Ast, id: NodeId) -> Option<Literal> {
    let operand = |index: usize| match ast.child(id, index).map(|c| ast.kind(c)) {
        Some(NodeKind::Literal(lit)) if *lit != Literal::Null => Some(lit.to_value()),
        _ => None,
    };
    let kind = match ast.resolution(id) {
        Resolution::Operands(kind) => kind,
        _ => OpKind::Other,
    };
    let value = match ast.kind(id) {
        NodeKind::Binary { op } if !matches!(op, BinaryOp::And | BinaryOp::Or) => {
            binary(*op, &operand(0)?, &operand(1)?, kind).ok()?
        }
        NodeKind::Unary { op: UnaryOp::Neg } => negate(&operand(0)?, kind).ok()?,
        NodeKind::Unary { op: UnaryOp::Not } => Value::Boolean(!operand(0)?.as_bool().ok()?),
        _ => return None,
    };
    Literal::from_value(&value.coerce_to(ast.ty(id)).ok()?)
}

// ── Pass 2: Peephole Optimization on bytecode ─────────────────────

/// Rewrite short op patterns in every chunk until nothing changes.
pub fn peephole(unit: &mut CompiledUnit) {
    peephole_chunk(&mut unit.global, &mut unit.switches);
    for function in &mut unit.functions {
        peephole_chunk(function, &mut unit.switches);
    }
}

fn peephole_chunk(chunk: &mut CompiledFunction, switches: &mut [SwitchTable]) {
    loop {
        let (ops, map, changed) = peephole_pass(&chunk.ops, switches);
        if !changed {
            break;
        }
        fixup_jumps(&chunk.ops, &ops, &map, switches);
        chunk.ops = remap_ops(ops, &map);
    }
}

/// Offsets some op or switch table may jump to.
fn jump_targets(ops: &[Op], switches: &[SwitchTable]) -> HashSet<usize> {
    let mut targets = HashSet::new();
    for op in ops {
        match op {
            Op::Jump(t) | Op::JumpIfFalse(t) | Op::JumpIfTrue(t) | Op::IterNext(t) => {
                targets.insert(usize::from(*t));
            }
            Op::Switch(n) => {
                if let Some(table) = switches.get(usize::from(*n)) {
                    targets.extend(table.cases.iter().map(|(_, t)| usize::from(*t)));
                    targets.extend(table.default.map(usize::from));
                    targets.insert(usize::from(table.end));
                }
            }
            _ => {}
        }
    }
    targets
}

/// Single pass. Returns the new ops (jump operands still in old offsets),
/// the old → new offset map, and whether anything changed.
fn peephole_pass(ops: &[Op], switches: &[SwitchTable]) -> (Vec<Op>, Vec<usize>, bool) {
    let targets = jump_targets(ops, switches);
    let untargeted = |i: usize| !targets.contains(&i);
    let mut result = Vec::with_capacity(ops.len());
    let mut map = vec![0; ops.len() + 1];
    let mut changed = false;
    let mut i = 0;

    while i < ops.len() {
        map[i] = result.len();
        let next = ops.get(i + 1).copied();
        let after = ops.get(i + 2).copied();

        // Pattern: Dup, Store*, Pop → Store* (assignment used as a statement)
        if let (Op::Dup, Some(store @ (Op::StoreLocal(_) | Op::StoreGlobal(_))), Some(Op::Pop)) =
            (ops[i], next, after)
        {
            if untargeted(i + 1) && untargeted(i + 2) {
                map[i + 1] = result.len();
                map[i + 2] = result.len() + 1;
                result.push(store);
                changed = true;
                i += 3;
                continue;
            }
        }

        // Pattern: Not, JumpIfFalse(t) → JumpIfTrue(t), and the reverse
        if let (Op::Not, Some(jump @ (Op::JumpIfFalse(_) | Op::JumpIfTrue(_)))) = (ops[i], next) {
            if untargeted(i + 1) {
                map[i + 1] = result.len();
                result.push(match jump {
                    Op::JumpIfFalse(t) => Op::JumpIfTrue(t),
                    Op::JumpIfTrue(t) => Op::JumpIfFalse(t),
                    other => other,
                });
                changed = true;
                i += 2;
                continue;
            }
        }

        // Pattern: Jump to the next op → removed
        if let Op::Jump(t) = ops[i] {
            if usize::from(t) == i + 1 {
                changed = true;
                i += 1;
                continue;
            }
        }

        result.push(ops[i]);
        i += 1;
    }
    map[ops.len()] = result.len();
    (result, map, changed)
}

fn remap(map: &[usize], target: u16) -> u16 {
    map.get(usize::from(target))
        .and_then(|t| u16::try_from(*t).ok())
        .unwrap_or(target)
}

/// Move switch-table targets of this chunk from old to new offsets.
fn fixup_jumps(old_ops: &[Op], new_ops: &[Op], map: &[usize], switches: &mut [SwitchTable]) {
    let tables: HashSet<u16> = old_ops
        .iter()
        .chain(new_ops)
        .filter_map(|op| if let Op::Switch(n) = op { Some(*n) } else { None })
        .collect();
    for n in tables {
        if let Some(table) = switches.get_mut(usize::from(n)) {
            for (_, target) in &mut table.cases {
                *target = remap(map, *target);
            }
            table.default = table.default.map(|t| remap(map, t));
            table.end = remap(map, table.end);
        }
    }
}

fn remap_ops(ops: Vec<Op>, map: &[usize]) -> Vec<Op> {
    ops.into_iter()
        .map(|op| match op {
            Op::Jump(t) => Op::Jump(remap(map, t)),
            Op::JumpIfFalse(t) => Op::JumpIfFalse(remap(map, t)),
            Op::JumpIfTrue(t) => Op::JumpIfTrue(remap(map, t)),
            Op::IterNext(t) => Op::IterNext(remap(map, t)),
            other => other,
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dsl::compiler::compile;
    use crate::dsl::context::ExecutionContext;
    use crate::dsl::program::{CompileEnv, Program};
    use crate::dsl::vm::Vm;
    use crate::dsl::{lexer, parser, typeck, ExecutionMode, TransformProgram};

    fn program(src: &str) -> Program {
        let env = CompileEnv::new();
        let mut ast = parser::parse(lexer::lex(src).unwrap()).unwrap();
        let resolved = typeck::resolve(&mut ast, &env).unwrap();
        fold_constants(&mut ast);
        Program::new(ast, resolved, &env, ExecutionMode::Compile)
    }

    fn optimized(src: &str) -> CompiledUnit {
        let mut unit = compile(&program(src)).unwrap();
        peephole(&mut unit);
        unit
    }

    fn run(src: &str, name: &str) -> Value {
        let vm = Vm::new(optimized(src));
        let mut ctx = ExecutionContext::new();
        vm.run_global(&mut ctx).unwrap();
        vm.get_variable_value(&ctx, name).unwrap()
    }

    #[test]
    fn folds_literal_arithmetic() {
        let unit = optimized("integer x = 2 * 3 + 1;");
        assert!(!unit.global.ops.iter().any(|op| matches!(op, Op::Arith(..))));
        assert!(unit.constants.contains(&Literal::Integer(7)));
    }

    #[test]
    fn folding_keeps_promoted_types() {
        assert!(matches!(run("long x = 2147483647 + 1L;", "x"), Value::Long(2_147_483_648)));
        assert_eq!(run("string s = \"a\" + 1;", "s").to_string(), "a1");
    }

    #[test]
    fn no_fold_for_failing_expressions() {
        let unit = optimized("integer x = 1 / 0;");
        assert!(unit.global.ops.iter().any(|op| matches!(op, Op::Arith(..))));
    }

    #[test]
    fn no_fold_for_variables() {
        let unit = optimized("integer a = 1; integer b = a + 2;");
        assert!(unit.global.ops.iter().any(|op| matches!(op, Op::Arith(..))));
    }

    #[test]
    fn assignment_statements_drop_dup_and_pop() {
        let unit = optimized("integer a; a = 5;");
        assert!(!unit.global.ops.contains(&Op::Dup));
    }

    #[test]
    fn negated_conditions_jump_directly() {
        let unit = optimized("boolean b; integer n; if (!b) n = 1;");
        assert!(!unit.global.ops.contains(&Op::Not));
        assert!(matches!(run("boolean b; integer n; if (!b) n = 1;", "n"), Value::Integer(1)));
    }

    #[test]
    fn jumps_survive_rewrites() {
        let src = "integer n; for (integer i = 0; i < 5; i = i + 1) \
                   { switch (i) { case 1: n = n + 10; break; default: n = n + 1; } }";
        assert!(matches!(run(src, "n"), Value::Integer(14)));
    }
}
