//! Semantic analysis: scopes, overload resolution and type checking.
//!
//! The resolver annotates the AST in place. Every expression node gets its
//! static type and every name, call, field and operator gets a
//! [`Resolution`] the back-ends dispatch on. Compound assignments are
//! rewritten to plain ones here.

use std::collections::HashMap;

use super::ast::*;
use super::builtins;
use super::error::CompileError;
use super::program::{CompileEnv, Resolved, SequenceRef};
use super::scope::{
    best_overload, format_arg_types, signature_distance, FunctionInfo, OverloadMatch, ScopeError,
    ScopeStack, SymbolTable,
};
use crate::model::types::{is_assignable, promote};
use crate::model::{CtlType, MapKey, OpKind, Value};

/// Resolve and type-check the program rooted at `ast.root()`.
pub fn resolve(ast: &mut Ast, env: &CompileEnv) -> Result<Resolved, Vec<CompileError>> {
    let Some(root) = ast.root() else {
        return Ok(Resolved::default());
    };
    let mut resolver = Resolver::new(ast, env);
    resolver.run(root);
    if resolver.errors.is_empty() {
        Ok(Resolved {
            symbols: resolver.symbols,
            global_code: resolver.global_code,
            sequences: resolver.sequences,
            lookups: resolver.lookups,
        })
    } else {
        Err(resolver.errors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Callee {
    User(usize),
    Builtin(usize),
}

struct Resolver<'a> {
    ast: &'a mut Ast,
    env: &'a CompileEnv,
    symbols: SymbolTable,
    scopes: ScopeStack,
    errors: Vec<CompileError>,
    global_code: Vec<NodeId>,
    sequences: Vec<SequenceRef>,
    lookups: Vec<String>,
    loop_depth: u32,
    switch_depth: u32,
    /// Declared return type of the function being checked.
    return_type: Option<CtlType>,
}

fn unify(a: &CtlType, b: &CtlType) -> Option<CtlType> {
    if a.is_wildcard() {
        return Some(b.clone());
    }
    if b.is_wildcard() || a == b {
        return Some(a.clone());
    }
    promote(a, b)
}

impl<'a> Resolver<'a> {
    fn new(ast: &'a mut Ast, env: &'a CompileEnv) -> Self {
        Self {
            ast,
            env,
            symbols: SymbolTable::default(),
            scopes: ScopeStack::new(),
            errors: Vec::new(),
            global_code: Vec::new(),
            sequences: Vec::new(),
            lookups: Vec::new(),
            loop_depth: 0,
            switch_depth: 0,
            return_type: None,
        }
    }

    fn error(&mut self, message: impl Into<String>, id: NodeId) {
        let span = self.ast.span(id);
        self.errors.push(CompileError::type_error(message, span));
    }

    fn annotate(&mut self, id: NodeId, ty: CtlType, resolution: Resolution) -> CtlType {
        let node = self.ast.node_mut(id);
        node.ty = ty.clone();
        node.resolution = resolution;
        ty
    }

    fn set_type(&mut self, id: NodeId, ty: CtlType) -> CtlType {
        self.ast.node_mut(id).ty = ty.clone();
        ty
    }

    fn run(&mut self, root: NodeId) {
        let mut functions = Vec::new();
        let mut statements = Vec::new();
        self.collect_items(root, &mut functions, &mut statements);

        for id in &functions {
            self.register_function(*id);
        }
        self.report_duplicate_functions();

        for id in statements {
            self.check_stmt(id);
            self.global_code.push(id);
        }

        for (index, id) in functions.into_iter().enumerate() {
            self.check_function_body(index, id);
        }
    }

    /// Split top-level items into functions and global statements, looking
    /// through imports.
    fn collect_items(
        &self,
        container: NodeId,
        functions: &mut Vec<NodeId>,
        statements: &mut Vec<NodeId>,
    ) {
        for item in self.ast.children(container) {
            match self.ast.kind(*item) {
                NodeKind::Import { .. } => self.collect_items(*item, functions, statements),
                NodeKind::FunctionDeclaration { .. } => functions.push(*item),
                _ => statements.push(*item),
            }
        }
    }

    // ── Types ─────────────────────────────────────────────────────

    fn resolve_type(&mut self, ty: &TypeRef, at: NodeId) -> CtlType {
        match ty {
            TypeRef::Void => CtlType::Void,
            TypeRef::Integer => CtlType::Integer,
            TypeRef::Long => CtlType::Long,
            TypeRef::Number => CtlType::Number,
            TypeRef::Decimal => CtlType::Decimal,
            TypeRef::String => CtlType::String,
            TypeRef::Boolean => CtlType::Boolean,
            TypeRef::Date => CtlType::Date,
            TypeRef::List(elem) => CtlType::list_of(self.resolve_type(elem, at)),
            TypeRef::Map(key, value) => {
                let key = self.resolve_type(key, at);
                if !key.is_scalar() && key != CtlType::Unknown {
                    self.error(format!("Map key type must be a scalar type, not '{key}'"), at);
                }
                CtlType::map_of(key, self.resolve_type(value, at))
            }
            TypeRef::Named(name) => match self.env.record_type(name).cloned() {
                Some(meta) => CtlType::Record(meta),
                None => {
                    self.error(format!("Unknown type '{name}'"), at);
                    CtlType::Unknown
                }
            },
        }
    }

    /// True when `value` may be stored into a `target` slot. List and map
    /// literals take on the target's element types when every element fits.
    fn fits(&mut self, value: NodeId, target: &CtlType) -> bool {
        let kind = self.ast.kind(value).clone();
        let literal = matches!(kind, NodeKind::ListLiteral | NodeKind::MapLiteral);
        if is_assignable(target, self.ast.ty(value)) {
            if literal && !target.is_wildcard() && *target != CtlType::Any {
                self.set_type(value, target.clone());
            }
            return true;
        }
        let children = self.ast.children(value).to_vec();
        let fits = match (&kind, target) {
            (NodeKind::ListLiteral, CtlType::List(elem)) => {
                children.iter().all(|c| self.fits(*c, elem))
            }
            (NodeKind::MapLiteral, CtlType::Map(key, val)) => children
                .iter()
                .enumerate()
                .all(|(i, c)| if i % 2 == 0 { self.fits(*c, key) } else { self.fits(*c, val) }),
            _ => false,
        };
        if fits {
            self.set_type(value, target.clone());
        }
        fits
    }

    fn expect_type(&mut self, value: NodeId, target: &CtlType) {
        let found = self.ast.ty(value).clone();
        if found == CtlType::Unknown || target == &CtlType::Unknown {
            return;
        }
        if !self.fits(value, target) {
            self.error(
                format!("Type mismatch: cannot convert from '{found}' to '{target}'"),
                value,
            );
        }
    }

    fn expect_boolean(&mut self, cond: NodeId) {
        let ty = self.check_expr(cond);
        if ty != CtlType::Boolean && !ty.is_wildcard() {
            self.error(format!("Condition must be boolean, found '{ty}'"), cond);
        }
    }

    // ── Functions ─────────────────────────────────────────────────

    fn register_function(&mut self, id: NodeId) {
        let NodeKind::FunctionDeclaration { name, return_type } = self.ast.kind(id).clone() else {
            return;
        };
        let ret = self.resolve_type(&return_type, id);
        let mut params = Vec::new();
        if let Some(list) = self.ast.child(id, 0) {
            for param in self.ast.children(list).to_vec() {
                if let NodeKind::VariableDeclaration { ty, name: pname } =
                    self.ast.kind(param).clone()
                {
                    let pty = self.resolve_type(&ty, param);
                    if pty == CtlType::Void {
                        self.error(format!("Parameter '{pname}' cannot be void"), param);
                    }
                    self.set_type(param, pty.clone());
                    params.push(pty);
                }
            }
        }
        let index = self.symbols.functions.len();
        self.annotate(id, ret.clone(), Resolution::Function(index));
        self.symbols.functions.push(FunctionInfo {
            name,
            params,
            ret,
            node: id,
            local_count: 0,
        });
    }

    fn report_duplicate_functions(&mut self) {
        let mut seen: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, f) in self.symbols.functions.iter().enumerate() {
            let key = format!("{}({})", f.name, format_arg_types(&f.params));
            seen.entry(key).or_default().push(i);
        }
        let mut duplicates: Vec<usize> =
            seen.into_values().filter(|v| v.len() > 1).flatten().collect();
        duplicates.sort_unstable();
        for i in duplicates {
            if let Some(f) = self.symbols.functions.get(i).cloned() {
                self.error(format!("Duplicate function '{f}'"), f.node);
            }
        }
    }

    fn check_function_body(&mut self, index: usize, id: NodeId) {
        let Some(info) = self.symbols.functions.get(index).cloned() else {
            return;
        };
        self.scopes.push_function();
        self.return_type = Some(info.ret.clone());
        self.loop_depth = 0;
        self.switch_depth = 0;

        if let Some(list) = self.ast.child(id, 0) {
            for param in self.ast.children(list).to_vec() {
                self.declare(param);
            }
        }
        if let Some(body) = self.ast.child(id, 1) {
            for stmt in self.ast.children(body).to_vec() {
                self.check_stmt(stmt);
            }
        }

        if let Some(f) = self.symbols.functions.get_mut(index) {
            f.local_count = self.scopes.local_count();
        }
        self.return_type = None;
        self.scopes.pop();
    }

    /// Bind a `VariableDeclaration` node's name in the innermost scope.
    /// The node's type must already be set.
    fn declare(&mut self, decl: NodeId) {
        let NodeKind::VariableDeclaration { name, .. } = self.ast.kind(decl).clone() else {
            return;
        };
        let ty = self.ast.ty(decl).clone();
        match self.scopes.declare(&name, ty, &mut self.symbols.globals) {
            Ok(resolution) => self.ast.node_mut(decl).resolution = resolution,
            Err(ScopeError::AlreadyDefined) => {
                self.error(format!("Variable '{name}' is already defined"), decl);
            }
            Err(ScopeError::TooManyLocals) => {
                let span = self.ast.span(decl);
                self.errors.push(CompileError::compiler("Too many local variables", span));
            }
        }
    }

    // ── Statements ────────────────────────────────────────────────

    fn check_stmt(&mut self, id: NodeId) {
        let kind = self.ast.kind(id).clone();
        let children = self.ast.children(id).to_vec();
        match kind {
            NodeKind::VariableDeclaration { name, ty } => {
                let ty = self.resolve_type(&ty, id);
                if ty == CtlType::Void {
                    self.error(format!("Variable '{name}' cannot be void"), id);
                }
                if let Some(init) = children.first() {
                    self.check_expr(*init);
                    self.expect_type(*init, &ty);
                }
                self.set_type(id, ty);
                self.declare(id);
            }
            NodeKind::Block => {
                self.scopes.push();
                for stmt in children {
                    self.check_stmt(stmt);
                }
                self.scopes.pop();
            }
            NodeKind::Empty => {}
            NodeKind::If => {
                if let Some(cond) = children.first() {
                    self.expect_boolean(*cond);
                }
                for branch in children.iter().skip(1) {
                    self.check_scoped(*branch);
                }
            }
            NodeKind::While => {
                if let [cond, body] = children.as_slice() {
                    self.expect_boolean(*cond);
                    self.check_loop_body(*body);
                }
            }
            NodeKind::DoWhile => {
                if let [body, cond] = children.as_slice() {
                    self.check_loop_body(*body);
                    self.expect_boolean(*cond);
                }
            }
            NodeKind::For => {
                if let [init, cond, update, body] = children.as_slice() {
                    self.scopes.push();
                    self.check_stmt(*init);
                    if !matches!(self.ast.kind(*cond), NodeKind::Empty) {
                        self.expect_boolean(*cond);
                    }
                    if !matches!(self.ast.kind(*update), NodeKind::Empty) {
                        self.check_expr(*update);
                    }
                    self.check_loop_body(*body);
                    self.scopes.pop();
                }
            }
            NodeKind::Foreach => self.check_foreach(id, &children),
            NodeKind::Switch => self.check_switch(id, &children),
            NodeKind::Case { .. } => self.error("Case label outside of switch", id),
            NodeKind::Break => {
                if self.loop_depth == 0 && self.switch_depth == 0 {
                    self.error("Break statement outside of loop or switch", id);
                }
            }
            NodeKind::Continue => {
                if self.loop_depth == 0 {
                    self.error("Continue statement outside of loop", id);
                }
            }
            NodeKind::Return => self.check_return(id, children.first().copied()),
            NodeKind::Import { .. }
            | NodeKind::FunctionDeclaration { .. }
            | NodeKind::Start
            | NodeKind::Parameters => {
                self.error("Declaration is only allowed at top level", id);
            }
            _ => {
                self.check_expr(id);
            }
        }
    }

    /// A branch or loop body gets its own scope even when it is a single
    /// statement.
    fn check_scoped(&mut self, id: NodeId) {
        self.scopes.push();
        self.check_stmt(id);
        self.scopes.pop();
    }

    fn check_loop_body(&mut self, body: NodeId) {
        self.loop_depth += 1;
        self.check_scoped(body);
        self.loop_depth -= 1;
    }

    fn check_return(&mut self, id: NodeId, value: Option<NodeId>) {
        let Some(expected) = self.return_type.clone() else {
            self.error("Return statement outside of function", id);
            if let Some(v) = value {
                self.check_expr(v);
            }
            return;
        };
        match value {
            Some(v) => {
                self.check_expr(v);
                if expected == CtlType::Void {
                    self.error("Cannot return a value from a void function", v);
                } else {
                    self.expect_type(v, &expected);
                }
            }
            None if expected != CtlType::Void => {
                self.error(format!("Missing return value of type '{expected}'"), id);
            }
            None => {}
        }
    }

    fn check_foreach(&mut self, id: NodeId, children: &[NodeId]) {
        let [decl, iterable, body] = children else {
            return;
        };
        self.scopes.push();
        let collection = self.check_expr(*iterable);
        let NodeKind::VariableDeclaration { ty, .. } = self.ast.kind(*decl).clone() else {
            self.scopes.pop();
            return;
        };
        let var_ty = self.resolve_type(&ty, *decl);
        self.set_type(*decl, var_ty.clone());
        match &collection {
            CtlType::List(elem) | CtlType::Map(_, elem) => {
                if !elem.is_wildcard() && !is_assignable(&var_ty, elem) {
                    self.error(
                        format!("Type mismatch: cannot convert from '{elem}' to '{var_ty}'"),
                        *decl,
                    );
                }
            }
            CtlType::Record(_) => {
                if !var_ty.is_scalar() {
                    self.error(format!("Record fields cannot be iterated as '{var_ty}'"), *decl);
                }
            }
            CtlType::Unknown => {}
            other => self.error(format!("Cannot iterate over '{other}'"), *iterable),
        }
        self.set_type(id, collection);
        self.declare(*decl);
        self.check_loop_body(*body);
        self.scopes.pop();
    }

    fn check_switch(&mut self, id: NodeId, children: &[NodeId]) {
        let Some((scrutinee, arms)) = children.split_first() else {
            return;
        };
        let mut switch_ty = self.check_expr(*scrutinee);
        if !switch_ty.is_scalar() && !switch_ty.is_wildcard() {
            self.error(format!("Cannot switch on '{switch_ty}'"), *scrutinee);
        }
        let mut labels: Vec<(NodeId, Value)> = Vec::new();
        let mut defaults = Vec::new();

        self.switch_depth += 1;
        self.scopes.push();
        for arm in arms {
            match self.ast.kind(*arm).clone() {
                NodeKind::Case { is_default: true } => defaults.push(*arm),
                NodeKind::Case { is_default: false } => {
                    let Some(label) = self.ast.child(*arm, 0) else {
                        continue;
                    };
                    let label_ty = self.check_expr(label);
                    let NodeKind::Literal(lit) = self.ast.kind(label).clone() else {
                        self.error("Case label must be a literal", label);
                        continue;
                    };
                    match unify(&switch_ty, &label_ty) {
                        Some(ty) => switch_ty = ty,
                        None => self.error(
                            format!(
                                "Case label of type '{label_ty}' does not match switch type \
                                 '{switch_ty}'"
                            ),
                            label,
                        ),
                    }
                    labels.push((*arm, lit.to_value()));
                }
                _ => self.check_stmt(*arm),
            }
        }
        self.scopes.pop();
        self.switch_depth -= 1;

        // Labels compare after promotion, so `case 5:` and `case 5L:` collide
        // on a long switch.
        let mut by_key: HashMap<MapKey, Vec<NodeId>> = HashMap::new();
        for (arm, value) in labels {
            let value = value.clone().coerce_to(&switch_ty).unwrap_or(value);
            if let Ok(key) = MapKey::from_value(&value) {
                by_key.entry(key).or_default().push(arm);
            }
        }
        let mut duplicates: Vec<NodeId> =
            by_key.into_values().filter(|arms| arms.len() > 1).flatten().collect();
        duplicates.sort_unstable();
        for arm in duplicates {
            self.error("Duplicate case", arm);
        }
        if defaults.len() > 1 {
            for arm in defaults {
                self.error("Duplicate default", arm);
            }
        }
        let kind = switch_ty.op_kind();
        self.annotate(id, switch_ty, Resolution::Operands(kind));
    }

    // ── Expressions ───────────────────────────────────────────────

    fn check_expr(&mut self, id: NodeId) -> CtlType {
        let kind = self.ast.kind(id).clone();
        let children = self.ast.children(id).to_vec();
        match kind {
            NodeKind::Literal(lit) => self.set_type(id, lit.ctl_type()),
            NodeKind::ListLiteral => {
                let mut elem = CtlType::Null;
                for item in &children {
                    let ty = self.check_expr(*item);
                    match unify(&elem, &ty) {
                        Some(t) => elem = t,
                        None => self.error(
                            format!("List element of type '{ty}' does not match '{elem}'"),
                            *item,
                        ),
                    }
                }
                self.set_type(id, CtlType::list_of(elem))
            }
            NodeKind::MapLiteral => {
                let (mut key, mut value) = (CtlType::Null, CtlType::Null);
                for (i, item) in children.iter().enumerate() {
                    let ty = self.check_expr(*item);
                    let slot = if i % 2 == 0 { &mut key } else { &mut value };
                    match unify(slot, &ty) {
                        Some(t) => *slot = t,
                        None => {
                            let expected = slot.clone();
                            self.error(
                                format!("Map entry of type '{ty}' does not match '{expected}'"),
                                *item,
                            );
                        }
                    }
                }
                self.set_type(id, CtlType::map_of(key, value))
            }
            NodeKind::Identifier { name } => match self.scopes.lookup(&name).cloned() {
                Some(symbol) => self.annotate(id, symbol.ty, symbol.resolution),
                None => {
                    self.error(format!("Variable '{name}' is not declared"), id);
                    CtlType::Unknown
                }
            },
            NodeKind::Assignment { op } => self.check_assignment(id, op),
            NodeKind::Binary { op } => self.check_binary(id, op, &children),
            NodeKind::Unary { op } => {
                let Some(operand) = children.first() else {
                    return CtlType::Unknown;
                };
                let ty = self.check_expr(*operand);
                match op {
                    UnaryOp::Neg if ty.is_numeric() => {
                        let kind = ty.op_kind();
                        self.annotate(id, ty, Resolution::Operands(kind))
                    }
                    UnaryOp::Not if ty == CtlType::Boolean => self.set_type(id, ty),
                    _ if ty.is_wildcard() => self.set_type(id, ty),
                    _ => {
                        let symbol = if op == UnaryOp::Neg { "-" } else { "!" };
                        self.error(
                            format!("Operator '{symbol}' is not defined for type '{ty}'"),
                            id,
                        );
                        CtlType::Unknown
                    }
                }
            }
            NodeKind::IncDec { .. } => {
                let Some(operand) = children.first() else {
                    return CtlType::Unknown;
                };
                let ty = self.check_lvalue(*operand);
                if !ty.is_numeric() && ty != CtlType::Unknown {
                    self.error(format!("Increment requires a numeric variable, found '{ty}'"), id);
                }
                let kind = ty.op_kind();
                self.annotate(id, ty, Resolution::Operands(kind))
            }
            NodeKind::Conditional => {
                let [cond, then_branch, else_branch] = children.as_slice() else {
                    return CtlType::Unknown;
                };
                self.expect_boolean(*cond);
                let a = self.check_expr(*then_branch);
                let b = self.check_expr(*else_branch);
                match unify(&a, &b) {
                    Some(ty) => self.set_type(id, ty),
                    None if is_assignable(&a, &b) => self.set_type(id, a),
                    None => {
                        self.error(
                            format!("Conditional branches have incompatible types '{a}' and '{b}'"),
                            id,
                        );
                        CtlType::Unknown
                    }
                }
            }
            NodeKind::Call { name } => self.check_call(id, &name, &children),
            NodeKind::Port { dir, port } => self.check_port(id, dir, &port),
            NodeKind::Member { field } => self.check_member(id, &field, &children),
            NodeKind::Index => self.check_index(id, &children),
            NodeKind::Sequence { name, ty, op } => self.check_sequence(id, name, ty.as_ref(), op),
            NodeKind::Lookup { name, op } => self.check_lookup(id, &name, op, &children),
            NodeKind::Empty => CtlType::Void,
            other => {
                self.error(format!("{} is not an expression", other.name()), id);
                CtlType::Unknown
            }
        }
    }

    fn check_binary(&mut self, id: NodeId, op: BinaryOp, children: &[NodeId]) -> CtlType {
        let [lhs, rhs] = children else {
            return CtlType::Unknown;
        };
        let l = self.check_expr(*lhs);
        let r = self.check_expr(*rhs);
        if l == CtlType::Unknown || r == CtlType::Unknown {
            return self.set_type(id, CtlType::Unknown);
        }
        let mismatch = |this: &mut Self| {
            this.error(
                format!("Operator '{}' is not defined for types '{l}' and '{r}'", op.symbol()),
                id,
            );
            CtlType::Unknown
        };
        match op {
            BinaryOp::And | BinaryOp::Or => {
                let ok = |t: &CtlType| *t == CtlType::Boolean || t.is_wildcard();
                if ok(&l) && ok(&r) {
                    self.set_type(id, CtlType::Boolean)
                } else {
                    mismatch(self)
                }
            }
            BinaryOp::Add if l == CtlType::String || r == CtlType::String => {
                let concatenable = |t: &CtlType| t.is_scalar() || t.is_wildcard();
                if concatenable(&l) && concatenable(&r) {
                    self.annotate(id, CtlType::String, Resolution::Operands(OpKind::String))
                } else {
                    mismatch(self)
                }
            }
            BinaryOp::Add
                if matches!(
                    (&l, &r),
                    (CtlType::List(_), CtlType::List(_)) | (CtlType::Map(..), CtlType::Map(..))
                ) =>
            {
                if is_assignable(&l, &r) {
                    self.annotate(id, l.clone(), Resolution::Operands(OpKind::Other))
                } else {
                    mismatch(self)
                }
            }
            _ if op.arith().is_some() => match unify(&l, &r) {
                Some(ty) if ty.is_numeric() => {
                    let kind = ty.op_kind();
                    self.annotate(id, ty, Resolution::Operands(kind))
                }
                _ => mismatch(self),
            },
            _ => {
                let equality = matches!(op, BinaryOp::Eq | BinaryOp::Ne);
                let operand = match unify(&l, &r) {
                    Some(ty) if ty.is_scalar() || equality => Some(ty),
                    _ if equality && is_assignable(&l, &r) => Some(l.clone()),
                    _ => None,
                };
                match operand {
                    Some(ty) => {
                        self.annotate(id, CtlType::Boolean, Resolution::Operands(ty.op_kind()))
                    }
                    None => mismatch(self),
                }
            }
        }
    }

    /// Type of an assignable expression; rejects anything else.
    fn check_lvalue(&mut self, id: NodeId) -> CtlType {
        match self.ast.kind(id) {
            NodeKind::Identifier { .. } | NodeKind::Index => {}
            NodeKind::Member { .. } if self.rooted_at_input(id) => {
                self.error("Cannot assign to a field of an input record", id);
            }
            NodeKind::Member { .. } => {}
            _ => {
                self.error("Invalid assignment target", id);
            }
        }
        self.check_expr(id)
    }

    fn rooted_at_input(&self, mut id: NodeId) -> bool {
        loop {
            match self.ast.kind(id) {
                NodeKind::Port { dir, .. } => return *dir == PortDir::Input,
                NodeKind::Member { .. } | NodeKind::Index => match self.ast.child(id, 0) {
                    Some(inner) => id = inner,
                    None => return false,
                },
                _ => return false,
            }
        }
    }

    fn check_assignment(&mut self, id: NodeId, op: AssignOp) -> CtlType {
        if let Some(binary) = op.binary() {
            self.desugar_compound(id, binary);
        }
        let (Some(lhs), Some(rhs)) = (self.ast.child(id, 0), self.ast.child(id, 1)) else {
            return CtlType::Unknown;
        };
        let target = self.check_lvalue(lhs);
        let value = self.check_expr(rhs);
        if matches!(self.ast.kind(lhs), NodeKind::Member { field: FieldSel::Star }) {
            if !value.is_record() && !value.is_wildcard() {
                self.error(format!("Type mismatch: cannot copy fields from '{value}'"), rhs);
            }
            return self.annotate(id, target, Resolution::RecordCopy);
        }
        if value == CtlType::Void {
            self.error("Type mismatch: cannot convert from 'void'", rhs);
        } else {
            self.expect_type(rhs, &target);
        }
        self.set_type(id, target)
    }

    /// Rewrite `a op= b` into `a = a op b` with an independent copy of `a`.
    fn desugar_compound(&mut self, id: NodeId, op: BinaryOp) {
        let span = self.ast.span(id);
        let (Some(lhs), Some(rhs)) = (self.ast.child(id, 0), self.ast.child(id, 1)) else {
            return;
        };
        let copy = match self.ast.duplicate(lhs) {
            Ok(copy) => copy,
            Err(e) => {
                self.errors.push(CompileError::compiler(e.to_string(), span));
                return;
            }
        };
        let binary = self.ast.add(NodeKind::Binary { op }, span);
        if self.ast.replace_child(id, 1, binary).is_err() {
            return;
        }
        self.ast.push_child(binary, copy);
        self.ast.push_child(binary, rhs);
        self.ast.node_mut(id).kind = NodeKind::Assignment { op: AssignOp::Set };
    }

    fn check_call(&mut self, id: NodeId, name: &str, args: &[NodeId]) -> CtlType {
        if matches!(name, "dateAdd" | "dateDiff") {
            if let Some(unit) = args.last() {
                self.date_unit_to_literal(*unit);
            }
        }
        let arg_types: Vec<CtlType> = args.iter().map(|a| self.check_expr(*a)).collect();
        if arg_types.contains(&CtlType::Unknown) {
            return self.set_type(id, CtlType::Unknown);
        }
        let users = self
            .symbols
            .functions_named(name)
            .map(|(i, f)| (Callee::User(i), signature_distance(&f.params, &arg_types)));
        let natives =
            builtins::candidates(name).map(|(i, b)| (Callee::Builtin(i), b.distance(&arg_types)));
        let candidates: Vec<(Callee, Option<u32>)> = users.chain(natives).collect();
        match best_overload(candidates) {
            OverloadMatch::Unique(Callee::User(index)) => {
                let ret =
                    self.symbols.functions.get(index).map_or(CtlType::Unknown, |f| f.ret.clone());
                self.annotate(id, ret, Resolution::Function(index))
            }
            OverloadMatch::Unique(Callee::Builtin(index)) => {
                let ret = builtins::BUILTINS
                    .get(index)
                    .map_or(CtlType::Unknown, |b| b.return_type(&arg_types));
                self.annotate(id, ret, Resolution::Builtin(index))
            }
            OverloadMatch::Ambiguous => {
                self.error(format!("Function '{name}' is ambiguous"), id);
                CtlType::Unknown
            }
            OverloadMatch::NotFound => {
                self.error(
                    format!("Function '{name}({})' is not declared", format_arg_types(&arg_types)),
                    id,
                );
                CtlType::Unknown
            }
        }
    }

    /// `dateAdd(d, 1, day)`: an undeclared identifier naming a unit is the
    /// unit string.
    fn date_unit_to_literal(&mut self, arg: NodeId) {
        let NodeKind::Identifier { name } = self.ast.kind(arg) else {
            return;
        };
        if !builtins::DATE_UNITS.contains(&name.as_str()) || self.scopes.lookup(name).is_some() {
            return;
        }
        let unit = Literal::String(name.clone());
        self.ast.node_mut(arg).kind = NodeKind::Literal(unit);
    }

    fn check_port(&mut self, id: NodeId, dir: PortDir, port: &PortRef) -> CtlType {
        let env = self.env;
        let (ports, prefix) = match dir {
            PortDir::Input => (&env.inputs, "$in"),
            PortDir::Output => (&env.outputs, "$out"),
        };
        let found = match port {
            PortRef::Index(i) => ports.get(*i).map(|m| (*i, m.clone())),
            PortRef::Name(name) => ports
                .iter()
                .enumerate()
                .find(|(_, m)| m.name() == name)
                .map(|(i, m)| (i, m.clone())),
        };
        match found {
            Some((index, meta)) => {
                self.annotate(id, CtlType::Record(meta), Resolution::Port(index))
            }
            None => {
                let label = match port {
                    PortRef::Index(i) => i.to_string(),
                    PortRef::Name(n) => n.clone(),
                };
                self.error(format!("Record '{prefix}.{label}' is not defined"), id);
                CtlType::Unknown
            }
        }
    }

    fn check_member(&mut self, id: NodeId, field: &FieldSel, children: &[NodeId]) -> CtlType {
        let Some(receiver) = children.first() else {
            return CtlType::Unknown;
        };
        let meta = match self.check_expr(*receiver) {
            CtlType::Record(meta) => meta,
            CtlType::Unknown => return CtlType::Unknown,
            other => {
                self.error(format!("Field access on non-record type '{other}'"), id);
                return CtlType::Unknown;
            }
        };
        let index = match field {
            FieldSel::Star => {
                return self.annotate(id, CtlType::Record(meta), Resolution::RecordCopy);
            }
            FieldSel::Name(name) => meta.field_index(name),
            FieldSel::Index(i) => (*i < meta.field_count()).then_some(*i),
        };
        match index.and_then(|i| meta.field(i).map(|f| (i, f.ty.clone()))) {
            Some((i, ty)) => self.annotate(id, ty, Resolution::Field(i)),
            None => {
                let label = match field {
                    FieldSel::Name(name) => name.clone(),
                    FieldSel::Index(i) => i.to_string(),
                    FieldSel::Star => "*".to_string(),
                };
                self.error(
                    format!("Field '{label}' does not exist in record '{}'", meta.name()),
                    id,
                );
                CtlType::Unknown
            }
        }
    }

    fn check_index(&mut self, id: NodeId, children: &[NodeId]) -> CtlType {
        let [container, index] = children else {
            return CtlType::Unknown;
        };
        let container_ty = self.check_expr(*container);
        let index_ty = self.check_expr(*index);
        match container_ty {
            CtlType::List(elem) => {
                if !matches!(index_ty, CtlType::Integer | CtlType::Long)
                    && !index_ty.is_wildcard()
                {
                    self.error(format!("List index must be integer, found '{index_ty}'"), *index);
                }
                self.set_type(id, *elem)
            }
            CtlType::Map(key, value) => {
                self.expect_type(*index, &key);
                self.set_type(id, *value)
            }
            CtlType::Unknown => CtlType::Unknown,
            other => {
                self.error(format!("Cannot index into type '{other}'"), id);
                CtlType::Unknown
            }
        }
    }

    fn check_sequence(
        &mut self,
        id: NodeId,
        name: String,
        ty: Option<&TypeRef>,
        op: SequenceOp,
    ) -> CtlType {
        let ty = match ty {
            Some(t) => self.resolve_type(t, id),
            None => CtlType::Integer,
        };
        if !matches!(ty, CtlType::Integer | CtlType::Long | CtlType::String) {
            self.error(format!("Sequence type must be integer, long or string, not '{ty}'"), id);
            return CtlType::Unknown;
        }
        let entry = SequenceRef {
            name,
            ty: ty.clone(),
        };
        let index = match self.sequences.iter().position(|s| *s == entry) {
            Some(i) => i,
            None => {
                self.sequences.push(entry);
                self.sequences.len() - 1
            }
        };
        let result = if op == SequenceOp::Reset { CtlType::Void } else { ty };
        self.annotate(id, result, Resolution::Resource(index))
    }

    fn check_lookup(&mut self, id: NodeId, name: &str, op: LookupOp, keys: &[NodeId]) -> CtlType {
        for key in keys {
            self.check_expr(*key);
        }
        let Some(signature) = self.env.lookup(name).cloned() else {
            self.error(format!("Lookup table '{name}' is not declared"), id);
            return CtlType::Unknown;
        };
        match op {
            LookupOp::Get | LookupOp::Count => {
                if keys.len() == signature.key_types.len() {
                    for (key, ty) in keys.iter().zip(&signature.key_types) {
                        self.expect_type(*key, ty);
                    }
                } else {
                    self.error(
                        format!(
                            "Lookup '{name}' expects {} key(s), found {}",
                            signature.key_types.len(),
                            keys.len()
                        ),
                        id,
                    );
                }
            }
            LookupOp::Next | LookupOp::Init | LookupOp::Free if !keys.is_empty() => {
                self.error(format!("Lookup operation on '{name}' takes no arguments"), id);
            }
            _ => {}
        }
        let index = match self.lookups.iter().position(|l| l == name) {
            Some(i) => i,
            None => {
                self.lookups.push(name.to_string());
                self.lookups.len() - 1
            }
        };
        let ty = match op {
            LookupOp::Get | LookupOp::Next => CtlType::Record(signature.metadata),
            LookupOp::Count => CtlType::Integer,
            LookupOp::Init | LookupOp::Free => CtlType::Void,
        };
        self.annotate(id, ty, Resolution::Resource(index))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dsl::{lexer, parser};
    use crate::model::{FieldMetadata, RecordMetadata};

    fn env() -> CompileEnv {
        let person = Arc::new(RecordMetadata::new(
            "person",
            vec![
                FieldMetadata::new("name", CtlType::String),
                FieldMetadata::new("age", CtlType::Integer),
                FieldMetadata::new("tags", CtlType::list_of(CtlType::String)),
            ],
        ));
        CompileEnv::new().with_input(person.clone()).with_output(person)
    }

    fn check(src: &str) -> (Ast, Resolved) {
        let mut ast = parser::parse(lexer::lex(src).unwrap()).unwrap();
        let resolved = resolve(&mut ast, &env()).unwrap();
        (ast, resolved)
    }

    fn check_err(src: &str) -> Vec<String> {
        let mut ast = parser::parse(lexer::lex(src).unwrap()).unwrap();
        resolve(&mut ast, &env()).unwrap_err().into_iter().map(|e| e.message).collect()
    }

    fn global_ty(ast: &Ast, resolved: &Resolved, index: usize) -> CtlType {
        ast.ty(resolved.global_code[index]).clone()
    }

    #[test]
    fn promotion_of_mixed_operands() {
        let (ast, r) = check(
            "integer a = 1; long b = 2; decimal d = 1.5D; \
             long c = a + b; decimal e = a * d;",
        );
        let c_init = ast.child(r.global_code[3], 0).unwrap();
        assert_eq!(ast.ty(c_init), &CtlType::Long);
        let e_init = ast.child(r.global_code[4], 0).unwrap();
        assert_eq!(ast.ty(e_init), &CtlType::Decimal);
        assert_eq!(ast.resolution(e_init), Resolution::Operands(OpKind::Decimal));
    }

    #[test]
    fn string_concatenation_accepts_any_scalar() {
        let (ast, r) = check("string s = \"n=\" + 3 + true;");
        let init = ast.child(r.global_code[0], 0).unwrap();
        assert_eq!(ast.resolution(init), Resolution::Operands(OpKind::String));
    }

    #[test]
    fn narrowing_is_rejected() {
        let errors = check_err("long l = 5L; integer i = l;");
        assert_eq!(errors, ["Type mismatch: cannot convert from 'long' to 'integer'"]);
    }

    #[test]
    fn overloads_resolve_by_argument_type() {
        let (ast, r) = check(
            "function integer sum(integer a, integer b) { return a + b; }\n\
             function string sum(string a, string b) { return a + b; }\n\
             integer x = sum(1, 2); string y = sum(\"a\", \"b\");",
        );
        let x = ast.child(r.global_code[0], 0).unwrap();
        let y = ast.child(r.global_code[1], 0).unwrap();
        assert_eq!(ast.resolution(x), Resolution::Function(0));
        assert_eq!(ast.resolution(y), Resolution::Function(1));
        assert_eq!(global_ty(&ast, &r, 1), CtlType::String);
    }

    #[test]
    fn promotion_prefers_the_nearest_overload() {
        let (ast, r) = check(
            "function long f(long a) { return a; }\n\
             function decimal f(decimal a) { return a; }\n\
             long x = f(1);",
        );
        let call = ast.child(r.global_code[0], 0).unwrap();
        assert_eq!(ast.resolution(call), Resolution::Function(0));
    }

    #[test]
    fn ambiguous_and_missing_overloads() {
        let errors = check_err(
            "function integer f(long a, integer b) { return 1; }\n\
             function integer f(integer a, long b) { return 2; }\n\
             integer x = f(1, 1); integer y = g(1, \"s\");",
        );
        assert_eq!(
            errors,
            ["Function 'f' is ambiguous", "Function 'g(integer, string)' is not declared"]
        );
    }

    #[test]
    fn duplicate_functions_are_reported_twice() {
        let errors = check_err(
            "function integer f(integer a) { return a; }\n\
             function integer f(integer b) { return b; }",
        );
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e == "Duplicate function 'integer f(integer)'"));
    }

    #[test]
    fn builtins_share_overload_resolution() {
        let (ast, r) = check("integer n = length(\"abc\"); integer m = \"abc\".length();");
        for i in 0..2 {
            let call = ast.child(r.global_code[i], 0).unwrap();
            assert!(matches!(ast.resolution(call), Resolution::Builtin(_)));
        }
    }

    #[test]
    fn redeclaration_and_shadowing() {
        let errors = check_err("integer x; string x;");
        assert_eq!(errors, ["Variable 'x' is already defined"]);
        check("integer x; function integer f() { string x = \"s\"; return length(x); }");
    }

    #[test]
    fn duplicate_case_labels() {
        let errors = check_err("integer x = 5; switch (x) { case 5: x = 1; case 5: x = 2; }");
        assert_eq!(errors, ["Duplicate case", "Duplicate case"]);
        let errors = check_err(
            "integer x = 5; switch (x) { default: break; case 1: break; default: break; }",
        );
        assert_eq!(errors, ["Duplicate default", "Duplicate default"]);
    }

    #[test]
    fn promoted_case_labels_collide() {
        let errors = check_err("long x = 5L; switch (x) { case 5: break; case 5L: break; }");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn compound_assignment_is_desugared() {
        let (ast, r) = check("integer a = 1; a += 2;");
        let assign = r.global_code[1];
        assert_eq!(ast.kind(assign), &NodeKind::Assignment { op: AssignOp::Set });
        let rhs = ast.child(assign, 1).unwrap();
        assert_eq!(ast.kind(rhs), &NodeKind::Binary { op: BinaryOp::Add });
        let lhs = ast.child(assign, 0).unwrap();
        let copy = ast.child(rhs, 0).unwrap();
        assert_ne!(lhs, copy);
        assert!(ast.same_shape(lhs, copy));
        assert_eq!(ast.parent(copy), Some(rhs));
    }

    #[test]
    fn input_fields_are_read_only() {
        let errors = check_err("$in.0.name = \"x\";");
        assert_eq!(errors, ["Cannot assign to a field of an input record"]);
        check("$out.0.name = $in.0.name; $out.0.* = $in.0.*; $out.person.age++;");
    }

    #[test]
    fn fields_resolve_by_name_and_position() {
        let (ast, r) = check("string n = $in.0.name; integer a = $in.0.1;");
        let by_name = ast.child(r.global_code[0], 0).unwrap();
        let by_pos = ast.child(r.global_code[1], 0).unwrap();
        assert_eq!(ast.resolution(by_name), Resolution::Field(0));
        assert_eq!(ast.resolution(by_pos), Resolution::Field(1));
        let errors = check_err("string z = $in.0.missing;");
        assert_eq!(errors, ["Field 'missing' does not exist in record 'person'"]);
    }

    #[test]
    fn break_and_continue_context() {
        let errors = check_err("break; continue;");
        assert_eq!(
            errors,
            ["Break statement outside of loop or switch", "Continue statement outside of loop"]
        );
        check("integer i; while (i < 3) { switch (i) { case 1: continue; default: break; } i++; }");
    }

    #[test]
    fn list_literals_take_the_target_type() {
        let (ast, r) = check("long[] l = [1, 2]; map[string, decimal] m = {\"a\" -> 1};");
        let lit = ast.child(r.global_code[0], 0).unwrap();
        assert_eq!(ast.ty(lit), &CtlType::list_of(CtlType::Long));
        let map = ast.child(r.global_code[1], 0).unwrap();
        assert_eq!(ast.ty(map), &CtlType::map_of(CtlType::String, CtlType::Decimal));
    }

    #[test]
    fn foreach_element_types() {
        check("integer[] xs = [1, 2]; long total; foreach (integer x : xs) { total += x; }");
        check("string s; foreach (string f : $in.0.*) { s = s + f; }");
        let errors = check_err("string[] xs; foreach (integer x : xs) { }");
        assert_eq!(errors, ["Type mismatch: cannot convert from 'string' to 'integer'"]);
    }

    #[test]
    fn functions_see_every_top_level_global() {
        let (_, r) = check(
            "function integer bump() { counter++; return counter; } integer counter = 0;",
        );
        assert_eq!(r.symbols.functions[0].local_count, 0);
        assert_eq!(r.symbols.global_slot("counter"), Some(0));
    }

    #[test]
    fn sequences_and_unknown_lookups() {
        let (_, r) = check(
            "long a = sequence(ids, long).next(); long b = sequence(ids, long).current();",
        );
        assert_eq!(r.sequences.len(), 1);
        let errors = check_err("integer c = lookup(rates).count(1);");
        assert_eq!(errors, ["Lookup table 'rates' is not declared"]);
    }

    #[test]
    fn return_checks() {
        let errors = check_err(
            "function integer f() { return; } function void g() { return 1; } return 2;",
        );
        assert_eq!(
            errors,
            [
                "Return statement outside of function",
                "Missing return value of type 'integer'",
                "Cannot return a value from a void function",
            ]
        );
    }
}
