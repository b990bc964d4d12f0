//! Arena-backed AST for CTL programs.
//!
//! Nodes live in one contiguous store and refer to each other by
//! [`NodeId`]. Parent and child links are indices, so the tree can be
//! navigated both ways without reference cycles.

use std::fmt;

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::model::types::{CtlType, OpKind};
use crate::model::value::{ArithOp, CompareOp, Value};

/// Source span for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(index: usize) -> Self {
        NodeId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Type as written in source. Record names are resolved against metadata
/// during semantic analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeRef {
    Void,
    Integer,
    Long,
    Number,
    Decimal,
    String,
    Boolean,
    Date,
    List(Box<TypeRef>),
    Map(Box<TypeRef>, Box<TypeRef>),
    Named(String),
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Void => write!(f, "void"),
            TypeRef::Integer => write!(f, "integer"),
            TypeRef::Long => write!(f, "long"),
            TypeRef::Number => write!(f, "number"),
            TypeRef::Decimal => write!(f, "decimal"),
            TypeRef::String => write!(f, "string"),
            TypeRef::Boolean => write!(f, "boolean"),
            TypeRef::Date => write!(f, "date"),
            TypeRef::List(elem) => write!(f, "{elem}[]"),
            TypeRef::Map(k, v) => write!(f, "map[{k}, {v}]"),
            TypeRef::Named(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i32),
    Long(i64),
    Number(f64),
    Decimal(Decimal),
    String(String),
    Boolean(bool),
    Null,
}

impl Literal {
    pub fn ctl_type(&self) -> CtlType {
        match self {
            Literal::Integer(_) => CtlType::Integer,
            Literal::Long(_) => CtlType::Long,
            Literal::Number(_) => CtlType::Number,
            Literal::Decimal(_) => CtlType::Decimal,
            Literal::String(_) => CtlType::String,
            Literal::Boolean(_) => CtlType::Boolean,
            Literal::Null => CtlType::Null,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Literal::Integer(i) => Value::Integer(*i),
            Literal::Long(l) => Value::Long(*l),
            Literal::Number(n) => Value::Number(*n),
            Literal::Decimal(d) => Value::Decimal(*d),
            Literal::String(s) => Value::String(s.clone()),
            Literal::Boolean(b) => Value::Boolean(*b),
            Literal::Null => Value::Null,
        }
    }

    /// Literal form of a folded scalar. Containers and records have none.
    pub fn from_value(value: &Value) -> Option<Literal> {
        Some(match value {
            Value::Integer(i) => Literal::Integer(*i),
            Value::Long(l) => Literal::Long(*l),
            Value::Number(n) => Literal::Number(*n),
            Value::Decimal(d) => Literal::Decimal(*d),
            Value::String(s) => Literal::String(s.clone()),
            Value::Boolean(b) => Literal::Boolean(*b),
            Value::Null => Literal::Null,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn arith(self) -> Option<ArithOp> {
        match self {
            BinaryOp::Add => Some(ArithOp::Add),
            BinaryOp::Sub => Some(ArithOp::Sub),
            BinaryOp::Mul => Some(ArithOp::Mul),
            BinaryOp::Div => Some(ArithOp::Div),
            BinaryOp::Mod => Some(ArithOp::Mod),
            _ => None,
        }
    }

    pub fn compare(self) -> Option<CompareOp> {
        match self {
            BinaryOp::Eq => Some(CompareOp::Eq),
            BinaryOp::Ne => Some(CompareOp::Ne),
            BinaryOp::Lt => Some(CompareOp::Lt),
            BinaryOp::Le => Some(CompareOp::Le),
            BinaryOp::Gt => Some(CompareOp::Gt),
            BinaryOp::Ge => Some(CompareOp::Ge),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match (self.arith(), self.compare()) {
            (Some(op), _) => op.symbol(),
            (_, Some(op)) => op.symbol(),
            _ if self == BinaryOp::And => "&&",
            _ => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl AssignOp {
    /// Binary operator a compound assignment expands to.
    pub fn binary(self) -> Option<BinaryOp> {
        match self {
            AssignOp::Set => None,
            AssignOp::Add => Some(BinaryOp::Add),
            AssignOp::Sub => Some(BinaryOp::Sub),
            AssignOp::Mul => Some(BinaryOp::Mul),
            AssignOp::Div => Some(BinaryOp::Div),
            AssignOp::Mod => Some(BinaryOp::Mod),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncDec {
    Inc,
    Dec,
}

impl IncDec {
    pub fn delta(self) -> i32 {
        match self {
            IncDec::Inc => 1,
            IncDec::Dec => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDir {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRef {
    Index(usize),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSel {
    Name(String),
    Index(usize),
    /// `.*`, the whole field set of a record.
    Star,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOp {
    Next,
    Current,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOp {
    Get,
    Count,
    Next,
    Init,
    Free,
}

/// Closed set of node kinds. Child layout per kind is fixed:
///
/// | kind | children |
/// |------|----------|
/// | `Start`, `Import`, `Block`, `Parameters` | items in order |
/// | `FunctionDeclaration` | `[Parameters, Block]` |
/// | `VariableDeclaration` | `[initializer?]` |
/// | `If` | `[cond, then, else?]` |
/// | `While` | `[cond, body]` |
/// | `DoWhile` | `[body, cond]` |
/// | `For` | `[init, cond, update, body]` (absent clauses are `Empty`) |
/// | `Foreach` | `[VariableDeclaration, iterable, body]` |
/// | `Switch` | `[scrutinee, (Case or statement)*]` flat, in source order |
/// | `Case` | `[label]`, none for `default` |
/// | `Return` | `[value?]` |
/// | `Assignment`, `Binary`, `Index` | `[lhs, rhs]` |
/// | `Unary`, `IncDec`, `Member` | `[operand]` |
/// | `Conditional` | `[cond, then, else]` |
/// | `Call`, `ListLiteral`, `Lookup` | arguments / elements / keys |
/// | `MapLiteral` | `[k1, v1, k2, v2, ...]` |
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start,
    Import { path: String },
    FunctionDeclaration { name: String, return_type: TypeRef },
    Parameters,
    VariableDeclaration { name: String, ty: TypeRef },
    Block,
    If,
    While,
    DoWhile,
    For,
    Foreach,
    Switch,
    Case { is_default: bool },
    Break,
    Continue,
    Return,
    Empty,
    Literal(Literal),
    ListLiteral,
    MapLiteral,
    Identifier { name: String },
    Assignment { op: AssignOp },
    Binary { op: BinaryOp },
    Unary { op: UnaryOp },
    IncDec { op: IncDec, prefix: bool },
    Conditional,
    Call { name: String },
    Port { dir: PortDir, port: PortRef },
    Member { field: FieldSel },
    Index,
    Sequence {
        name: String,
        ty: Option<TypeRef>,
        op: SequenceOp,
    },
    Lookup { name: String, op: LookupOp },
}

impl NodeKind {
    /// Kinds that can never appear inside an expression and therefore
    /// refuse [`Ast::duplicate`].
    pub fn is_duplicable(&self) -> bool {
        match self {
            NodeKind::Start
            | NodeKind::Import { .. }
            | NodeKind::FunctionDeclaration { .. }
            | NodeKind::Parameters
            | NodeKind::VariableDeclaration { .. }
            | NodeKind::Block
            | NodeKind::While
            | NodeKind::DoWhile
            | NodeKind::For
            | NodeKind::Foreach
            | NodeKind::Switch => false,
            NodeKind::If
            | NodeKind::Case { .. }
            | NodeKind::Break
            | NodeKind::Continue
            | NodeKind::Return
            | NodeKind::Empty
            | NodeKind::Literal(_)
            | NodeKind::ListLiteral
            | NodeKind::MapLiteral
            | NodeKind::Identifier { .. }
            | NodeKind::Assignment { .. }
            | NodeKind::Binary { .. }
            | NodeKind::Unary { .. }
            | NodeKind::IncDec { .. }
            | NodeKind::Conditional
            | NodeKind::Call { .. }
            | NodeKind::Port { .. }
            | NodeKind::Member { .. }
            | NodeKind::Index
            | NodeKind::Sequence { .. }
            | NodeKind::Lookup { .. } => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "Start",
            NodeKind::Import { .. } => "Import",
            NodeKind::FunctionDeclaration { .. } => "FunctionDeclaration",
            NodeKind::Parameters => "Parameters",
            NodeKind::VariableDeclaration { .. } => "VariableDeclaration",
            NodeKind::Block => "Block",
            NodeKind::If => "If",
            NodeKind::While => "While",
            NodeKind::DoWhile => "DoWhile",
            NodeKind::For => "For",
            NodeKind::Foreach => "Foreach",
            NodeKind::Switch => "Switch",
            NodeKind::Case { .. } => "Case",
            NodeKind::Break => "Break",
            NodeKind::Continue => "Continue",
            NodeKind::Return => "Return",
            NodeKind::Empty => "Empty",
            NodeKind::Literal(_) => "Literal",
            NodeKind::ListLiteral => "ListLiteral",
            NodeKind::MapLiteral => "MapLiteral",
            NodeKind::Identifier { .. } => "Identifier",
            NodeKind::Assignment { .. } => "Assignment",
            NodeKind::Binary { .. } => "Binary",
            NodeKind::Unary { .. } => "Unary",
            NodeKind::IncDec { .. } => "IncDec",
            NodeKind::Conditional => "Conditional",
            NodeKind::Call { .. } => "Call",
            NodeKind::Port { .. } => "Port",
            NodeKind::Member { .. } => "Member",
            NodeKind::Index => "Index",
            NodeKind::Sequence { .. } => "Sequence",
            NodeKind::Lookup { .. } => "Lookup",
        }
    }
}

/// What semantic analysis bound a node to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    #[default]
    Unresolved,
    /// Frame slot of a local variable or parameter.
    Local(u16),
    /// Slot in the global variable table.
    Global(u16),
    /// Index into the program's function table.
    Function(usize),
    /// Index into the builtin table.
    Builtin(usize),
    /// Field position within the record's metadata.
    Field(usize),
    /// Index of the bound input/output record.
    Port(usize),
    /// Operand class of an operator node.
    Operands(OpKind),
    /// `a.* = b.*`, copy record fields by name.
    RecordCopy,
    /// Index into the compile context's sequence or lookup list.
    Resource(usize),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Static type assigned by the type checker.
    pub ty: CtlType,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AstError {
    #[error("{kind} nodes cannot be duplicated")]
    NotDuplicable { kind: &'static str },
    #[error("node has no child at index {index}")]
    NoSuchChild { index: usize },
}

/// Pre/post-order traversal hooks. Returning `false` from `enter` skips
/// the node's children.
pub trait Visitor {
    fn enter(&mut self, _ast: &Ast, _id: NodeId) -> bool {
        true
    }

    fn leave(&mut self, _ast: &Ast, _id: NodeId) {}
}

#[derive(Debug, Clone, Default)]
pub struct Ast {
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn set_root(&mut self, id: NodeId) {
        self.root = Some(id);
    }

    pub fn add(&mut self, kind: NodeKind, span: Span) -> NodeId {
        let id = NodeId::new(self.nodes.len());
        self.nodes.push(Node {
            kind,
            span,
            parent: None,
            children: Vec::new(),
            ty: CtlType::Unknown,
            resolution: Resolution::Unresolved,
        });
        id
    }

    /// Add a node and attach `children` to it in order.
    pub fn add_with(&mut self, kind: NodeKind, span: Span, children: Vec<NodeId>) -> NodeId {
        let id = self.add(kind, span);
        for child in children {
            self.push_child(id, child);
        }
        id
    }

    pub fn push_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.index()].parent = Some(parent);
        self.nodes[parent.index()].children.push(child);
    }

    /// Put `new` at `index` under `parent`, returning the detached node.
    pub fn replace_child(
        &mut self,
        parent: NodeId,
        index: usize,
        new: NodeId,
    ) -> Result<NodeId, AstError> {
        let slot = self.nodes[parent.index()]
            .children
            .get_mut(index)
            .ok_or(AstError::NoSuchChild { index })?;
        let old = std::mem::replace(slot, new);
        self.nodes[new.index()].parent = Some(parent);
        self.nodes[old.index()].parent = None;
        Ok(old)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub fn span(&self, id: NodeId) -> Span {
        self.nodes[id.index()].span
    }

    pub fn ty(&self, id: NodeId) -> &CtlType {
        &self.nodes[id.index()].ty
    }

    pub fn resolution(&self, id: NodeId) -> Resolution {
        self.nodes[id.index()].resolution
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    pub fn child(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.nodes[id.index()].children.get(index).copied()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    /// Deep copy of the subtree rooted at `id`.
    ///
    /// The copy shares no node with the original and is detached; its
    /// parent link is set when it is inserted with [`Ast::push_child`] or
    /// [`Ast::replace_child`].
    pub fn duplicate(&mut self, id: NodeId) -> Result<NodeId, AstError> {
        let kind = &self.nodes[id.index()].kind;
        if !kind.is_duplicable() {
            return Err(AstError::NotDuplicable { kind: kind.name() });
        }
        Ok(self.copy_subtree(id))
    }

    fn copy_subtree(&mut self, id: NodeId) -> NodeId {
        let original = self.nodes[id.index()].clone();
        let children: Vec<NodeId> =
            original.children.iter().map(|c| self.copy_subtree(*c)).collect();
        let copy = NodeId::new(self.nodes.len());
        for child in &children {
            self.nodes[child.index()].parent = Some(copy);
        }
        self.nodes.push(Node {
            parent: None,
            children,
            ..original
        });
        copy
    }

    pub fn walk<V: Visitor>(&self, id: NodeId, visitor: &mut V) {
        if visitor.enter(self, id) {
            for child in self.children(id) {
                self.walk(*child, visitor);
            }
        }
        visitor.leave(self, id);
    }

    /// Every node of the subtree in pre-order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        struct Collect(Vec<NodeId>);
        impl Visitor for Collect {
            fn enter(&mut self, _ast: &Ast, id: NodeId) -> bool {
                self.0.push(id);
                true
            }
        }
        let mut collect = Collect(Vec::new());
        self.walk(id, &mut collect);
        collect.0
    }

    /// True when both subtrees have the same kinds and leaf values in the
    /// same order.
    pub fn same_shape(&self, a: NodeId, b: NodeId) -> bool {
        let (na, nb) = (self.node(a), self.node(b));
        na.kind == nb.kind
            && na.children.len() == nb.children.len()
            && na.children.iter().zip(&nb.children).all(|(x, y)| self.same_shape(*x, *y))
    }

    /// Indented tree dump, one node per line.
    pub fn dump(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.dump_into(id, 0, &mut out);
        out
    }

    fn dump_into(&self, id: NodeId, depth: usize, out: &mut String) {
        let node = self.node(id);
        let detail = match &node.kind {
            NodeKind::Import { path } => format!(" \"{path}\""),
            NodeKind::FunctionDeclaration { name, return_type } => format!(" {return_type} {name}"),
            NodeKind::VariableDeclaration { name, ty } => format!(" {ty} {name}"),
            NodeKind::Case { is_default: true } => " default".to_string(),
            NodeKind::Literal(lit) => format!(" {lit:?}"),
            NodeKind::Identifier { name } | NodeKind::Call { name } => format!(" {name}"),
            NodeKind::Assignment { op } => format!(" {op:?}"),
            NodeKind::Binary { op } => format!(" {}", op.symbol()),
            NodeKind::Unary { op } => format!(" {op:?}"),
            NodeKind::IncDec { op, prefix } => format!(" {op:?} prefix={prefix}"),
            NodeKind::Port { dir, port } => format!(" {dir:?} {port:?}"),
            NodeKind::Member { field } => format!(" {field:?}"),
            NodeKind::Sequence { name, op, .. } => format!(" {name}.{op:?}"),
            NodeKind::Lookup { name, op } => format!(" {name}.{op:?}"),
            _ => String::new(),
        };
        out.push_str(&"  ".repeat(depth));
        out.push_str(node.kind.name());
        out.push_str(&detail);
        if !matches!(node.ty, CtlType::Unknown) {
            out.push_str(&format!(" : {}", node.ty));
        }
        out.push('\n');
        for child in &node.children {
            self.dump_into(*child, depth + 1, out);
        }
    }
}
