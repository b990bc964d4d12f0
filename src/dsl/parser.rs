use super::ast::*;
use super::error::CompileError;
use super::lexer::{SpannedToken, Token};

/// Parse a token stream into a fresh AST rooted at a `Start` node.
pub fn parse(tokens: Vec<SpannedToken>) -> Result<Ast, Vec<CompileError>> {
    let mut ast = Ast::new();
    let root = ast.add(NodeKind::Start, Span::default());
    ast.set_root(root);
    parse_into(tokens, &mut ast, root)?;
    Ok(ast)
}

/// Parse top-level items and append them under `container`. Imports use
/// this to splice another file into the importing program's arena.
pub fn parse_into(
    tokens: Vec<SpannedToken>,
    ast: &mut Ast,
    container: NodeId,
) -> Result<(), Vec<CompileError>> {
    let mut parser = Parser::new(tokens, ast);
    parser.parse_program(container)
}

struct Parser<'a> {
    tokens: Vec<SpannedToken>,
    pos: usize,
    errors: Vec<CompileError>,
    ast: &'a mut Ast,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<SpannedToken>, ast: &'a mut Ast) -> Self {
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
            ast,
        }
    }

    fn parse_program(&mut self, container: NodeId) -> Result<(), Vec<CompileError>> {
        while !self.at_eof() {
            let item = match self.peek() {
                Token::Import => self.parse_import(),
                Token::Function => self.parse_function(),
                _ => self.parse_statement(),
            };
            match item {
                Ok(id) => self.ast.push_child(container, id),
                Err(e) => {
                    self.errors.push(e);
                    self.recover_to_semicolon();
                }
            }
        }

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map_or(&Token::Eof, |t| &t.token)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).map_or(&Token::Eof, |t| &t.token)
    }

    fn span(&self) -> Span {
        self.tokens.get(self.pos).map_or(Span::new(0, 0), |t| t.span)
    }

    /// Span of the most recently consumed token.
    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(Span::new(0, 0), |t| t.span)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len().saturating_sub(1) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span, CompileError> {
        if self.peek() == expected {
            let sp = self.span();
            self.advance();
            Ok(sp)
        } else {
            Err(CompileError::parser(
                format!("Expected {}, got {}", describe(expected), describe(self.peek())),
                self.span(),
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), CompileError> {
        if let Token::Ident(name) = self.peek().clone() {
            let sp = self.span();
            self.advance();
            Ok((name, sp))
        } else {
            Err(CompileError::parser(
                format!("Expected identifier, got {}", describe(self.peek())),
                self.span(),
            ))
        }
    }

    fn expect_semicolon(&mut self) -> Result<(), CompileError> {
        self.expect(&Token::Semicolon).map(|_| ())
    }

    fn recover_to_semicolon(&mut self) {
        while !matches!(self.peek(), Token::Semicolon | Token::RBrace | Token::Eof) {
            self.advance();
        }
        self.advance();
    }

    fn node(&mut self, kind: NodeKind, span: Span, children: Vec<NodeId>) -> NodeId {
        self.ast.add_with(kind, span, children)
    }

    fn span_of(&self, id: NodeId) -> Span {
        self.ast.span(id)
    }

    // ── Declarations ──────────────────────────────────────────────

    fn parse_import(&mut self) -> Result<NodeId, CompileError> {
        let start = self.expect(&Token::Import)?;
        let Token::String(path) = self.peek().clone() else {
            return Err(CompileError::parser("Expected file name after 'import'", self.span()));
        };
        self.advance();
        self.expect_semicolon()?;
        Ok(self.node(NodeKind::Import { path }, start.merge(self.prev_span()), Vec::new()))
    }

    fn parse_function(&mut self) -> Result<NodeId, CompileError> {
        let start = self.expect(&Token::Function)?;
        let return_type = self.parse_type()?;
        let (name, _) = self.expect_ident()?;
        let params_start = self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            loop {
                let ty_span = self.span();
                let ty = self.parse_type()?;
                let (pname, pspan) = self.expect_ident()?;
                params.push(self.node(
                    NodeKind::VariableDeclaration { name: pname, ty },
                    ty_span.merge(pspan),
                    Vec::new(),
                ));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        let params_end = self.expect(&Token::RParen)?;
        let params = self.node(NodeKind::Parameters, params_start.merge(params_end), params);
        let body = self.parse_block()?;
        let span = start.merge(self.span_of(body));
        Ok(self.node(NodeKind::FunctionDeclaration { name, return_type }, span, vec![params, body]))
    }

    /// `type := base ('[' ']')*`
    fn parse_type(&mut self) -> Result<TypeRef, CompileError> {
        let mut ty = match self.peek().clone() {
            Token::IntegerTy => TypeRef::Integer,
            Token::LongTy => TypeRef::Long,
            Token::NumberTy => TypeRef::Number,
            Token::DecimalTy => TypeRef::Decimal,
            Token::StringTy => TypeRef::String,
            Token::BooleanTy => TypeRef::Boolean,
            Token::DateTy => TypeRef::Date,
            Token::VoidTy => TypeRef::Void,
            Token::Ident(name) => TypeRef::Named(name),
            Token::MapTy => {
                self.advance();
                self.expect(&Token::LBracket)?;
                let key = self.parse_type()?;
                self.expect(&Token::Comma)?;
                let value = self.parse_type()?;
                self.expect(&Token::RBracket)?;
                return self.parse_list_suffix(TypeRef::Map(Box::new(key), Box::new(value)));
            }
            other => {
                return Err(CompileError::parser(
                    format!("Expected type name, got {}", describe(&other)),
                    self.span(),
                ))
            }
        };
        self.advance();
        ty = self.parse_list_suffix(ty)?;
        Ok(ty)
    }

    fn parse_list_suffix(&mut self, mut ty: TypeRef) -> Result<TypeRef, CompileError> {
        while matches!(self.peek(), Token::LBracket) && matches!(self.peek_at(1), Token::RBracket) {
            self.advance();
            self.advance();
            ty = TypeRef::List(Box::new(ty));
        }
        Ok(ty)
    }

    /// True when the upcoming tokens start a variable declaration.
    fn at_declaration(&self) -> bool {
        match self.peek() {
            Token::IntegerTy
            | Token::LongTy
            | Token::NumberTy
            | Token::DecimalTy
            | Token::StringTy
            | Token::BooleanTy
            | Token::DateTy
            | Token::MapTy => true,
            // `recordType name` or `recordType[] name`
            Token::Ident(_) => match self.peek_at(1) {
                Token::Ident(_) => true,
                Token::LBracket => matches!(self.peek_at(2), Token::RBracket),
                _ => false,
            },
            _ => false,
        }
    }

    fn parse_variable_declaration(&mut self) -> Result<NodeId, CompileError> {
        let start = self.span();
        let ty = self.parse_type()?;
        let (name, _) = self.expect_ident()?;
        let mut children = Vec::new();
        if self.eat(&Token::Eq) {
            children.push(self.parse_expr()?);
        }
        let span = start.merge(self.prev_span());
        Ok(self.node(NodeKind::VariableDeclaration { name, ty }, span, children))
    }

    // ── Statements ────────────────────────────────────────────────

    fn parse_block(&mut self) -> Result<NodeId, CompileError> {
        let start = self.expect(&Token::LBrace)?;
        let mut statements = Vec::new();
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            match self.parse_statement() {
                Ok(id) => statements.push(id),
                Err(e) => {
                    self.errors.push(e);
                    self.recover_to_semicolon();
                }
            }
        }
        let end = self.expect(&Token::RBrace)?;
        Ok(self.node(NodeKind::Block, start.merge(end), statements))
    }

    fn parse_statement(&mut self) -> Result<NodeId, CompileError> {
        let start = self.span();
        match self.peek() {
            Token::LBrace => self.parse_block(),
            Token::Semicolon => {
                self.advance();
                Ok(self.node(NodeKind::Empty, start, Vec::new()))
            }
            Token::If => self.parse_if(),
            Token::While => self.parse_while(),
            Token::Do => self.parse_do_while(),
            Token::For => self.parse_for(),
            Token::Foreach => self.parse_foreach(),
            Token::Switch => self.parse_switch(),
            Token::Break | Token::Continue => {
                let kind = if matches!(self.peek(), Token::Break) {
                    NodeKind::Break
                } else {
                    NodeKind::Continue
                };
                self.advance();
                self.expect_semicolon()?;
                Ok(self.node(kind, start, Vec::new()))
            }
            Token::Return => {
                self.advance();
                let mut children = Vec::new();
                if !matches!(self.peek(), Token::Semicolon) {
                    children.push(self.parse_expr()?);
                }
                self.expect_semicolon()?;
                let span = start.merge(self.prev_span());
                Ok(self.node(NodeKind::Return, span, children))
            }
            Token::Function => Err(CompileError::parser(
                "Functions may only be declared at top level",
                start,
            )),
            _ if self.at_declaration() => {
                let decl = self.parse_variable_declaration()?;
                self.expect_semicolon()?;
                Ok(decl)
            }
            _ => {
                let expr = self.parse_expr()?;
                self.expect_semicolon()?;
                Ok(expr)
            }
        }
    }

    fn parse_condition(&mut self) -> Result<NodeId, CompileError> {
        self.expect(&Token::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        Ok(cond)
    }

    fn parse_if(&mut self) -> Result<NodeId, CompileError> {
        let start = self.expect(&Token::If)?;
        let cond = self.parse_condition()?;
        let then_branch = self.parse_statement()?;
        let mut children = vec![cond, then_branch];
        if self.eat(&Token::Else) {
            children.push(self.parse_statement()?);
        }
        let span = start.merge(self.prev_span());
        Ok(self.node(NodeKind::If, span, children))
    }

    fn parse_while(&mut self) -> Result<NodeId, CompileError> {
        let start = self.expect(&Token::While)?;
        let cond = self.parse_condition()?;
        let body = self.parse_statement()?;
        let span = start.merge(self.prev_span());
        Ok(self.node(NodeKind::While, span, vec![cond, body]))
    }

    fn parse_do_while(&mut self) -> Result<NodeId, CompileError> {
        let start = self.expect(&Token::Do)?;
        let body = self.parse_statement()?;
        self.expect(&Token::While)?;
        let cond = self.parse_condition()?;
        self.expect_semicolon()?;
        let span = start.merge(self.prev_span());
        Ok(self.node(NodeKind::DoWhile, span, vec![body, cond]))
    }

    fn parse_for(&mut self) -> Result<NodeId, CompileError> {
        let start = self.expect(&Token::For)?;
        self.expect(&Token::LParen)?;
        let init = if matches!(self.peek(), Token::Semicolon) {
            self.empty()
        } else if self.at_declaration() {
            self.parse_variable_declaration()?
        } else {
            self.parse_expr()?
        };
        self.expect_semicolon()?;
        let cond =
            if matches!(self.peek(), Token::Semicolon) { self.empty() } else { self.parse_expr()? };
        self.expect_semicolon()?;
        let update =
            if matches!(self.peek(), Token::RParen) { self.empty() } else { self.parse_expr()? };
        self.expect(&Token::RParen)?;
        let body = self.parse_statement()?;
        let span = start.merge(self.prev_span());
        Ok(self.node(NodeKind::For, span, vec![init, cond, update, body]))
    }

    fn empty(&mut self) -> NodeId {
        let span = self.span();
        self.node(NodeKind::Empty, Span::new(span.start, span.start), Vec::new())
    }

    fn parse_foreach(&mut self) -> Result<NodeId, CompileError> {
        let start = self.expect(&Token::Foreach)?;
        self.expect(&Token::LParen)?;
        let decl_start = self.span();
        let ty = self.parse_type()?;
        let (name, name_span) = self.expect_ident()?;
        let decl_span = decl_start.merge(name_span);
        let decl = self.node(NodeKind::VariableDeclaration { name, ty }, decl_span, Vec::new());
        self.expect(&Token::Colon)?;
        let iterable = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        let body = self.parse_statement()?;
        let span = start.merge(self.prev_span());
        Ok(self.node(NodeKind::Foreach, span, vec![decl, iterable, body]))
    }

    /// Case labels and statements are kept flat, in source order, so
    /// fallthrough follows position.
    fn parse_switch(&mut self) -> Result<NodeId, CompileError> {
        let start = self.expect(&Token::Switch)?;
        let scrutinee = self.parse_condition()?;
        self.expect(&Token::LBrace)?;
        let mut children = vec![scrutinee];
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            let label_start = self.span();
            match self.peek() {
                Token::Case => {
                    self.advance();
                    let label = self.parse_expr()?;
                    self.expect(&Token::Colon)?;
                    let span = label_start.merge(self.prev_span());
                    let case = self.node(NodeKind::Case { is_default: false }, span, vec![label]);
                    children.push(case);
                }
                Token::Default => {
                    self.advance();
                    self.expect(&Token::Colon)?;
                    let span = label_start.merge(self.prev_span());
                    children.push(self.node(NodeKind::Case { is_default: true }, span, Vec::new()));
                }
                _ => match self.parse_statement() {
                    Ok(id) => children.push(id),
                    Err(e) => {
                        self.errors.push(e);
                        self.recover_to_semicolon();
                    }
                },
            }
        }
        let end = self.expect(&Token::RBrace)?;
        Ok(self.node(NodeKind::Switch, start.merge(end), children))
    }

    // ── Expressions ───────────────────────────────────────────────

    fn parse_expr(&mut self) -> Result<NodeId, CompileError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<NodeId, CompileError> {
        let target = self.parse_conditional()?;
        let op = match self.peek() {
            Token::Eq => AssignOp::Set,
            Token::PlusEq => AssignOp::Add,
            Token::MinusEq => AssignOp::Sub,
            Token::StarEq => AssignOp::Mul,
            Token::SlashEq => AssignOp::Div,
            Token::PercentEq => AssignOp::Mod,
            _ => return Ok(target),
        };
        self.advance();
        let value = self.parse_assignment()?;
        let span = self.span_of(target).merge(self.span_of(value));
        Ok(self.node(NodeKind::Assignment { op }, span, vec![target, value]))
    }

    fn parse_conditional(&mut self) -> Result<NodeId, CompileError> {
        let cond = self.parse_or()?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then_branch = self.parse_expr()?;
        self.expect(&Token::Colon)?;
        let else_branch = self.parse_conditional()?;
        let span = self.span_of(cond).merge(self.span_of(else_branch));
        Ok(self.node(NodeKind::Conditional, span, vec![cond, then_branch, else_branch]))
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<NodeId, CompileError>,
        op_for: fn(&Token) -> Option<BinaryOp>,
    ) -> Result<NodeId, CompileError> {
        let mut left = next(self)?;
        while let Some(op) = op_for(self.peek()) {
            self.advance();
            let right = next(self)?;
            let span = self.span_of(left).merge(self.span_of(right));
            left = self.node(NodeKind::Binary { op }, span, vec![left, right]);
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<NodeId, CompileError> {
        self.binary_level(Self::parse_and, |t| matches!(t, Token::Or).then_some(BinaryOp::Or))
    }

    fn parse_and(&mut self) -> Result<NodeId, CompileError> {
        self.binary_level(Self::parse_equality, |t| {
            matches!(t, Token::And).then_some(BinaryOp::And)
        })
    }

    fn parse_equality(&mut self) -> Result<NodeId, CompileError> {
        self.binary_level(Self::parse_comparison, |t| match t {
            Token::EqEq => Some(BinaryOp::Eq),
            Token::Ne => Some(BinaryOp::Ne),
            _ => None,
        })
    }

    fn parse_comparison(&mut self) -> Result<NodeId, CompileError> {
        self.binary_level(Self::parse_additive, |t| match t {
            Token::Lt => Some(BinaryOp::Lt),
            Token::Le => Some(BinaryOp::Le),
            Token::Gt => Some(BinaryOp::Gt),
            Token::Ge => Some(BinaryOp::Ge),
            _ => None,
        })
    }

    fn parse_additive(&mut self) -> Result<NodeId, CompileError> {
        self.binary_level(Self::parse_multiplicative, |t| match t {
            Token::Plus => Some(BinaryOp::Add),
            Token::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn parse_multiplicative(&mut self) -> Result<NodeId, CompileError> {
        self.binary_level(Self::parse_unary, |t| match t {
            Token::Star => Some(BinaryOp::Mul),
            Token::Slash => Some(BinaryOp::Div),
            Token::Percent => Some(BinaryOp::Mod),
            _ => None,
        })
    }

    fn parse_unary(&mut self) -> Result<NodeId, CompileError> {
        let start = self.span();
        let kind = match self.peek() {
            Token::Minus => NodeKind::Unary { op: UnaryOp::Neg },
            Token::Bang => NodeKind::Unary { op: UnaryOp::Not },
            Token::PlusPlus => NodeKind::IncDec {
                op: IncDec::Inc,
                prefix: true,
            },
            Token::MinusMinus => NodeKind::IncDec {
                op: IncDec::Dec,
                prefix: true,
            },
            Token::Plus => {
                self.advance();
                return self.parse_unary();
            }
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        let span = start.merge(self.span_of(operand));
        // Fold `-literal` so negative case labels stay literals.
        let negated = match (&kind, self.ast.kind(operand)) {
            (NodeKind::Unary { op: UnaryOp::Neg }, NodeKind::Literal(lit)) => match lit {
                Literal::Integer(i) => Some(Literal::Integer(i.wrapping_neg())),
                Literal::Long(l) => Some(Literal::Long(l.wrapping_neg())),
                Literal::Number(n) => Some(Literal::Number(-*n)),
                Literal::Decimal(d) => Some(Literal::Decimal(-*d)),
                _ => None,
            },
            _ => None,
        };
        if let Some(lit) = negated {
            let node = self.ast.node_mut(operand);
            node.kind = NodeKind::Literal(lit);
            node.span = span;
            return Ok(operand);
        }
        Ok(self.node(kind, span, vec![operand]))
    }

    fn parse_postfix(&mut self) -> Result<NodeId, CompileError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    let end = self.expect(&Token::RBracket)?;
                    let span = self.span_of(expr).merge(end);
                    expr = self.node(NodeKind::Index, span, vec![expr, index]);
                }
                Token::PlusPlus | Token::MinusMinus => {
                    let op = if matches!(self.peek(), Token::PlusPlus) {
                        IncDec::Inc
                    } else {
                        IncDec::Dec
                    };
                    let end = self.span();
                    self.advance();
                    let span = self.span_of(expr).merge(end);
                    expr = self.node(NodeKind::IncDec { op, prefix: false }, span, vec![expr]);
                }
                Token::Dot => {
                    self.advance();
                    expr = self.parse_member(expr)?;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// After `receiver.`: a field name, a field position, `*`, or a
    /// method call `receiver.f(args)` meaning `f(receiver, args)`.
    fn parse_member(&mut self, receiver: NodeId) -> Result<NodeId, CompileError> {
        let field_span = self.span();
        let field = match self.peek().clone() {
            Token::Ident(name) if matches!(self.peek_at(1), Token::LParen) => {
                self.advance();
                let mut args = vec![receiver];
                args.extend(self.parse_arguments()?);
                let span = self.span_of(receiver).merge(self.prev_span());
                return Ok(self.node(NodeKind::Call { name }, span, args));
            }
            Token::Ident(name) => FieldSel::Name(name),
            // Type keywords are legal field names (`$in.0.date`).
            Token::DateTy => FieldSel::Name("date".into()),
            Token::StringTy => FieldSel::Name("string".into()),
            Token::Int(i) => FieldSel::Index(usize::try_from(i).map_err(|_| {
                CompileError::parser("Field position must not be negative", field_span)
            })?),
            Token::Star => FieldSel::Star,
            other => {
                return Err(CompileError::parser(
                    format!("Expected field name after '.', got {}", describe(&other)),
                    field_span,
                ))
            }
        };
        self.advance();
        let span = self.span_of(receiver).merge(field_span);
        Ok(self.node(NodeKind::Member { field }, span, vec![receiver]))
    }

    fn parse_arguments(&mut self) -> Result<Vec<NodeId>, CompileError> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<NodeId, CompileError> {
        let start = self.span();
        let literal = match self.peek().clone() {
            Token::Int(v) => Some(Literal::Integer(v)),
            Token::Long(v) => Some(Literal::Long(v)),
            Token::Number(v) => Some(Literal::Number(v)),
            Token::Decimal(v) => Some(Literal::Decimal(v)),
            Token::String(s) => Some(Literal::String(s)),
            Token::True => Some(Literal::Boolean(true)),
            Token::False => Some(Literal::Boolean(false)),
            Token::Null => Some(Literal::Null),
            _ => None,
        };
        if let Some(lit) = literal {
            self.advance();
            return Ok(self.node(NodeKind::Literal(lit), start, Vec::new()));
        }

        match self.peek().clone() {
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !matches!(self.peek(), Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                let end = self.expect(&Token::RBracket)?;
                Ok(self.node(NodeKind::ListLiteral, start.merge(end), items))
            }
            Token::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                if !matches!(self.peek(), Token::RBrace) {
                    loop {
                        entries.push(self.parse_expr()?);
                        self.expect(&Token::Arrow)?;
                        entries.push(self.parse_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                let end = self.expect(&Token::RBrace)?;
                Ok(self.node(NodeKind::MapLiteral, start.merge(end), entries))
            }
            Token::Dollar(name) => {
                self.advance();
                self.parse_port(&name, start)
            }
            Token::Ident(name) if name == "sequence" && matches!(self.peek_at(1), Token::LParen) =>
            {
                self.parse_sequence(start)
            }
            Token::Ident(name) if name == "lookup" && matches!(self.peek_at(1), Token::LParen) => {
                self.parse_lookup(start)
            }
            Token::Ident(name) => {
                self.advance();
                if matches!(self.peek(), Token::LParen) {
                    let args = self.parse_arguments()?;
                    let span = start.merge(self.prev_span());
                    Ok(self.node(NodeKind::Call { name }, span, args))
                } else {
                    Ok(self.node(NodeKind::Identifier { name }, start, Vec::new()))
                }
            }
            other => Err(CompileError::parser(
                format!("Expected expression, got {}", describe(&other)),
                start,
            )),
        }
    }

    /// `$in.N`, `$out.name`, or the short form `$N` for input port N.
    fn parse_port(&mut self, name: &str, start: Span) -> Result<NodeId, CompileError> {
        if let Ok(index) = name.parse::<usize>() {
            let port = PortRef::Index(index);
            let kind = NodeKind::Port {
                dir: PortDir::Input,
                port,
            };
            return Ok(self.node(kind, start, Vec::new()));
        }
        let dir = match name {
            "in" => PortDir::Input,
            "out" => PortDir::Output,
            _ => {
                return Err(CompileError::parser(
                    format!("Unknown record reference '${name}', expected $in or $out"),
                    start,
                ))
            }
        };
        self.expect(&Token::Dot)?;
        let port = match self.peek().clone() {
            Token::Int(i) => PortRef::Index(usize::try_from(i).unwrap_or(usize::MAX)),
            Token::Ident(port_name) => PortRef::Name(port_name),
            other => {
                return Err(CompileError::parser(
                    format!("Expected port number or name, got {}", describe(&other)),
                    self.span(),
                ))
            }
        };
        self.advance();
        let span = start.merge(self.prev_span());
        Ok(self.node(NodeKind::Port { dir, port }, span, Vec::new()))
    }

    /// `sequence(name[, type]).next()`
    fn parse_sequence(&mut self, start: Span) -> Result<NodeId, CompileError> {
        self.advance();
        self.expect(&Token::LParen)?;
        let (name, _) = self.expect_ident()?;
        let ty = if self.eat(&Token::Comma) { Some(self.parse_type()?) } else { None };
        self.expect(&Token::RParen)?;
        self.expect(&Token::Dot)?;
        let (method, method_span) = self.expect_ident()?;
        let op = match method.as_str() {
            "next" => SequenceOp::Next,
            "current" => SequenceOp::Current,
            "reset" => SequenceOp::Reset,
            _ => {
                return Err(CompileError::parser(
                    format!("Unknown sequence operation '{method}'"),
                    method_span,
                ))
            }
        };
        self.expect(&Token::LParen)?;
        let end = self.expect(&Token::RParen)?;
        Ok(self.node(NodeKind::Sequence { name, ty, op }, start.merge(end), Vec::new()))
    }

    /// `lookup(name).get(keys...)`
    fn parse_lookup(&mut self, start: Span) -> Result<NodeId, CompileError> {
        self.advance();
        self.expect(&Token::LParen)?;
        let (name, _) = self.expect_ident()?;
        self.expect(&Token::RParen)?;
        self.expect(&Token::Dot)?;
        let (method, method_span) = self.expect_ident()?;
        let op = match method.as_str() {
            "get" => LookupOp::Get,
            "count" => LookupOp::Count,
            "next" => LookupOp::Next,
            "init" => LookupOp::Init,
            "free" => LookupOp::Free,
            _ => {
                return Err(CompileError::parser(
                    format!("Unknown lookup operation '{method}'"),
                    method_span,
                ))
            }
        };
        let keys = self.parse_arguments()?;
        let span = start.merge(self.prev_span());
        Ok(self.node(NodeKind::Lookup { name, op }, span, keys))
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(name) => format!("identifier '{name}'"),
        Token::Int(v) => format!("integer {v}"),
        Token::String(_) => "string literal".to_string(),
        Token::Semicolon => "';'".to_string(),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
        Token::LBrace => "'{'".to_string(),
        Token::RBrace => "'}'".to_string(),
        Token::LBracket => "'['".to_string(),
        Token::RBracket => "']'".to_string(),
        Token::Colon => "':'".to_string(),
        Token::Comma => "','".to_string(),
        Token::Dot => "'.'".to_string(),
        Token::Arrow => "'->'".to_string(),
        Token::Eq => "'='".to_string(),
        Token::Eof => "end of input".to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dsl::lexer::lex;

    fn parse_src(src: &str) -> Ast {
        parse(lex(src).unwrap()).unwrap()
    }

    fn top(ast: &Ast) -> Vec<NodeId> {
        ast.children(ast.root().unwrap()).to_vec()
    }

    #[test]
    fn variable_declarations() {
        let ast = parse_src("integer i = 10; long l; string[] names = []; map[string, integer] m;");
        let items = top(&ast);
        assert_eq!(items.len(), 4);
        assert!(matches!(
            ast.kind(items[2]),
            NodeKind::VariableDeclaration { ty: TypeRef::List(_), .. }
        ));
        assert!(matches!(
            ast.kind(items[3]),
            NodeKind::VariableDeclaration { ty: TypeRef::Map(..), .. }
        ));
    }

    #[test]
    fn function_declaration_layout() {
        let ast = parse_src("function integer sum(integer a, integer b) { return a + b; }");
        let f = top(&ast)[0];
        assert!(matches!(ast.kind(f), NodeKind::FunctionDeclaration { name, .. } if name == "sum"));
        let params = ast.child(f, 0).unwrap();
        assert_eq!(ast.children(params).len(), 2);
        assert!(matches!(ast.kind(ast.child(f, 1).unwrap()), NodeKind::Block));
    }

    #[test]
    fn precedence_multiplication_binds_tighter() {
        let ast = parse_src("x = 1 + 2 * 3;");
        let assign = top(&ast)[0];
        let sum = ast.child(assign, 1).unwrap();
        assert!(matches!(ast.kind(sum), NodeKind::Binary { op: BinaryOp::Add }));
        let product = ast.child(sum, 1).unwrap();
        assert!(matches!(ast.kind(product), NodeKind::Binary { op: BinaryOp::Mul }));
    }

    #[test]
    fn nested_ternary() {
        let ast = parse_src("x = a ? b ? 1 : 2 : c ? 3 : 4;");
        let cond = ast.child(top(&ast)[0], 1).unwrap();
        assert!(matches!(ast.kind(cond), NodeKind::Conditional));
        assert!(matches!(ast.kind(ast.child(cond, 1).unwrap()), NodeKind::Conditional));
        assert!(matches!(ast.kind(ast.child(cond, 2).unwrap()), NodeKind::Conditional));
    }

    #[test]
    fn switch_is_flat() {
        let ast = parse_src("switch (x) { case 0: a(); case 1: b(); break; default: c(); }");
        let sw = top(&ast)[0];
        let kinds: Vec<&str> = ast.children(sw).iter().map(|c| ast.kind(*c).name()).collect();
        assert_eq!(kinds, ["Identifier", "Case", "Call", "Case", "Call", "Break", "Case", "Call"]);
    }

    #[test]
    fn negative_case_label_is_literal() {
        let ast = parse_src("switch (x) { case -5: break; }");
        let case = ast.child(top(&ast)[0], 1).unwrap();
        let label = ast.child(case, 0).unwrap();
        assert_eq!(ast.kind(label), &NodeKind::Literal(Literal::Integer(-5)));
    }

    #[test]
    fn for_with_absent_clauses() {
        let ast = parse_src("for (;;) { break; }");
        let f = top(&ast)[0];
        let kinds: Vec<&str> = ast.children(f).iter().map(|c| ast.kind(*c).name()).collect();
        assert_eq!(kinds, ["Empty", "Empty", "Empty", "Block"]);
    }

    #[test]
    fn ports_and_fields() {
        let ast = parse_src("$out.0.* = $in.0.*; $out.0.name = $in.customers.1;");
        let items = top(&ast);
        let lhs = ast.child(items[0], 0).unwrap();
        assert_eq!(ast.kind(lhs), &NodeKind::Member { field: FieldSel::Star });
        let rhs = ast.child(items[1], 1).unwrap();
        assert_eq!(ast.kind(rhs), &NodeKind::Member { field: FieldSel::Index(1) });
        let port = ast.child(rhs, 0).unwrap();
        assert_eq!(
            ast.kind(port),
            &NodeKind::Port { dir: PortDir::Input, port: PortRef::Name("customers".into()) }
        );
    }

    #[test]
    fn method_call_sugar() {
        let ast = parse_src("n = s.length();");
        let call = ast.child(top(&ast)[0], 1).unwrap();
        assert!(matches!(ast.kind(call), NodeKind::Call { name } if name == "length"));
        assert_eq!(ast.children(call).len(), 1);
    }

    #[test]
    fn record_typed_declarations() {
        let ast = parse_src("person p; person[] people;");
        let items = top(&ast);
        assert!(matches!(
            ast.kind(items[0]),
            NodeKind::VariableDeclaration { ty: TypeRef::Named(n), .. } if n == "person"
        ));
        assert!(matches!(
            ast.kind(items[1]),
            NodeKind::VariableDeclaration { ty: TypeRef::List(_), .. }
        ));
    }

    #[test]
    fn sequence_and_lookup() {
        let ast = parse_src("x = sequence(ids, long).next(); r = lookup(people).get(1, \"a\");");
        let items = top(&ast);
        let seq = ast.child(items[0], 1).unwrap();
        assert!(matches!(
            ast.kind(seq),
            NodeKind::Sequence { op: SequenceOp::Next, ty: Some(TypeRef::Long), .. }
        ));
        let lk = ast.child(items[1], 1).unwrap();
        assert_eq!(ast.children(lk).len(), 2);
    }

    #[test]
    fn map_literal() {
        let ast = parse_src("m = {\"a\" -> 1, \"b\" -> 2};");
        let lit = ast.child(top(&ast)[0], 1).unwrap();
        assert_eq!(ast.children(lit).len(), 4);
    }

    #[test]
    fn errors_are_collected() {
        let errors = parse(lex("integer = ; x = ;").unwrap()).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn missing_semicolon() {
        let errors = parse(lex("x = 1 y = 2;").unwrap()).unwrap_err();
        assert!(errors[0].message.contains("Expected ';'"));
    }
}
