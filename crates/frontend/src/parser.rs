//! Recursive-descent parser with precedence climbing for binary operators.

use crate::ast::{
    BinOp, Expr, ExprId, ExprKind, FuncDecl, LitKind, Module, Param, Stmt, StmtId, StmtKind,
};
use crate::lexer::Lexer;
use crate::token::{Keyword, Token, TokenKind};
use crate::{ParseError, ParseResult};

pub struct Parser {
    file: String,
    tokens: Vec<Token>,
    pos: usize,
    module: Module,
}

impl Parser {
    pub fn new(file: &str, source: &str) -> ParseResult<Parser> {
        let tokens = Lexer::new(file, source).lex_all()?;
        Ok(Parser { file: file.to_string(), tokens, pos: 0, module: Module::default() })
    }

    /// Parse the whole file into a module.
    pub fn parse_module(mut self) -> ParseResult<Module> {
        let mut body = Vec::new();
        while !self.at_eof() {
            body.push(self.parse_stmt()?);
            self.skip_semis();
        }
        self.module.body = body;
        Ok(self.module)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn skip_semis(&mut self) {
        while matches!(self.peek().kind, TokenKind::Semi) {
            self.bump();
        }
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> ParseError {
        ParseError {
            file: self.file.clone(),
            line: token.line,
            col: token.col,
            message: message.into(),
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> ParseResult<Token> {
        let token = self.peek().clone();
        if token.kind == kind {
            Ok(self.bump())
        } else {
            Err(self.error_at(&token, format!("expected {what}, got {}", token.kind.describe())))
        }
    }

    fn add_expr(&mut self, kind: ExprKind, line: u32, col: u32) -> ExprId {
        self.module.exprs.push(Expr { kind, line, col })
    }

    fn add_stmt(&mut self, kind: StmtKind, line: u32, col: u32) -> StmtId {
        self.module.stmts.push(Stmt { kind, line, col })
    }

    fn parse_stmt(&mut self) -> ParseResult<StmtId> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Keyword(Keyword::Function) => self.parse_callable(false),
            TokenKind::Keyword(Keyword::Graph) => self.parse_callable(true),
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::Return) => {
                self.bump();
                let value = if matches!(
                    self.peek().kind,
                    TokenKind::Semi | TokenKind::RBrace | TokenKind::Eof
                ) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                Ok(self.add_stmt(StmtKind::Return(value), token.line, token.col))
            }
            TokenKind::Keyword(Keyword::Cin) => {
                self.bump();
                self.expect(TokenKind::Shr, "'>>' after cin")?;
                let name = self.parse_name()?;
                Ok(self.add_stmt(StmtKind::StdCin(name), token.line, token.col))
            }
            TokenKind::Keyword(Keyword::Cout) => {
                self.bump();
                self.expect(TokenKind::Shl, "'<<' after cout")?;
                let value = self.parse_expr()?;
                Ok(self.add_stmt(StmtKind::StdCout(value), token.line, token.col))
            }
            TokenKind::LBrace => {
                let body = self.parse_block()?;
                Ok(self.add_stmt(StmtKind::Block(body), token.line, token.col))
            }
            TokenKind::Keyword(kw @ (Keyword::For | Keyword::Class)) => Err(self.error_at(
                &token,
                format!("'{}' statements are not supported yet", kw.as_str()),
            )),
            _ => {
                let expr = self.parse_expr()?;
                if matches!(self.peek().kind, TokenKind::Assign) {
                    if !matches!(self.module.expr(expr).kind, ExprKind::Name(_)) {
                        let eq = self.peek().clone();
                        return Err(self.error_at(&eq, "assignment target must be a name"));
                    }
                    self.bump();
                    let value = self.parse_expr()?;
                    return Ok(self.add_stmt(
                        StmtKind::Assign { target: expr, value },
                        token.line,
                        token.col,
                    ));
                }
                Ok(self.add_stmt(StmtKind::Expr(expr), token.line, token.col))
            }
        }
    }

    fn parse_callable(&mut self, graph: bool) -> ParseResult<StmtId> {
        let keyword = self.bump();
        let name_token = self.peek().clone();
        let TokenKind::Ident(name) = name_token.kind.clone() else {
            return Err(self.error_at(
                &name_token,
                format!(
                    "expected {} name, got {}",
                    if graph { "graph" } else { "function" },
                    name_token.kind.describe()
                ),
            ));
        };
        self.bump();
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !matches!(self.peek().kind, TokenKind::RParen) {
            loop {
                let param_token = self.peek().clone();
                let TokenKind::Ident(param_name) = param_token.kind.clone() else {
                    return Err(self.error_at(
                        &param_token,
                        format!("expected parameter name, got {}", param_token.kind.describe()),
                    ));
                };
                self.bump();
                let default = if matches!(self.peek().kind, TokenKind::Assign) {
                    self.bump();
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                params.push(Param {
                    name: param_name,
                    default,
                    line: param_token.line,
                    col: param_token.col,
                });
                if matches!(self.peek().kind, TokenKind::Comma) {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        let body = self.parse_block()?;
        let decl = FuncDecl { name, params, body };
        let kind = if graph { StmtKind::Graph(decl) } else { StmtKind::Function(decl) };
        Ok(self.add_stmt(kind, keyword.line, keyword.col))
    }

    fn parse_if(&mut self) -> ParseResult<StmtId> {
        let keyword = self.bump();
        let cond = self.parse_expr()?;
        let then_body = self.parse_block()?;
        let else_body = if matches!(self.peek().kind, TokenKind::Keyword(Keyword::Else)) {
            self.bump();
            if matches!(self.peek().kind, TokenKind::Keyword(Keyword::If)) {
                vec![self.parse_if()?]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };
        Ok(self.add_stmt(StmtKind::If { cond, then_body, else_body }, keyword.line, keyword.col))
    }

    fn parse_while(&mut self) -> ParseResult<StmtId> {
        let keyword = self.bump();
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(self.add_stmt(StmtKind::While { cond, body }, keyword.line, keyword.col))
    }

    fn parse_block(&mut self) -> ParseResult<Vec<StmtId>> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut body = Vec::new();
        self.skip_semis();
        while !matches!(self.peek().kind, TokenKind::RBrace | TokenKind::Eof) {
            body.push(self.parse_stmt()?);
            self.skip_semis();
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(body)
    }

    fn parse_name(&mut self) -> ParseResult<ExprId> {
        let token = self.peek().clone();
        let TokenKind::Ident(name) = token.kind.clone() else {
            return Err(
                self.error_at(&token, format!("expected a name, got {}", token.kind.describe()))
            );
        };
        self.bump();
        Ok(self.add_expr(ExprKind::Name(name), token.line, token.col))
    }

    fn parse_expr(&mut self) -> ParseResult<ExprId> {
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> ParseResult<ExprId> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::NotEq => BinOp::Ne,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Ge => BinOp::Ge,
                _ => return Ok(lhs),
            };
            let token = self.bump();
            let rhs = self.parse_additive()?;
            lhs = self.add_expr(ExprKind::Binary { op, lhs, rhs }, token.line, token.col);
        }
    }

    fn parse_additive(&mut self) -> ParseResult<ExprId> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            let token = self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = self.add_expr(ExprKind::Binary { op, lhs, rhs }, token.line, token.col);
        }
    }

    fn parse_multiplicative(&mut self) -> ParseResult<ExprId> {
        let mut lhs = self.parse_postfix()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => return Ok(lhs),
            };
            let token = self.bump();
            let rhs = self.parse_postfix()?;
            lhs = self.add_expr(ExprKind::Binary { op, lhs, rhs }, token.line, token.col);
        }
    }

    fn parse_postfix(&mut self) -> ParseResult<ExprId> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek().kind {
                TokenKind::Dot => {
                    let token = self.bump();
                    let attr_token = self.peek().clone();
                    let TokenKind::Ident(attr) = attr_token.kind.clone() else {
                        return Err(self.error_at(
                            &attr_token,
                            format!(
                                "expected an attribute name, got {}",
                                attr_token.kind.describe()
                            ),
                        ));
                    };
                    self.bump();
                    expr = self.add_expr(
                        ExprKind::Attribute { base: expr, attr },
                        token.line,
                        token.col,
                    );
                }
                TokenKind::LParen => {
                    let token = self.bump();
                    let mut args = Vec::new();
                    if !matches!(self.peek().kind, TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if matches!(self.peek().kind, TokenKind::Comma) {
                                self.bump();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, "')'")?;
                    expr = self.add_expr(
                        ExprKind::Call { callee: expr, args },
                        token.line,
                        token.col,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> ParseResult<ExprId> {
        let token = self.peek().clone();
        match token.kind.clone() {
            TokenKind::Ident(name) => {
                self.bump();
                Ok(self.add_expr(ExprKind::Name(name), token.line, token.col))
            }
            // `ops` reads as a name so `ops.NAME` parses as an attribute.
            TokenKind::Keyword(Keyword::Ops) => {
                self.bump();
                Ok(self.add_expr(ExprKind::Name("ops".into()), token.line, token.col))
            }
            TokenKind::Int(text) => {
                self.bump();
                Ok(self.add_expr(
                    ExprKind::Literal { kind: LitKind::Int, text },
                    token.line,
                    token.col,
                ))
            }
            TokenKind::Float(text) => {
                self.bump();
                Ok(self.add_expr(
                    ExprKind::Literal { kind: LitKind::Float, text },
                    token.line,
                    token.col,
                ))
            }
            TokenKind::Str(text) => {
                self.bump();
                Ok(self.add_expr(
                    ExprKind::Literal { kind: LitKind::Str, text },
                    token.line,
                    token.col,
                ))
            }
            TokenKind::Bool(value) => {
                self.bump();
                Ok(self.add_expr(
                    ExprKind::Literal { kind: LitKind::Bool, text: value.to_string() },
                    token.line,
                    token.col,
                ))
            }
            TokenKind::LParen => {
                self.bump();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            other => {
                Err(self
                    .error_at(&token, format!("expected an expression, got {}", other.describe())))
            }
        }
    }
}
