//! The arena-allocated AST.
//!
//! Statements and expressions live in per-module entity arenas; nodes refer
//! to each other by [`ExprId`] / [`StmtId`] rather than by pointer.

use core::fmt::Write;

use cranelift_entity::{entity_impl, PrimaryMap};

/// An opaque reference to an expression in a [`Module`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ExprId(u32);
entity_impl!(ExprId, "expr");

/// An opaque reference to a statement in a [`Module`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct StmtId(u32);
entity_impl!(StmtId, "stmt");

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
        }
    }

    pub fn is_compare(self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LitKind {
    Bool,
    Int,
    Float,
    Str,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Name(String),
    Literal { kind: LitKind, text: String },
    Binary { op: BinOp, lhs: ExprId, rhs: ExprId },
    /// `base.attr`, as in `ops.add`.
    Attribute { base: ExprId, attr: String },
    Call { callee: ExprId, args: Vec<ExprId> },
}

#[derive(Clone, Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
    pub col: u32,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub default: Option<ExprId>,
    pub line: u32,
    pub col: u32,
}

#[derive(Clone, Debug)]
pub struct FuncDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<StmtId>,
}

#[derive(Clone, Debug)]
pub enum StmtKind {
    Expr(ExprId),
    Assign { target: ExprId, value: ExprId },
    Return(Option<ExprId>),
    If { cond: ExprId, then_body: Vec<StmtId>, else_body: Vec<StmtId> },
    While { cond: ExprId, body: Vec<StmtId> },
    Function(FuncDecl),
    Graph(FuncDecl),
    Block(Vec<StmtId>),
    /// `cin >> name`
    StdCin(ExprId),
    /// `cout << expr`
    StdCout(ExprId),
}

#[derive(Clone, Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
    pub col: u32,
}

/// A parsed source file: the statement/expression arenas plus the
/// top-level statement list.
#[derive(Default, Debug)]
pub struct Module {
    pub exprs: PrimaryMap<ExprId, Expr>,
    pub stmts: PrimaryMap<StmtId, Stmt>,
    pub body: Vec<StmtId>,
}

impl Module {
    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id]
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id]
    }

    /// An indented dump of the AST, for the CLI's `-p` flag.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for &stmt in &self.body {
            self.dump_stmt(&mut out, stmt, 0);
        }
        out
    }

    fn dump_stmt(&self, out: &mut String, id: StmtId, depth: usize) {
        let pad = "  ".repeat(depth);
        match &self.stmt(id).kind {
            StmtKind::Expr(expr) => {
                let _ = writeln!(out, "{pad}Expr {}", self.expr_text(*expr));
            }
            StmtKind::Assign { target, value } => {
                let _ = writeln!(
                    out,
                    "{pad}Assign {} = {}",
                    self.expr_text(*target),
                    self.expr_text(*value)
                );
            }
            StmtKind::Return(value) => match value {
                Some(value) => {
                    let _ = writeln!(out, "{pad}Return {}", self.expr_text(*value));
                }
                None => {
                    let _ = writeln!(out, "{pad}Return");
                }
            },
            StmtKind::If { cond, then_body, else_body } => {
                let _ = writeln!(out, "{pad}If {}", self.expr_text(*cond));
                for &s in then_body {
                    self.dump_stmt(out, s, depth + 1);
                }
                if !else_body.is_empty() {
                    let _ = writeln!(out, "{pad}Else");
                    for &s in else_body {
                        self.dump_stmt(out, s, depth + 1);
                    }
                }
            }
            StmtKind::While { cond, body } => {
                let _ = writeln!(out, "{pad}While {}", self.expr_text(*cond));
                for &s in body {
                    self.dump_stmt(out, s, depth + 1);
                }
            }
            StmtKind::Function(decl) => {
                let _ = writeln!(out, "{pad}Function {}({})", decl.name, self.params_text(decl));
                for &s in &decl.body {
                    self.dump_stmt(out, s, depth + 1);
                }
            }
            StmtKind::Graph(decl) => {
                let _ = writeln!(out, "{pad}Graph {}({})", decl.name, self.params_text(decl));
                for &s in &decl.body {
                    self.dump_stmt(out, s, depth + 1);
                }
            }
            StmtKind::Block(body) => {
                let _ = writeln!(out, "{pad}Block");
                for &s in body {
                    self.dump_stmt(out, s, depth + 1);
                }
            }
            StmtKind::StdCin(target) => {
                let _ = writeln!(out, "{pad}StdCin {}", self.expr_text(*target));
            }
            StmtKind::StdCout(value) => {
                let _ = writeln!(out, "{pad}StdCout {}", self.expr_text(*value));
            }
        }
    }

    fn params_text(&self, decl: &FuncDecl) -> String {
        decl.params
            .iter()
            .map(|p| p.name.clone())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// A single-line rendering of an expression.
    pub fn expr_text(&self, id: ExprId) -> String {
        match &self.expr(id).kind {
            ExprKind::Name(name) => name.clone(),
            ExprKind::Literal { kind: LitKind::Str, text } => format!("'{text}'"),
            ExprKind::Literal { text, .. } => text.clone(),
            ExprKind::Binary { op, lhs, rhs } => {
                format!("({} {} {})", self.expr_text(*lhs), op.as_str(), self.expr_text(*rhs))
            }
            ExprKind::Attribute { base, attr } => {
                format!("{}.{attr}", self.expr_text(*base))
            }
            ExprKind::Call { callee, args } => {
                let args = args
                    .iter()
                    .map(|&a| self.expr_text(a))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{}({args})", self.expr_text(*callee))
            }
        }
    }
}
