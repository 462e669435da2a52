//! Source tokens.

use core::fmt;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Keyword {
    Function,
    Graph,
    If,
    Else,
    While,
    Return,
    Ops,
    Cin,
    Cout,
    // Recognized but not yet compilable.
    For,
    Class,
}

impl Keyword {
    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Function => "function",
            Keyword::Graph => "graph",
            Keyword::If => "if",
            Keyword::Else => "else",
            Keyword::While => "while",
            Keyword::Return => "return",
            Keyword::Ops => "ops",
            Keyword::Cin => "cin",
            Keyword::Cout => "cout",
            Keyword::For => "for",
            Keyword::Class => "class",
        }
    }

    pub fn from_ident(ident: &str) -> Option<Keyword> {
        Some(match ident {
            "function" => Keyword::Function,
            "graph" => Keyword::Graph,
            "if" => Keyword::If,
            "else" => Keyword::Else,
            "while" => Keyword::While,
            "return" => Keyword::Return,
            "ops" => Keyword::Ops,
            "cin" => Keyword::Cin,
            "cout" => Keyword::Cout,
            "for" => Keyword::For,
            "class" => Keyword::Class,
            _ => return None,
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum TokenKind {
    Ident(String),
    Int(String),
    Float(String),
    /// Escape sequences already processed.
    Str(String),
    Bool(bool),
    Keyword(Keyword),

    Plus,
    Minus,
    Star,
    Slash,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Semi,
    /// `>>`, the stdin operator.
    Shr,
    /// `<<`, the stdout operator.
    Shl,

    Eof,
}

impl TokenKind {
    /// The token's printable spelling, for diagnostics and `-l` output.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier '{name}'"),
            TokenKind::Int(text) => format!("int {text}"),
            TokenKind::Float(text) => format!("float {text}"),
            TokenKind::Str(text) => format!("string '{}'", text.escape_default()),
            TokenKind::Bool(value) => format!("bool {value}"),
            TokenKind::Keyword(kw) => format!("keyword '{}'", kw.as_str()),
            TokenKind::Plus => "'+'".into(),
            TokenKind::Minus => "'-'".into(),
            TokenKind::Star => "'*'".into(),
            TokenKind::Slash => "'/'".into(),
            TokenKind::Assign => "'='".into(),
            TokenKind::EqEq => "'=='".into(),
            TokenKind::NotEq => "'!='".into(),
            TokenKind::Lt => "'<'".into(),
            TokenKind::Gt => "'>'".into(),
            TokenKind::Le => "'<='".into(),
            TokenKind::Ge => "'>='".into(),
            TokenKind::LParen => "'('".into(),
            TokenKind::RParen => "')'".into(),
            TokenKind::LBrace => "'{'".into(),
            TokenKind::RBrace => "'}'".into(),
            TokenKind::Comma => "','".into(),
            TokenKind::Dot => "'.'".into(),
            TokenKind::Semi => "';'".into(),
            TokenKind::Shr => "'>>'".into(),
            TokenKind::Shl => "'<<'".into(),
            TokenKind::Eof => "end of file".into(),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}\t{}", self.line, self.col, self.kind.describe())
    }
}
