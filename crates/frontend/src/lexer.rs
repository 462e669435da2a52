//! The hand-written lexer.

use crate::token::{Keyword, Token, TokenKind};
use crate::{ParseError, ParseResult};

pub struct Lexer<'a> {
    file: String,
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(file: &str, source: &'a str) -> Lexer<'a> {
        Lexer { file: file.to_string(), src: source.as_bytes(), pos: 0, line: 1, col: 1 }
    }

    /// Lex the whole input, with a trailing EOF token.
    pub fn lex_all(mut self) -> ParseResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn error(&self, line: u32, col: u32, message: impl Into<String>) -> ParseError {
        ParseError { file: self.file.clone(), line, col, message: message.into() }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(byte)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.bump();
                }
                Some(b'/') if self.peek2() == Some(b'/') => {
                    while let Some(byte) = self.peek() {
                        if byte == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    fn next_token(&mut self) -> ParseResult<Token> {
        self.skip_trivia();
        let (line, col) = (self.line, self.col);
        let token = |kind| Token { kind, line, col };

        let Some(byte) = self.peek() else {
            return Ok(token(TokenKind::Eof));
        };
        match byte {
            b'0'..=b'9' => self.lex_number(line, col),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => Ok(self.lex_ident(line, col)),
            b'\'' | b'"' => self.lex_string(line, col),
            _ => {
                self.bump();
                let kind = match byte {
                    b'+' => TokenKind::Plus,
                    b'-' => TokenKind::Minus,
                    b'*' => TokenKind::Star,
                    b'/' => TokenKind::Slash,
                    b'(' => TokenKind::LParen,
                    b')' => TokenKind::RParen,
                    b'{' => TokenKind::LBrace,
                    b'}' => TokenKind::RBrace,
                    b',' => TokenKind::Comma,
                    b'.' => TokenKind::Dot,
                    b';' => TokenKind::Semi,
                    b'=' => {
                        if self.peek() == Some(b'=') {
                            self.bump();
                            TokenKind::EqEq
                        } else {
                            TokenKind::Assign
                        }
                    }
                    b'!' => {
                        if self.peek() == Some(b'=') {
                            self.bump();
                            TokenKind::NotEq
                        } else {
                            return Err(self.error(line, col, "unexpected character '!'"));
                        }
                    }
                    b'<' => match self.peek() {
                        Some(b'=') => {
                            self.bump();
                            TokenKind::Le
                        }
                        Some(b'<') => {
                            self.bump();
                            TokenKind::Shl
                        }
                        _ => TokenKind::Lt,
                    },
                    b'>' => match self.peek() {
                        Some(b'=') => {
                            self.bump();
                            TokenKind::Ge
                        }
                        Some(b'>') => {
                            self.bump();
                            TokenKind::Shr
                        }
                        _ => TokenKind::Gt,
                    },
                    other => {
                        return Err(self.error(
                            line,
                            col,
                            format!("unexpected character '{}'", other as char),
                        ));
                    }
                };
                Ok(token(kind))
            }
        }
    }

    fn lex_number(&mut self, line: u32, col: u32) -> ParseResult<Token> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.bump();
        }
        let mut float = false;
        if self.peek() == Some(b'.') && matches!(self.peek2(), Some(b'0'..=b'9')) {
            float = true;
            self.bump();
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.bump();
            }
        }
        let text = core::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error(line, col, "invalid number literal"))?
            .to_string();
        let kind = if float { TokenKind::Float(text) } else { TokenKind::Int(text) };
        Ok(Token { kind, line, col })
    }

    fn lex_ident(&mut self, line: u32, col: u32) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')) {
            self.bump();
        }
        let text = core::str::from_utf8(&self.src[start..self.pos])
            .unwrap_or_default()
            .to_string();
        let kind = match text.as_str() {
            "true" => TokenKind::Bool(true),
            "false" => TokenKind::Bool(false),
            _ => match Keyword::from_ident(&text) {
                Some(kw) => TokenKind::Keyword(kw),
                None => TokenKind::Ident(text),
            },
        };
        Token { kind, line, col }
    }

    fn lex_string(&mut self, line: u32, col: u32) -> ParseResult<Token> {
        let quote = self.bump().unwrap_or(b'"');
        let mut text = String::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => {
                    return Err(self.error(line, col, "unterminated string literal"));
                }
                Some(byte) if byte == quote => break,
                Some(b'\\') => {
                    let escaped = self
                        .bump()
                        .ok_or_else(|| self.error(line, col, "unterminated escape sequence"))?;
                    match escaped {
                        b'n' => text.push('\n'),
                        b'r' => text.push('\r'),
                        b't' => text.push('\t'),
                        b'\\' => text.push('\\'),
                        b'\'' => text.push('\''),
                        b'"' => text.push('"'),
                        other => {
                            return Err(self.error(
                                line,
                                col,
                                format!("unknown escape sequence '\\{}'", other as char),
                            ));
                        }
                    }
                }
                Some(byte) => text.push(byte as char),
            }
        }
        Ok(Token { kind: TokenKind::Str(text), line, col })
    }
}
