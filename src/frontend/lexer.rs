use crate::frontend::token::{Token, TokenKind};

/// Hand-written scanner for Froth source.
///
/// The lexer never fails. Anything it cannot classify becomes a
/// `TokenKind::Invalid` token and the compiler reports it in place, so a
/// single stray character does not hide the errors after it.
pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    offset: usize,
    line: usize,
    col: usize,
}

struct Mark {
    offset: usize,
    line: usize,
    col: usize,
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '!' || ch == '@'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '!' || ch == '@' || ch == '?'
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            offset: 0,
            line: 1,
            col: 1,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current()?;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        self.offset += ch.len_utf8();
        Some(ch)
    }

    fn mark(&self) -> Mark {
        Mark {
            offset: self.offset,
            line: self.line,
            col: self.col,
        }
    }

    fn token(&self, kind: TokenKind, text: impl Into<String>, at: &Mark) -> Token {
        Token::new(kind, text, at.offset, at.line, at.col)
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
            } else if ch == '/' && self.peek() == Some('/') {
                while let Some(c) = self.current() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn read_while(&mut self, buf: &mut String, pred: impl Fn(char) -> bool) {
        while let Some(ch) = self.current() {
            if !pred(ch) {
                break;
            }
            buf.push(ch);
            self.advance();
        }
    }

    fn read_string(&mut self, at: &Mark) -> Token {
        let quote = self.advance().unwrap_or('"');
        let mut text = String::new();
        loop {
            match self.current() {
                Some(ch) if ch == quote => {
                    self.advance();
                    return self.token(TokenKind::Str, text, at);
                }
                Some('\n') | None => {
                    return self.token(TokenKind::Invalid, format!("{}{}", quote, text), at);
                }
                Some(ch) => {
                    text.push(ch);
                    self.advance();
                }
            }
        }
    }

    /// Reads a decimal, hex or float literal. A leading '-' has already
    /// been consumed into `text` when `negative` is set.
    fn read_number(&mut self, at: &Mark, mut text: String, negative: bool) -> Token {
        if !negative && self.current() == Some('0') && matches!(self.peek(), Some('x' | 'X')) {
            text.push('0');
            self.advance();
            if let Some(x) = self.advance() {
                text.push(x);
            }
            let before = text.len();
            self.read_while(&mut text, |c| c.is_ascii_hexdigit());
            if text.len() == before {
                return self.token(TokenKind::Invalid, text, at);
            }
            return self.token(TokenKind::HexNumber, text, at);
        }

        self.read_while(&mut text, |c| c.is_ascii_digit());

        if self.current() == Some('.') && self.peek().is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            self.read_while(&mut text, |c| c.is_ascii_digit());
            let kind = if negative {
                TokenKind::NegFloat
            } else {
                TokenKind::Float
            };
            return self.token(kind, text, at);
        }

        let kind = if negative {
            TokenKind::NegNumber
        } else {
            TokenKind::Number
        };
        self.token(kind, text, at)
    }

    fn read_word(&mut self, at: &Mark) -> Token {
        let mut text = String::new();
        self.read_while(&mut text, is_ident_continue);

        if text == "Program" && self.current() == Some('(') {
            self.advance();
            return self.token(TokenKind::ProgramOpen, "Program(", at);
        }

        match TokenKind::keyword(&text) {
            Some(kind) => self.token(kind, text, at),
            None => self.token(TokenKind::Identifier, text, at),
        }
    }

    fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();
        let at = self.mark();

        let Some(ch) = self.current() else {
            return self.token(TokenKind::Eof, "", &at);
        };

        if ch.is_ascii_digit() {
            return self.read_number(&at, String::new(), false);
        }
        if is_ident_start(ch) {
            return self.read_word(&at);
        }
        if ch == '"' || ch == '\'' {
            return self.read_string(&at);
        }

        match (ch, self.peek()) {
            ('-', Some('-')) => {
                self.advance();
                self.advance();
                self.token(TokenKind::DashDash, "--", &at)
            }
            ('-', Some(d)) if d.is_ascii_digit() => {
                self.advance();
                self.read_number(&at, "-".to_string(), true)
            }
            (':', Some('(')) => {
                self.advance();
                self.advance();
                self.token(TokenKind::AnnotatedColon, ":(", &at)
            }
            _ => {
                self.advance();
                let kind = match ch {
                    ':' => TokenKind::Colon,
                    ';' => TokenKind::Semicolon,
                    ',' => TokenKind::Comma,
                    ')' => TokenKind::RParen,
                    '-' => TokenKind::Minus,
                    '+' => TokenKind::Plus,
                    '*' => TokenKind::Star,
                    '/' => TokenKind::Slash,
                    '{' => TokenKind::LBrace,
                    '}' => TokenKind::RBrace,
                    '<' => TokenKind::Lt,
                    '>' => TokenKind::Gt,
                    _ => TokenKind::Invalid,
                };
                self.token(kind, ch.to_string(), &at)
            }
        }
    }

    /// Scans the whole input. The last token is always `Eof`.
    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }
}

pub fn tokenize(source: &str) -> Vec<Token> {
    Lexer::new(source).tokenize()
}
