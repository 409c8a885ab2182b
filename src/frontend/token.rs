use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Eof,

    // Literals
    Identifier,
    Number,
    HexNumber,
    NegNumber,
    Str,
    Float,
    NegFloat,

    // Program header
    ProgramOpen, // Program(
    Comma,
    RParen,
    Global,

    // Word definitions
    AnnotatedColon, // :(
    DashDash,       // --
    Colon,
    Semicolon,

    // Control flow
    If,
    Else,
    EndIf,
    For,
    EndFor,
    Repeat,
    EndRepeat,
    While,
    EndWhile,

    // Math
    Minus,
    Plus,
    Star,
    Slash,

    // Labels and tags
    LBrace,
    RBrace,
    Lt,
    Gt,

    /// A character sequence the lexer could not classify.
    Invalid,
}

impl TokenKind {
    /// Keywords are case sensitive.
    pub fn keyword(text: &str) -> Option<TokenKind> {
        Some(match text {
            "Global" => TokenKind::Global,
            "IF" => TokenKind::If,
            "ELSE" => TokenKind::Else,
            "ENDIF" => TokenKind::EndIf,
            "FOR" => TokenKind::For,
            "ENDFOR" => TokenKind::EndFor,
            "REPEAT" => TokenKind::Repeat,
            "ENDREPEAT" => TokenKind::EndRepeat,
            "WHILE" => TokenKind::While,
            "ENDWHILE" => TokenKind::EndWhile,
            _ => return None,
        })
    }

    /// How the kind reads in an "X expected" diagnostic.
    pub fn describe(&self) -> &'static str {
        match self {
            TokenKind::Eof => "EOF",
            TokenKind::Identifier => "identifier",
            TokenKind::Number => "number",
            TokenKind::HexNumber => "hexnumber",
            TokenKind::NegNumber => "negnumber",
            TokenKind::Str => "string",
            TokenKind::Float => "float",
            TokenKind::NegFloat => "negfloat",
            TokenKind::ProgramOpen => "\"Program(\"",
            TokenKind::Comma => "\",\"",
            TokenKind::RParen => "\")\"",
            TokenKind::Global => "\"Global\"",
            TokenKind::AnnotatedColon => "\":(\"",
            TokenKind::DashDash => "\"--\"",
            TokenKind::Colon => "\":\"",
            TokenKind::Semicolon => "\";\"",
            TokenKind::If => "\"IF\"",
            TokenKind::Else => "\"ELSE\"",
            TokenKind::EndIf => "\"ENDIF\"",
            TokenKind::For => "\"FOR\"",
            TokenKind::EndFor => "\"ENDFOR\"",
            TokenKind::Repeat => "\"REPEAT\"",
            TokenKind::EndRepeat => "\"ENDREPEAT\"",
            TokenKind::While => "\"WHILE\"",
            TokenKind::EndWhile => "\"ENDWHILE\"",
            TokenKind::Minus => "\"-\"",
            TokenKind::Plus => "\"+\"",
            TokenKind::Star => "\"*\"",
            TokenKind::Slash => "\"/\"",
            TokenKind::LBrace => "\"{\"",
            TokenKind::RBrace => "\"}\"",
            TokenKind::Lt => "\"<\"",
            TokenKind::Gt => "\">\"",
            TokenKind::Invalid => "???",
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self,
            TokenKind::Number
                | TokenKind::HexNumber
                | TokenKind::NegNumber
                | TokenKind::Float
                | TokenKind::NegFloat
        )
    }

    pub fn is_math_op(&self) -> bool {
        matches!(
            self,
            TokenKind::Minus | TokenKind::Plus | TokenKind::Star | TokenKind::Slash
        )
    }

    /// First tokens of a statement.
    pub fn starts_statement(&self) -> bool {
        matches!(self, TokenKind::Identifier | TokenKind::LBrace | TokenKind::Lt)
            || self.is_number()
            || self.is_math_op()
    }

    /// First tokens of anything that can appear inside a word body.
    pub fn starts_compound(&self) -> bool {
        matches!(
            self,
            TokenKind::If | TokenKind::For | TokenKind::Repeat | TokenKind::While
        ) || self.starts_statement()
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// A lexeme with its source position.
///
/// `line` and `column` are 1-based; `offset` is a 0-based byte offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn new(
        kind: TokenKind,
        text: impl Into<String>,
        offset: usize,
        line: usize,
        column: usize,
    ) -> Self {
        Token {
            kind,
            text: text.into(),
            offset,
            line,
            column,
        }
    }

    /// Zero-width marker used before the first real token.
    pub fn start() -> Self {
        Token::new(TokenKind::Eof, "", 0, 1, 1)
    }
}
