use std::fmt::Write;

use crate::frontend::token::{Token, TokenKind};

/// Renders a token stream for `froth tokens`.
pub struct TokenDumper {
    pub color: bool,
    pub show_offsets: bool,
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_offsets: false,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const RED: &'static str = "\x1b[31m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn with_offsets(mut self) -> Self {
        self.show_offsets = true;
        self
    }

    pub fn dump(&self, tokens: &[Token]) {
        print!("{}", self.render(tokens));
    }

    pub fn render(&self, tokens: &[Token]) -> String {
        let mut out = String::new();
        for t in tokens {
            self.render_one(&mut out, t);
        }
        out
    }

    fn render_one(&self, out: &mut String, t: &Token) {
        let colr = if self.color { self.color(t.kind) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };

        let _ = write!(out, "[{:02}:{:02}]", t.line, t.column);
        if self.show_offsets {
            let _ = write!(out, " @{:<5}", t.offset);
        }
        let _ = writeln!(
            out,
            " {}{:<8} {:?}{}",
            colr,
            self.category(t.kind),
            t.text,
            reset
        );
    }

    fn category(&self, kind: TokenKind) -> &'static str {
        use TokenKind::*;
        match kind {
            Eof => "EOF",
            Invalid => "INVALID",

            Number | HexNumber | NegNumber => "INT",
            Float | NegFloat => "FLOAT",
            Str => "STRING",

            Identifier => "IDENT",

            LBrace | RBrace => "LABEL",
            Lt | Gt => "TAG",
            Comma | RParen | ProgramOpen | AnnotatedColon | Colon | Semicolon | DashDash => {
                "PUNCT"
            }

            Plus | Minus | Star | Slash => "OP",

            // everything else = keyword
            _ => "KEYWORD",
        }
    }

    fn color(&self, kind: TokenKind) -> &'static str {
        use TokenKind::*;
        match kind {
            Eof => Self::DIM,
            Invalid => Self::RED,
            Str => Self::GRN,
            Number | HexNumber | NegNumber | Float | NegFloat => Self::CYN,
            Identifier => Self::YEL,
            Plus | Minus | Star | Slash => Self::MAG,
            _ => Self::RESET,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::tokenize;

    #[test]
    fn test_render_plain() {
        let out = TokenDumper::new().no_color().render(&tokenize("DUP 5"));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("[01:01] IDENT"));
        assert!(lines[0].contains("\"DUP\""));
        assert!(lines[1].contains("INT"));
        assert!(lines[2].contains("EOF"));
    }

    #[test]
    fn test_render_offsets() {
        let out = TokenDumper::new()
            .no_color()
            .with_offsets()
            .render(&tokenize("  IF"));
        assert!(out.starts_with("[01:03] @2"));
        assert!(out.contains("KEYWORD"));
    }

    #[test]
    fn test_invalid_highlighted() {
        let out = TokenDumper::new().render(&tokenize("$"));
        assert!(out.contains("INVALID"));
        assert!(out.contains(TokenDumper::RED));
    }
}
