use thiserror::Error;

use crate::bytecode::stack_check::StackCheckError;
use crate::frontend::token::{Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Characters that do not form a token
    Lexical,
    /// A token the grammar does not allow here
    Syntax,
    /// Well-formed source with a meaning the machine cannot accept
    Semantic,
}

/// One compiler message, anchored to a source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, at: &Token, message: impl Into<String>) -> Self {
        Diagnostic {
            kind,
            line: at.line,
            column: at.column,
            message: message.into(),
        }
    }

    pub fn at(kind: DiagnosticKind, line: usize, column: usize, message: impl Into<String>) -> Self {
        Diagnostic {
            kind,
            line,
            column,
            message: message.into(),
        }
    }

    pub fn invalid_token(at: &Token) -> Self {
        Self::new(
            DiagnosticKind::Lexical,
            at,
            format!("invalid character sequence '{}'", at.text),
        )
    }

    pub fn expected(expected: TokenKind, at: &Token) -> Self {
        Self::new(
            DiagnosticKind::Syntax,
            at,
            format!("{} expected", expected.describe()),
        )
    }

    /// A token that fits none of the alternatives of `rule`.
    pub fn invalid(rule: &str, at: &Token) -> Self {
        Self::new(DiagnosticKind::Syntax, at, format!("invalid {}", rule))
    }

    pub fn already_defined(what: &str, name: &str, at: &Token) -> Self {
        Self::new(
            DiagnosticKind::Semantic,
            at,
            format!("{} '{}' already defined", what, name),
        )
    }

    pub fn unresolved(name: &str, at: &Token) -> Self {
        Self::new(
            DiagnosticKind::Semantic,
            at,
            format!(
                "unresolved symbol '{}': not an opcode, I/O constant, word, label or global",
                name
            ),
        )
    }

    pub fn stack(err: StackCheckError, at: &Token) -> Self {
        Self::new(DiagnosticKind::Semantic, at, err.to_string())
    }

    pub fn semantic(at: &Token, message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Semantic, at, message)
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}) {}", self.line, self.column, self.message)
    }
}

/// Every diagnostic from a failed compilation, in source order of discovery.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", render(.diagnostics))]
pub struct CompileErrors {
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileErrors {
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    /// The closing line printed after the diagnostics.
    pub fn summary(&self) -> String {
        summary(self.diagnostics.len())
    }
}

fn summary(count: usize) -> String {
    if count == 1 {
        "1 error detected.".to_string()
    } else {
        format!("{} errors detected.", count)
    }
}

fn render(diagnostics: &[Diagnostic]) -> String {
    let mut out = String::new();
    for d in diagnostics {
        out.push_str(&d.to_string());
        out.push('\n');
    }
    out.push_str(&summary(diagnostics.len()));
    out
}
