pub mod lexer;
pub mod token;
pub mod token_dumper;

pub use lexer::{Lexer, tokenize};
pub use token::{Token, TokenKind};
