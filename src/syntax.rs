pub mod lexer;

pub use lexer::{Lexer, Token, TokenKind};
