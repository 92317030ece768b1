#![allow(non_camel_case_types)]

use logos::Logos;

use crate::span::Span;

#[derive(Clone, Copy, Debug)]
pub struct Token {
  pub kind: TokenKind,
  pub span: Span,
  pub line: u32,
}

impl Token {
  pub fn is(&self, kind: TokenKind) -> bool {
    self.kind == kind
  }
}

/// Tracks the current 1-based source line while the inner lexer runs.
pub struct Lines {
  pub line: u32,
}

impl Default for Lines {
  fn default() -> Self {
    Lines { line: 1 }
  }
}

fn newlines(s: &str) -> u32 {
  s.bytes().filter(|b| *b == b'\n').count() as u32
}

// Keywords are `token` patterns so they win over `Lit_Ident`.
#[derive(Clone, Copy, Debug, Logos, PartialEq, Eq)]
#[logos(extras = Lines)]
#[logos(skip r"[ \t\r\f]+")]
#[logos(skip r"//[^\n]*")]
pub enum TokenKind {
  // Keywords
  #[token("and")]
  Kw_And,
  #[token("class")]
  Kw_Class,
  #[token("const")]
  Kw_Const,
  #[token("else")]
  Kw_Else,
  #[token("false")]
  Kw_False,
  #[token("for")]
  Kw_For,
  #[token("fun")]
  Kw_Fun,
  #[token("if")]
  Kw_If,
  #[token("nil")]
  Kw_Nil,
  #[token("or")]
  Kw_Or,
  #[token("print")]
  Kw_Print,
  #[token("require")]
  Kw_Require,
  #[token("return")]
  Kw_Return,
  #[token("super")]
  Kw_Super,
  #[token("this")]
  Kw_This,
  #[token("true")]
  Kw_True,
  #[token("var")]
  Kw_Var,
  #[token("while")]
  Kw_While,

  // Brackets
  #[token("(")]
  Brk_ParenL,
  #[token(")")]
  Brk_ParenR,
  #[token("{")]
  Brk_CurlyL,
  #[token("}")]
  Brk_CurlyR,
  #[token("[")]
  Brk_SquareL,
  #[token("]")]
  Brk_SquareR,

  // Misc characters
  #[token(",")]
  Tok_Comma,
  #[token(";")]
  Tok_Semicolon,
  #[token(".")]
  Op_Dot,

  // Operators
  #[token("-")]
  Op_Minus,
  #[token("+")]
  Op_Plus,
  #[token("/")]
  Op_Slash,
  #[token("*")]
  Op_Star,
  #[token("!")]
  Op_Bang,
  #[token("!=")]
  Op_BangEqual,
  #[token("=")]
  Op_Equal,
  #[token("==")]
  Op_EqualEqual,
  #[token(">")]
  Op_More,
  #[token(">=")]
  Op_MoreEqual,
  #[token("<")]
  Op_Less,
  #[token("<=")]
  Op_LessEqual,

  // Literals
  #[regex(r"[0-9]+(\.[0-9]+)?")]
  Lit_Number,
  /// A quoted string. May span lines, which bumps the line counter.
  #[regex(r#""[^"]*""#, |lex| lex.extras.line += newlines(lex.slice()))]
  Lit_String,
  /// `a`, `b_c`, `__x0`, etc.
  #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
  Lit_Ident,

  /// A `"` with no closing quote before the end of input.
  #[regex(r#""[^"]*"#, |lex| lex.extras.line += newlines(lex.slice()), priority = 1)]
  Tok_StringUnterminated,

  #[doc(hidden)]
  #[regex(r"\n+", |lex| {
    lex.extras.line += lex.slice().len() as u32;
    logos::Skip
  })]
  _Tok_Newline,

  Tok_Error,
  Tok_Eof,
}

impl TokenKind {
  /// The message reported when this token comes out of the scanner
  /// already broken.
  pub fn scan_error(&self) -> Option<&'static str> {
    match self {
      TokenKind::Tok_Error => Some("Unexpected character."),
      TokenKind::Tok_StringUnterminated => Some("Unterminated string."),
      _ => None,
    }
  }
}

pub struct Lexer<'src> {
  src: &'src str,
  inner: logos::Lexer<'src, TokenKind>,
}

impl<'src> Lexer<'src> {
  pub fn new(src: &'src str) -> Self {
    Self {
      src,
      inner: TokenKind::lexer(src),
    }
  }

  #[inline]
  pub fn lexeme(&self, token: &Token) -> &'src str {
    &self.src[token.span]
  }

  pub fn next_token(&mut self) -> Token {
    match self.inner.next() {
      Some(Ok(kind)) => Token {
        kind,
        span: self.inner.span().into(),
        line: self.inner.extras.line,
      },
      Some(Err(())) => Token {
        kind: TokenKind::Tok_Error,
        span: self.inner.span().into(),
        line: self.inner.extras.line,
      },
      None => {
        let end = self.src.len();
        Token {
          kind: TokenKind::Tok_Eof,
          span: (end..end).into(),
          line: self.inner.extras.line,
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::TokenKind::*;
  use super::*;

  fn tokens(src: &str) -> Vec<(TokenKind, u32)> {
    let mut lex = Lexer::new(src);
    let mut out = vec![];
    loop {
      let token = lex.next_token();
      if token.is(Tok_Eof) {
        break;
      }
      out.push((token.kind, token.line));
    }
    out
  }

  #[test]
  fn small_program() {
    let out = tokens("var a = 1;\nprint a + 2.5;");
    assert_eq!(
      out,
      vec![
        (Kw_Var, 1),
        (Lit_Ident, 1),
        (Op_Equal, 1),
        (Lit_Number, 1),
        (Tok_Semicolon, 1),
        (Kw_Print, 2),
        (Lit_Ident, 2),
        (Op_Plus, 2),
        (Lit_Number, 2),
        (Tok_Semicolon, 2),
      ]
    );
  }

  #[test]
  fn keywords_vs_identifiers() {
    let out = tokens("class classy supers super_");
    assert_eq!(
      out.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
      vec![Kw_Class, Lit_Ident, Lit_Ident, Lit_Ident]
    );
  }

  #[test]
  fn two_char_operators() {
    let out = tokens("! != = == > >= < <=");
    assert_eq!(
      out.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
      vec![
        Op_Bang,
        Op_BangEqual,
        Op_Equal,
        Op_EqualEqual,
        Op_More,
        Op_MoreEqual,
        Op_Less,
        Op_LessEqual,
      ]
    );
  }

  #[test]
  fn comments_are_skipped() {
    let out = tokens("1 // one\n2");
    assert_eq!(out, vec![(Lit_Number, 1), (Lit_Number, 2)]);
  }

  #[test]
  fn string_spanning_newline_bumps_line() {
    let out = tokens("\"a\nb\" 1");
    assert_eq!(out, vec![(Lit_String, 2), (Lit_Number, 2)]);
  }

  #[test]
  fn unterminated_string() {
    let out = tokens("\"abc");
    assert_eq!(out, vec![(Tok_StringUnterminated, 1)]);
    assert_eq!(
      Tok_StringUnterminated.scan_error(),
      Some("Unterminated string.")
    );
  }

  #[test]
  fn unexpected_character() {
    let out = tokens("@");
    assert_eq!(out, vec![(Tok_Error, 1)]);
  }

  #[test]
  fn lexeme_slices_source() {
    let mut lex = Lexer::new("hello");
    let token = lex.next_token();
    assert_eq!(lex.lexeme(&token), "hello");
  }
}
