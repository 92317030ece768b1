use std::fmt::{self, Write};

use beef::lean::Cow;
use owo_colors::OwoColorize;
use thiserror::Error;

/// Three-state result of [`interpret`](crate::Tako::interpret), mirroring
/// the classic `INTERPRET_*` codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum InterpretResult {
  Ok,
  CompileError,
  RuntimeError,
}

/// Where a compile error points.
#[derive(Clone, Debug)]
pub enum ErrorAt {
  /// A regular token; the field is its lexeme.
  Lexeme(String),
  /// End of input.
  End,
  /// The scanner itself produced the message; there is no lexeme worth
  /// showing.
  Scanner,
}

#[derive(Clone, Debug, Error)]
#[error("{}", self.render())]
pub struct CompileError {
  pub line: u32,
  pub at: ErrorAt,
  pub message: Cow<'static, str>,
}

impl CompileError {
  fn label(&self) -> String {
    match &self.at {
      ErrorAt::Lexeme(lexeme) => format!("Error at '{lexeme}'"),
      ErrorAt::End => String::from("Error at end"),
      ErrorAt::Scanner => String::from("Error"),
    }
  }

  fn render(&self) -> String {
    format!("[line {}] {}: {}", self.line, self.label(), self.message)
  }

  /// Like `Display`, optionally with ANSI colors for terminals.
  pub fn report(&self, color: bool) -> String {
    if !color {
      return self.render();
    }
    format!(
      "{} {}: {}",
      format!("[line {}]", self.line).dimmed(),
      self.label().red(),
      self.message
    )
  }
}

/// One frame of a runtime stack trace, innermost first.
#[derive(Clone, Debug)]
pub struct TraceLine {
  pub line: u32,
  /// `None` for the top-level script.
  pub name: Option<String>,
}

impl fmt::Display for TraceLine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.name {
      Some(name) => write!(f, "[line {}] in {name}()", self.line),
      None => write!(f, "[line {}] in script", self.line),
    }
  }
}

#[derive(Clone, Debug, Error)]
#[error("{}", self.render())]
pub struct RuntimeError {
  pub message: String,
  pub trace: Vec<TraceLine>,
}

impl RuntimeError {
  fn render(&self) -> String {
    let mut out = self.message.clone();
    for line in &self.trace {
      let _ = write!(out, "\n{line}");
    }
    out
  }

  pub fn report(&self, color: bool) -> String {
    if !color {
      return self.render();
    }
    let mut out = format!("{}", self.message.red());
    for line in &self.trace {
      let _ = write!(out, "\n{}", line.dimmed());
    }
    out
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("{}", render_all(.0))]
  Compile(Vec<CompileError>),
  #[error(transparent)]
  Runtime(#[from] RuntimeError),
}

fn render_all(errors: &[CompileError]) -> String {
  let mut out = String::new();
  for (i, error) in errors.iter().enumerate() {
    if i > 0 {
      out.push('\n');
    }
    let _ = write!(out, "{error}");
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn compile_error_format() {
    let error = CompileError {
      line: 7,
      at: ErrorAt::Lexeme(String::from("=")),
      message: Cow::borrowed("Invalid assignment target."),
    };
    assert_eq!(
      error.to_string(),
      "[line 7] Error at '=': Invalid assignment target."
    );
  }

  #[test]
  fn compile_error_at_end() {
    let error = CompileError {
      line: 2,
      at: ErrorAt::End,
      message: Cow::borrowed("Expect expression."),
    };
    assert_eq!(error.to_string(), "[line 2] Error at end: Expect expression.");
  }

  #[test]
  fn runtime_error_with_trace() {
    let error = RuntimeError {
      message: String::from("Operands must be numbers."),
      trace: vec![
        TraceLine {
          line: 3,
          name: Some(String::from("fib")),
        },
        TraceLine { line: 9, name: None },
      ],
    };
    assert_eq!(
      error.to_string(),
      "Operands must be numbers.\n[line 3] in fib()\n[line 9] in script"
    );
  }
}
