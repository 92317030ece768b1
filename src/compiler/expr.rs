use super::Compiler;
use crate::bytecode::opcode::Opcode;
use crate::syntax::lexer::TokenKind;
use crate::value::Value;

/// Binding strength, weakest first. `parse_precedence(p)` consumes
/// everything that binds at least as tightly as `p`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Precedence {
  None,
  Assignment, // =
  Or,         // or
  And,        // and
  Equality,   // == !=
  Comparison, // < > <= >=
  Term,       // + -
  Factor,     // * /
  Unary,      // ! -
  Call,       // . () []
  Primary,
}

impl Precedence {
  /// One level tighter; used for left-associative infix operators.
  fn stronger(self) -> Precedence {
    use Precedence::*;
    match self {
      None => Assignment,
      Assignment => Or,
      Or => And,
      And => Equality,
      Equality => Comparison,
      Comparison => Term,
      Term => Factor,
      Factor => Unary,
      Unary => Call,
      Call | Primary => Primary,
    }
  }
}

type ParseFn<'src, 'vm> = fn(&mut Compiler<'src, 'vm>, bool);

pub(super) struct ParseRule<'src, 'vm> {
  prefix: Option<ParseFn<'src, 'vm>>,
  infix: Option<ParseFn<'src, 'vm>>,
  precedence: Precedence,
}

impl<'src, 'vm> ParseRule<'src, 'vm> {
  fn new(
    prefix: Option<ParseFn<'src, 'vm>>,
    infix: Option<ParseFn<'src, 'vm>>,
    precedence: Precedence,
  ) -> ParseRule<'src, 'vm> {
    ParseRule {
      prefix,
      infix,
      precedence,
    }
  }
}

impl<'src, 'vm> Compiler<'src, 'vm> {
  fn rule(kind: TokenKind) -> ParseRule<'src, 'vm> {
    use Precedence as P;
    use TokenKind::*;
    match kind {
      Brk_ParenL => ParseRule::new(Some(Self::grouping), Some(Self::call), P::Call),
      Brk_SquareL => ParseRule::new(Some(Self::array), Some(Self::bracket), P::Call),
      Op_Dot => ParseRule::new(None, Some(Self::dot), P::Call),
      Op_Minus => ParseRule::new(Some(Self::unary), Some(Self::binary), P::Term),
      Op_Plus => ParseRule::new(None, Some(Self::binary), P::Term),
      Op_Slash => ParseRule::new(None, Some(Self::binary), P::Factor),
      Op_Star => ParseRule::new(None, Some(Self::binary), P::Factor),
      Op_Bang => ParseRule::new(Some(Self::unary), None, P::None),
      Op_BangEqual => ParseRule::new(None, Some(Self::binary), P::Equality),
      Op_EqualEqual => ParseRule::new(None, Some(Self::binary), P::Equality),
      Op_More => ParseRule::new(None, Some(Self::binary), P::Comparison),
      Op_MoreEqual => ParseRule::new(None, Some(Self::binary), P::Comparison),
      Op_Less => ParseRule::new(None, Some(Self::binary), P::Comparison),
      Op_LessEqual => ParseRule::new(None, Some(Self::binary), P::Comparison),
      Lit_Ident => ParseRule::new(Some(Self::variable), None, P::None),
      Lit_String => ParseRule::new(Some(Self::string), None, P::None),
      Lit_Number => ParseRule::new(Some(Self::number), None, P::None),
      Kw_And => ParseRule::new(None, Some(Self::and_), P::And),
      Kw_Or => ParseRule::new(None, Some(Self::or_), P::Or),
      Kw_False | Kw_True | Kw_Nil => ParseRule::new(Some(Self::literal), None, P::None),
      Kw_Super => ParseRule::new(Some(Self::super_), None, P::None),
      Kw_This => ParseRule::new(Some(Self::this_), None, P::None),
      Kw_Require => ParseRule::new(Some(Self::require_), None, P::None),
      _ => ParseRule::new(None, None, P::None),
    }
  }

  pub(super) fn expression(&mut self) {
    self.parse_precedence(Precedence::Assignment);
  }

  fn parse_precedence(&mut self, precedence: Precedence) {
    #[cfg(feature = "check-recursion-limit")]
    if !self.check_recursion_limit() {
      return;
    }

    self.advance();
    let Some(prefix) = Self::rule(self.previous.kind).prefix else {
      self.error("Expect expression.");
      return;
    };

    // Assignment is handled by the target's own parselet, so only hand
    // it the permission when the precedence allows an `=` to bind.
    let can_assign = precedence <= Precedence::Assignment;
    prefix(self, can_assign);

    while precedence <= Self::rule(self.current.kind).precedence {
      self.advance();
      if let Some(infix) = Self::rule(self.previous.kind).infix {
        infix(self, can_assign);
      }
    }

    if can_assign && self.eat(TokenKind::Op_Equal) {
      self.error("Invalid assignment target.");
    }
  }

  #[cfg(feature = "check-recursion-limit")]
  fn check_recursion_limit(&mut self) -> bool {
    const MINIMUM_STACK_REQUIRED: usize = 64_000;
    if stacker::remaining_stack()
      .map(|available| available > MINIMUM_STACK_REQUIRED)
      .unwrap_or(true)
    {
      true
    } else {
      self.error("Expression nesting too deep.");
      false
    }
  }

  // ---- parselets ---------------------------------------------------------

  fn grouping(&mut self, _can_assign: bool) {
    self.expression();
    self.consume(TokenKind::Brk_ParenR, "Expect ')' after expression.");
  }

  fn unary(&mut self, _can_assign: bool) {
    let operator = self.previous.kind;
    self.parse_precedence(Precedence::Unary);
    match operator {
      TokenKind::Op_Bang => self.emit_op(Opcode::Not),
      TokenKind::Op_Minus => self.emit_op(Opcode::Negate),
      _ => {}
    }
  }

  fn binary(&mut self, _can_assign: bool) {
    let operator = self.previous.kind;
    let precedence = Self::rule(operator).precedence;
    self.parse_precedence(precedence.stronger());

    match operator {
      TokenKind::Op_BangEqual => self.emit_op(Opcode::NotEqual),
      TokenKind::Op_EqualEqual => self.emit_op(Opcode::Equal),
      TokenKind::Op_More => self.emit_op(Opcode::Greater),
      TokenKind::Op_MoreEqual => self.emit_op(Opcode::GreaterEqual),
      TokenKind::Op_Less => self.emit_op(Opcode::Less),
      TokenKind::Op_LessEqual => self.emit_op(Opcode::LessEqual),
      TokenKind::Op_Plus => self.emit_op(Opcode::Add),
      TokenKind::Op_Minus => self.emit_op(Opcode::Subtract),
      TokenKind::Op_Star => self.emit_op(Opcode::Multiply),
      TokenKind::Op_Slash => self.emit_op(Opcode::Divide),
      _ => {}
    }
  }

  fn number(&mut self, _can_assign: bool) {
    let value: f64 = self
      .lexeme(self.previous)
      .parse()
      .expect("number literal no longer parses");
    self.emit_constant(Value::Number(value));
  }

  fn string(&mut self, _can_assign: bool) {
    let lexeme = self.lexeme(self.previous);
    // Strip the quotes.
    let handle = self.intern(&lexeme[1..lexeme.len() - 1]);
    self.emit_constant(Value::from(handle));
  }

  fn literal(&mut self, _can_assign: bool) {
    match self.previous.kind {
      TokenKind::Kw_Nil => self.emit_op(Opcode::Nil),
      TokenKind::Kw_True => self.emit_op(Opcode::True),
      TokenKind::Kw_False => self.emit_op(Opcode::False),
      _ => {}
    }
  }

  fn variable(&mut self, can_assign: bool) {
    let name = self.lexeme(self.previous);
    self.named_variable(name, can_assign);
  }

  /// Emit a read of (or, when allowed and followed by `=`, a write to)
  /// `name`, resolving it as a local, an upvalue, or a global.
  pub(super) fn named_variable(&mut self, name: &str, can_assign: bool) {
    enum Target {
      Local(u32),
      Upvalue(u32),
      Global(u32),
    }

    let state_index = self.states.len() - 1;
    let (target, readonly) = if let Some(addr) = self.resolve_local(state_index, name) {
      let readonly = self.states[state_index].locals.props(addr).readonly;
      (Target::Local(addr), readonly)
    } else if let Some((addr, readonly)) = self.resolve_upvalue(state_index, name) {
      (Target::Upvalue(addr), readonly)
    } else {
      let addr = self.first_or_make_global(name);
      let readonly = self.vm.globals_table().props(addr).readonly;
      (Target::Global(addr), readonly)
    };

    if can_assign && self.eat(TokenKind::Op_Equal) {
      if readonly {
        self.error("Can not assign to constant.");
      }
      self.expression();
      match target {
        Target::Local(addr) => {
          self.emit_index_op(Opcode::SetLocal, Opcode::SetLocalLong, addr)
        }
        Target::Upvalue(addr) => {
          self.emit_op(Opcode::SetUpvalue);
          self.emit_byte(addr as u8);
        }
        Target::Global(addr) => {
          self.emit_index_op(Opcode::SetGlobal, Opcode::SetGlobalLong, addr)
        }
      }
    } else {
      match target {
        Target::Local(addr) => {
          self.emit_index_op(Opcode::GetLocal, Opcode::GetLocalLong, addr)
        }
        Target::Upvalue(addr) => {
          self.emit_op(Opcode::GetUpvalue);
          self.emit_byte(addr as u8);
        }
        Target::Global(addr) => {
          self.emit_index_op(Opcode::GetGlobal, Opcode::GetGlobalLong, addr)
        }
      }
    }
  }

  fn and_(&mut self, _can_assign: bool) {
    let end_jump = self.emit_jump(Opcode::JumpIfFalse);
    self.emit_op(Opcode::Pop);
    self.parse_precedence(Precedence::And);
    self.patch_jump(end_jump);
  }

  fn or_(&mut self, _can_assign: bool) {
    let else_jump = self.emit_jump(Opcode::JumpIfFalse);
    let end_jump = self.emit_jump(Opcode::Jump);

    self.patch_jump(else_jump);
    self.emit_op(Opcode::Pop);

    self.parse_precedence(Precedence::Or);
    self.patch_jump(end_jump);
  }

  pub(super) fn argument_list(&mut self, end: TokenKind, message: &'static str) -> u8 {
    let mut argc: u32 = 0;
    if !self.check(end) {
      loop {
        self.expression();
        if argc == 255 {
          self.error("Can't have more than 255 arguments.");
        }
        argc += 1;
        if !self.eat(TokenKind::Tok_Comma) {
          break;
        }
      }
    }
    self.consume(end, message);
    argc.min(255) as u8
  }

  fn call(&mut self, _can_assign: bool) {
    let argc = self.argument_list(TokenKind::Brk_ParenR, "Expect ')' after arguments.");
    self.emit_op(Opcode::Call);
    self.emit_byte(argc);
  }

  fn dot(&mut self, can_assign: bool) {
    self.consume(TokenKind::Lit_Ident, "Expect property name after '.'.");
    let name = self.lexeme(self.previous);
    let index = self.identifier_constant(name);

    if can_assign && self.eat(TokenKind::Op_Equal) {
      self.expression();
      self.emit_index_op(Opcode::SetProperty, Opcode::SetPropertyLong, index);
    } else if self.eat(TokenKind::Brk_ParenL) {
      let argc = self.argument_list(TokenKind::Brk_ParenR, "Expect ')' after arguments.");
      self.emit_index_op(Opcode::Invoke, Opcode::InvokeLong, index);
      self.emit_byte(argc);
    } else {
      self.emit_index_op(Opcode::GetProperty, Opcode::GetPropertyLong, index);
    }
  }

  /// `[a, b, c]` literal.
  fn array(&mut self, _can_assign: bool) {
    let count = self.argument_list(TokenKind::Brk_SquareR, "Expect ']' after array elements.");
    self.emit_op(Opcode::ArrayInit);
    self.emit_byte(count);
  }

  /// Postfix `[`: either `arr[] = v` (append) or keyed access.
  fn bracket(&mut self, can_assign: bool) {
    if self.eat(TokenKind::Brk_SquareR) {
      if !can_assign {
        self.error("Invalid assignment target.");
        return;
      }
      self.consume(
        TokenKind::Op_Equal,
        "Expect '=' after array add syntax ('[]').",
      );
      self.expression();
      self.emit_op(Opcode::ArrayAdd);
    } else {
      self.expression();
      self.consume(TokenKind::Brk_SquareR, "Expect ']' after array index.");
      if can_assign && self.eat(TokenKind::Op_Equal) {
        self.expression();
        self.emit_op(Opcode::SetPropertyStack);
      } else {
        self.emit_op(Opcode::GetPropertyStack);
      }
    }
  }

  fn this_(&mut self, _can_assign: bool) {
    if self.classes.is_empty() {
      self.error("Can't use 'this' outside of a class.");
      return;
    }
    self.variable(false);
  }

  fn super_(&mut self, _can_assign: bool) {
    if self.classes.is_empty() {
      self.error("Can't use 'super' outside of a class.");
    } else if !self.classes.last().map(|c| c.has_superclass).unwrap_or(false) {
      self.error("Can't use 'super' in a class with no superclass.");
    }

    self.consume(TokenKind::Op_Dot, "Expect '.' after 'super'.");
    self.consume(TokenKind::Lit_Ident, "Expect superclass method name.");
    let name = self.lexeme(self.previous);
    let index = self.identifier_constant(name);

    self.named_variable("this", false);
    if self.eat(TokenKind::Brk_ParenL) {
      let argc = self.argument_list(TokenKind::Brk_ParenR, "Expect ')' after arguments.");
      self.named_variable("super", false);
      self.emit_index_op(Opcode::SuperInvoke, Opcode::SuperInvokeLong, index);
      self.emit_byte(argc);
    } else {
      self.named_variable("super", false);
      self.emit_index_op(Opcode::GetSuper, Opcode::GetSuperLong, index);
    }
  }

  // TODO: module loader; `require` needs a file-resolution story before
  // it can compile to anything.
  fn require_(&mut self, _can_assign: bool) {
    self.error("Modules are not supported yet.");
  }
}
