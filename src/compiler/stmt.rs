use super::{ClassState, Compiler, FunctionType};
use crate::bytecode::opcode::Opcode;
use crate::syntax::lexer::TokenKind;
use crate::value::Value;

impl<'src, 'vm> Compiler<'src, 'vm> {
  pub(super) fn declaration(&mut self) {
    if self.eat(TokenKind::Kw_Class) {
      self.class_declaration();
    } else if self.eat(TokenKind::Kw_Fun) {
      self.fun_declaration();
    } else if self.eat(TokenKind::Kw_Var) {
      self.var_declaration(false);
    } else if self.eat(TokenKind::Kw_Const) {
      self.var_declaration(true);
    } else {
      self.statement();
    }

    if self.panic_mode {
      self.synchronize();
    }
  }

  fn statement(&mut self) {
    if self.eat(TokenKind::Kw_Print) {
      self.print_statement();
    } else if self.eat(TokenKind::Kw_For) {
      self.for_statement();
    } else if self.eat(TokenKind::Kw_If) {
      self.if_statement();
    } else if self.eat(TokenKind::Kw_Return) {
      self.return_statement();
    } else if self.eat(TokenKind::Kw_While) {
      self.while_statement();
    } else if self.eat(TokenKind::Brk_CurlyL) {
      self.begin_scope();
      self.block();
      self.end_scope();
    } else {
      self.expression_statement();
    }
  }

  fn block(&mut self) {
    while !self.check(TokenKind::Brk_CurlyR) && !self.check(TokenKind::Tok_Eof) {
      self.declaration();
    }
    self.consume(TokenKind::Brk_CurlyR, "Expect '}' after block.");
  }

  fn print_statement(&mut self) {
    self.expression();
    self.consume(TokenKind::Tok_Semicolon, "Expected ; after value.");
    self.emit_op(Opcode::Print);
  }

  fn expression_statement(&mut self) {
    self.expression();
    self.consume(TokenKind::Tok_Semicolon, "Expect ';' after expression.");
    self.emit_op(Opcode::Pop);
  }

  fn var_declaration(&mut self, readonly: bool) {
    let addr = self.parse_variable("Expect variable name.");

    if self.eat(TokenKind::Op_Equal) {
      self.expression();
    } else {
      self.emit_op(Opcode::Nil);
    }
    self.consume(TokenKind::Tok_Semicolon, "Expect ';' after expression.");

    self.define_variable(addr, readonly);
  }

  fn fun_declaration(&mut self) {
    let addr = self.parse_variable("Expect function name.");
    // Functions may refer to themselves; initialize the binding before
    // the body is compiled.
    self.mark_initialized();
    self.function(FunctionType::Function);
    self.define_variable(addr, true);
  }

  /// Compile a function body in a nested state and emit the closure.
  fn function(&mut self, fn_type: FunctionType) {
    self.push_state(fn_type);
    self.begin_scope();

    self.consume(TokenKind::Brk_ParenL, "Expect '(' after function name.");
    if !self.check(TokenKind::Brk_ParenR) {
      loop {
        self.state_mut().function.arity += 1;
        if self.state().function.arity > 255 {
          self.error_at_current("Can't have more than 255 parameters.");
        }
        let addr = self.parse_variable("Expect parameter name");
        self.define_variable(addr, false);
        if !self.eat(TokenKind::Tok_Comma) {
          break;
        }
      }
    }
    self.consume(TokenKind::Brk_ParenR, "Expect ')' after parameters.");
    self.consume(TokenKind::Brk_CurlyL, "Expect '{' before function body.");
    self.block();

    let (function, upvalues) = self.pop_state();
    let index = self.make_constant(Value::from(function));
    self.emit_index_op(Opcode::Closure, Opcode::ClosureLong, index);

    // One `(is_local, slot)` triple per captured variable; the slot is
    // two bytes so locals beyond 255 stay capturable.
    for upvalue in &upvalues {
      let is_local = upvalue.is_local as u8;
      let index = upvalue.index;
      self.emit_byte(is_local);
      self.emit_byte(((index >> 8) & 0xFF) as u8);
      self.emit_byte((index & 0xFF) as u8);
    }
  }

  fn method(&mut self) {
    self.consume(TokenKind::Lit_Ident, "Expect method name.");
    let name = self.lexeme(self.previous);
    let index = self.identifier_constant(name);

    let fn_type = if name == "init" {
      FunctionType::Initializer
    } else {
      FunctionType::Method
    };
    self.function(fn_type);

    self.emit_index_op(Opcode::Method, Opcode::MethodLong, index);
  }

  fn class_declaration(&mut self) {
    let var_addr = self.parse_variable("Expect class name.");
    let class_name = self.previous;
    let name_index = self.identifier_constant(self.lexeme(class_name));
    self.emit_index_op(Opcode::Class, Opcode::ClassLong, name_index);
    self.define_variable(var_addr, true);

    self.classes.push(ClassState {
      has_superclass: false,
    });

    if self.eat(TokenKind::Op_Less) {
      self.consume(TokenKind::Lit_Ident, "Expect superclass name.");
      let superclass_name = self.lexeme(self.previous);
      self.named_variable(superclass_name, false);

      if self.lexeme(class_name) == superclass_name {
        self.error("A class can't inherit from itself.");
      }

      // The superclass value stays on the stack for the whole class
      // body, bound as the local `super`.
      self.begin_scope();
      let key = self.intern_key("super");
      let super_addr = self.add_local(key);
      self.define_variable(super_addr, true);

      self.named_variable(self.lexeme(class_name), false);
      self.emit_op(Opcode::Inherit);
      if let Some(class) = self.classes.last_mut() {
        class.has_superclass = true;
      }
    }

    self.named_variable(self.lexeme(class_name), false);

    self.consume(TokenKind::Brk_CurlyL, "Expect '{' before class body.");
    while !self.check(TokenKind::Brk_CurlyR) && !self.check(TokenKind::Tok_Eof) {
      self.method();
    }
    self.consume(TokenKind::Brk_CurlyR, "Expect '}' after class body.");
    self.emit_op(Opcode::Pop);

    if self.classes.last().map(|c| c.has_superclass).unwrap_or(false) {
      self.end_scope();
    }

    self.classes.pop();
  }

  fn if_statement(&mut self) {
    self.consume(TokenKind::Brk_ParenL, "Expect '(' after 'if'.");
    self.expression();
    self.consume(TokenKind::Brk_ParenR, "Expect ')' after condition.");

    let then_jump = self.emit_jump(Opcode::JumpIfFalse);
    self.emit_op(Opcode::Pop);
    self.statement();

    let else_jump = self.emit_jump(Opcode::Jump);
    self.patch_jump(then_jump);
    self.emit_op(Opcode::Pop);

    if self.eat(TokenKind::Kw_Else) {
      self.statement();
    }
    self.patch_jump(else_jump);
  }

  fn while_statement(&mut self) {
    let loop_start = self.offset();

    self.consume(TokenKind::Brk_ParenL, "Expect '(' after 'while'.");
    self.expression();
    self.consume(TokenKind::Brk_ParenR, "Expect ')' after condition.");

    let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
    self.emit_op(Opcode::Pop);
    self.statement();

    self.emit_loop(loop_start);

    self.patch_jump(exit_jump);
    self.emit_op(Opcode::Pop);
  }

  fn for_statement(&mut self) {
    self.begin_scope();
    self.consume(TokenKind::Brk_ParenL, "Expect '(' after 'for'.");
    if self.eat(TokenKind::Tok_Semicolon) {
      // No initializer.
    } else if self.eat(TokenKind::Kw_Var) {
      self.var_declaration(false);
    } else {
      self.expression_statement();
    }

    let mut loop_start = self.offset();
    let mut exit_jump = None;
    if !self.eat(TokenKind::Tok_Semicolon) {
      self.expression();
      self.consume(TokenKind::Tok_Semicolon, "Expect ';' after loop condition.");

      // Jump out of the loop when the condition is false.
      exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
      self.emit_op(Opcode::Pop);
    }

    if !self.eat(TokenKind::Brk_ParenR) {
      let body_jump = self.emit_jump(Opcode::Jump);
      let increment_start = self.offset();
      self.expression();
      self.emit_op(Opcode::Pop);
      self.consume(TokenKind::Brk_ParenR, "Expect ')' after for clauses.");

      self.emit_loop(loop_start);
      loop_start = increment_start;
      self.patch_jump(body_jump);
    }

    self.statement();
    self.emit_loop(loop_start);

    if let Some(exit_jump) = exit_jump {
      self.patch_jump(exit_jump);
      self.emit_op(Opcode::Pop);
    }
    self.end_scope();
  }

  fn return_statement(&mut self) {
    if self.state().fn_type == FunctionType::Script {
      self.error("Can't return from top-level code.");
    }

    if self.eat(TokenKind::Tok_Semicolon) {
      self.emit_return();
    } else {
      if self.state().fn_type == FunctionType::Initializer {
        self.error("Can't return a value from an initializer.");
      }
      self.expression();
      self.consume(TokenKind::Tok_Semicolon, "Expect ';' after return value.");
      self.emit_op(Opcode::Return);
    }
  }
}
