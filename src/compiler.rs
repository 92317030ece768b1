//! The single-pass compiler: a Pratt parser that emits bytecode as it
//! goes, resolving locals, upvalues and globals on the fly.
//!
//! Function compilation nests: each `fun`/method body pushes a fresh
//! [`FnState`] with its own locals table and pops it into a heap-allocated
//! [`Function`] when the body ends. While compiling, those in-progress
//! functions are GC roots.

mod expr;
mod stmt;

use beef::lean::Cow;

use crate::bytecode::opcode::Opcode;
use crate::error::{CompileError, ErrorAt};
use crate::gc::Handle;
use crate::syntax::lexer::{Lexer, Token, TokenKind};
use crate::table::{AddressTable, Key, VarProps};
use crate::value::object::{Function, Str};
use crate::value::Value;
use crate::vm::Vm;

const MAX_UPVALUES: usize = 256;
const MAX_LOCALS: u32 = 1 << 24;
const MAX_CONSTANTS: u32 = 1 << 24;

/// Compile `source` into its top-level script function.
///
/// All errors are collected, not just the first; the function is only
/// returned when there were none.
pub fn compile(vm: &mut Vm, source: &str) -> Result<Handle<Function>, Vec<CompileError>> {
  let mut compiler = Compiler::new(vm, source);
  compiler.push_state(FunctionType::Script);
  compiler.advance();
  while !compiler.eat(TokenKind::Tok_Eof) {
    compiler.declaration();
  }
  let (function, _) = compiler.pop_state();
  if compiler.errors.is_empty() {
    Ok(function)
  } else {
    Err(compiler.errors)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FunctionType {
  Function,
  Initializer,
  Method,
  Script,
}

/// One captured variable, as emitted after `Closure`: the enclosing
/// function's local slot (`is_local`) or upvalue index.
pub(crate) struct UpvalueDesc {
  pub index: u32,
  pub is_local: bool,
}

/// Per-function compile state. The stack of these mirrors lexical
/// function nesting.
pub(crate) struct FnState {
  function: Function,
  fn_type: FunctionType,
  locals: AddressTable,
  upvalues: Vec<UpvalueDesc>,
  scope_depth: i32,
}

pub(crate) struct ClassState {
  has_superclass: bool,
}

pub(crate) struct Compiler<'src, 'vm> {
  vm: &'vm mut Vm,
  lexer: Lexer<'src>,
  previous: Token,
  current: Token,
  errors: Vec<CompileError>,
  panic_mode: bool,
  states: Vec<FnState>,
  classes: Vec<ClassState>,
}

impl<'src, 'vm> Compiler<'src, 'vm> {
  fn new(vm: &'vm mut Vm, source: &'src str) -> Compiler<'src, 'vm> {
    let placeholder = Token {
      kind: TokenKind::Tok_Eof,
      span: crate::span::Span::empty(),
      line: 1,
    };
    Compiler {
      vm,
      lexer: Lexer::new(source),
      previous: placeholder,
      current: placeholder,
      errors: Vec::new(),
      panic_mode: false,
      states: Vec::new(),
      classes: Vec::new(),
    }
  }

  // ---- tokens ------------------------------------------------------------

  fn lexeme(&self, token: Token) -> &'src str {
    self.lexer.lexeme(&token)
  }

  fn advance(&mut self) {
    self.previous = self.current;
    loop {
      self.current = self.lexer.next_token();
      match self.current.kind.scan_error() {
        Some(message) => {
          let token = self.current;
          self.error_at(token, message);
        }
        None => break,
      }
    }
  }

  fn consume(&mut self, kind: TokenKind, message: &'static str) {
    if self.current.kind == kind {
      self.advance();
      return;
    }
    self.error_at_current(message);
  }

  fn check(&self, kind: TokenKind) -> bool {
    self.current.kind == kind
  }

  fn eat(&mut self, kind: TokenKind) -> bool {
    if !self.check(kind) {
      return false;
    }
    self.advance();
    true
  }

  // ---- errors ------------------------------------------------------------

  fn error(&mut self, message: &'static str) {
    self.error_at(self.previous, message);
  }

  fn error_at_current(&mut self, message: &'static str) {
    self.error_at(self.current, message);
  }

  fn error_at(&mut self, token: Token, message: &'static str) {
    if self.panic_mode {
      return;
    }
    self.panic_mode = true;
    let at = match token.kind {
      TokenKind::Tok_Eof => ErrorAt::End,
      TokenKind::Tok_Error | TokenKind::Tok_StringUnterminated => ErrorAt::Scanner,
      _ => ErrorAt::Lexeme(self.lexeme(token).to_owned()),
    };
    self.errors.push(CompileError {
      line: token.line,
      at,
      message: Cow::borrowed(message),
    });
  }

  /// Skip to a statement boundary after an error, so one mistake does not
  /// cascade into a wall of diagnostics.
  fn synchronize(&mut self) {
    self.panic_mode = false;
    while self.current.kind != TokenKind::Tok_Eof {
      if self.previous.kind == TokenKind::Tok_Semicolon {
        return;
      }
      match self.current.kind {
        TokenKind::Kw_Class
        | TokenKind::Kw_Fun
        | TokenKind::Kw_Var
        | TokenKind::Kw_Const
        | TokenKind::Kw_For
        | TokenKind::Kw_If
        | TokenKind::Kw_While
        | TokenKind::Kw_Print
        | TokenKind::Kw_Return => return,
        _ => {}
      }
      self.advance();
    }
  }

  // ---- function states ---------------------------------------------------

  fn state(&self) -> &FnState {
    self.states.last().expect("no function state")
  }

  fn state_mut(&mut self) -> &mut FnState {
    self.states.last_mut().expect("no function state")
  }

  fn push_state(&mut self, fn_type: FunctionType) {
    // The function name is the identifier just consumed, except for the
    // top-level script.
    let name = if fn_type != FunctionType::Script {
      let name = self.intern(self.lexeme(self.previous));
      self.vm.heap_mut().push_temp(Value::from(name));
      Some(name)
    } else {
      None
    };

    // Slot 0 is reserved: methods and initializers find `this` there,
    // plain functions get an unnameable sentinel.
    let is_method = matches!(fn_type, FunctionType::Method | FunctionType::Initializer);
    let slot_zero = self.intern_key(if is_method { "this" } else { "" });
    if name.is_some() {
      self.vm.heap_mut().pop_temp();
    }

    let mut function = Function::new();
    function.name = name;

    let mut locals = AddressTable::new();
    locals.add(VarProps {
      name: slot_zero,
      depth: if is_method { 0 } else { -1 },
      readonly: true,
      shadow_addr: None,
      is_captured: false,
    });

    self.states.push(FnState {
      function,
      fn_type,
      locals,
      upvalues: Vec::new(),
      scope_depth: 0,
    });
  }

  fn pop_state(&mut self) -> (Handle<Function>, Vec<UpvalueDesc>) {
    self.emit_return();
    // Safe point while the finished function is still rooted via the
    // state stack.
    self.maybe_collect();
    let state = self.states.pop().expect("pop from empty compiler stack");
    let FnState {
      mut function,
      upvalues,
      ..
    } = state;
    function.upvalue_count = upvalues.len() as u32;
    let handle = self.vm.heap_mut().alloc(function);
    (handle, upvalues)
  }

  // ---- allocation --------------------------------------------------------

  /// Collect if due, with the compiler's in-progress functions and locals
  /// as extra roots.
  fn maybe_collect(&mut self) {
    if !self.vm.heap().should_collect() {
      return;
    }
    let Compiler { vm, states, .. } = self;
    vm.collect_with(|heap| {
      for state in states.iter() {
        if let Some(name) = state.function.name {
          heap.mark_handle(name);
        }
        for value in state.function.chunk.constants.iter() {
          heap.mark_value(*value);
        }
        for props in state.locals.iter_props() {
          heap.mark_handle(props.name.handle);
        }
      }
    });
  }

  fn intern(&mut self, chars: &str) -> Handle<Str> {
    self.maybe_collect();
    self.vm.heap_mut().intern(chars)
  }

  fn intern_key(&mut self, chars: &str) -> Key {
    let handle = self.intern(chars);
    self.vm.heap().key(handle)
  }

  // ---- emission ----------------------------------------------------------

  fn offset(&self) -> usize {
    self.state().function.chunk.code.len()
  }

  fn emit_byte(&mut self, byte: u8) {
    let line = self.previous.line;
    self.state_mut().function.chunk.write(byte, line);
  }

  fn emit_op(&mut self, op: Opcode) {
    let line = self.previous.line;
    self.state_mut().function.chunk.write_op(op, line);
  }

  fn emit_index_op(&mut self, short: Opcode, long: Opcode, index: u32) {
    let line = self.previous.line;
    self
      .state_mut()
      .function
      .chunk
      .write_index_op(short, long, index, line);
  }

  fn emit_return(&mut self) {
    if self.state().fn_type == FunctionType::Initializer {
      // An initializer always returns its receiver.
      self.emit_op(Opcode::GetLocal);
      self.emit_byte(0);
    } else {
      self.emit_op(Opcode::Nil);
    }
    self.emit_op(Opcode::Return);
  }

  fn make_constant(&mut self, value: Value) -> u32 {
    let index = self.state_mut().function.chunk.add_constant(value);
    if index >= MAX_CONSTANTS {
      self.error("Too many constants in one chunk.");
      return 0;
    }
    index
  }

  fn emit_constant(&mut self, value: Value) {
    let index = self.make_constant(value);
    self.emit_index_op(Opcode::Constant, Opcode::ConstantLong, index);
  }

  /// Intern an identifier and stash it in the constant pool.
  fn identifier_constant(&mut self, name: &str) -> u32 {
    let handle = self.intern(name);
    self.make_constant(Value::from(handle))
  }

  // ---- jumps -------------------------------------------------------------

  fn emit_jump(&mut self, op: Opcode) -> usize {
    self.emit_op(op);
    self.emit_byte(0xFF);
    self.emit_byte(0xFF);
    self.offset() - 2
  }

  fn patch_jump(&mut self, offset: usize) {
    // -2 to adjust for the operand bytes of the jump itself.
    let jump = self.offset() - offset - 2;
    if jump > u16::MAX as usize {
      self.error("Too much code to jump over.");
    }
    let code = &mut self.state_mut().function.chunk.code;
    code[offset] = ((jump >> 8) & 0xFF) as u8;
    code[offset + 1] = (jump & 0xFF) as u8;
  }

  fn emit_loop(&mut self, start: usize) {
    self.emit_op(Opcode::Loop);
    let offset = self.offset() - start + 2;
    if offset > u16::MAX as usize {
      self.error("Loop body too large.");
    }
    self.emit_byte(((offset >> 8) & 0xFF) as u8);
    self.emit_byte((offset & 0xFF) as u8);
  }

  // ---- scopes and variables ----------------------------------------------

  fn begin_scope(&mut self) {
    self.state_mut().scope_depth += 1;
  }

  fn end_scope(&mut self) {
    self.state_mut().scope_depth -= 1;
    loop {
      let depth = self.state().scope_depth;
      match self.state().locals.last_props() {
        Some(props) if props.depth > depth => {}
        _ => break,
      }
      let props = self.state_mut().locals.pop();
      if props.is_captured {
        self.emit_op(Opcode::CloseUpvalue);
      } else {
        self.emit_op(Opcode::Pop);
      }
    }
  }

  fn add_local(&mut self, name: Key) -> u32 {
    if self.state().locals.len() as u32 >= MAX_LOCALS {
      self.error("Too many local variables in function.");
      return 0;
    }
    self.state_mut().locals.add(VarProps {
      name,
      depth: -1,
      readonly: false,
      shadow_addr: None,
      is_captured: false,
    })
  }

  /// Declare the variable named by the previous token. At global scope
  /// this is a no-op; locals are added uninitialized (`depth == -1`).
  fn declare_variable(&mut self) -> u32 {
    if self.state().scope_depth == 0 {
      return 0;
    }
    let name = self.lexeme(self.previous);
    let key = self.intern_key(name);
    if let Some(addr) = self.state().locals.address_of(key) {
      if self.state().locals.props(addr).depth == self.state().scope_depth {
        self.error("Already a variable with this name in this scope.");
      }
    }
    self.add_local(key)
  }

  fn parse_variable(&mut self, message: &'static str) -> u32 {
    self.consume(TokenKind::Lit_Ident, message);
    let local_addr = self.declare_variable();
    if self.state().scope_depth > 0 {
      return local_addr;
    }
    let name = self.lexeme(self.previous);
    self.first_or_make_global(name)
  }

  fn mark_initialized(&mut self) {
    if self.state().scope_depth == 0 {
      return;
    }
    let depth = self.state().scope_depth;
    if let Some(props) = self.state_mut().locals.last_props_mut() {
      props.depth = depth;
    }
  }

  fn define_variable(&mut self, addr: u32, readonly: bool) {
    if self.state().scope_depth > 0 {
      self.mark_initialized();
      self.state_mut().locals.props_mut(addr).readonly = readonly;
      return;
    }
    self.vm.globals_table_mut().props_mut(addr).readonly = readonly;
    self.emit_index_op(Opcode::DefineGlobal, Opcode::DefineGlobalLong, addr);
  }

  /// The stable address of a global, minting one on first reference.
  /// Forward references compile; reading one at runtime before it is
  /// defined is the runtime's "Undefined variable" error.
  fn first_or_make_global(&mut self, name: &str) -> u32 {
    let key = self.intern_key(name);
    if let Some(addr) = self.vm.globals_table().address_of(key) {
      return addr;
    }
    self.vm.globals_table_mut().add(VarProps::new(key))
  }

  fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<u32> {
    let key = self.intern_key(name);
    let (addr, depth) = {
      let locals = &self.states[state_index].locals;
      let addr = locals.address_of(key)?;
      (addr, locals.props(addr).depth)
    };
    if depth == -1 {
      self.error("Can't read local variable in its own initializer.");
    }
    Some(addr)
  }

  fn add_upvalue(&mut self, state_index: usize, index: u32, is_local: bool) -> u32 {
    let upvalues = &self.states[state_index].upvalues;
    for (i, upvalue) in upvalues.iter().enumerate() {
      if upvalue.index == index && upvalue.is_local == is_local {
        return i as u32;
      }
    }
    if upvalues.len() == MAX_UPVALUES {
      self.error("Too many closure variables in function.");
      return 0;
    }
    if index > u16::MAX as u32 {
      // The capture encoding carries two bytes per slot index.
      self.error("Too many local variables in function.");
      return 0;
    }
    let upvalues = &mut self.states[state_index].upvalues;
    upvalues.push(UpvalueDesc { index, is_local });
    (upvalues.len() - 1) as u32
  }

  /// Resolve `name` against the enclosing function, capturing it as an
  /// upvalue chain if found. Returns the upvalue index and whether the
  /// origin variable is readonly.
  fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Option<(u32, bool)> {
    if state_index == 0 {
      return None;
    }
    let enclosing = state_index - 1;

    if let Some(local) = self.resolve_local(enclosing, name) {
      let props = self.states[enclosing].locals.props_mut(local);
      props.is_captured = true;
      let readonly = props.readonly;
      return Some((self.add_upvalue(state_index, local, true), readonly));
    }

    if let Some((upvalue, readonly)) = self.resolve_upvalue(enclosing, name) {
      return Some((self.add_upvalue(state_index, upvalue, false), readonly));
    }

    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bytecode::disasm;

  fn compile_errors(source: &str) -> Vec<String> {
    let mut vm = Vm::new(Box::new(Vec::<u8>::new()), false);
    match compile(&mut vm, source) {
      Ok(_) => panic!("expected compile error for: {source}"),
      Err(errors) => errors.iter().map(ToString::to_string).collect(),
    }
  }

  fn first_error(source: &str) -> String {
    compile_errors(source).remove(0)
  }

  fn disassemble(source: &str) -> String {
    let mut vm = Vm::new(Box::new(Vec::<u8>::new()), false);
    let function = match compile(&mut vm, source) {
      Ok(function) => function,
      Err(errors) => panic!("compile error: {errors:?}"),
    };
    disasm::disassemble(vm.heap(), &vm.heap()[function].chunk, "<script>")
  }

  #[test]
  fn simple_arithmetic_bytecode() {
    insta::assert_snapshot!(disassemble("print 1 + 2;"), @r###"
    == <script> ==
    0000    1 constant           0 '1'
    0002    | constant           1 '2'
    0004    | add
    0005    | print
    0006    | nil
    0007    | return
    "###);
  }

  #[test]
  fn local_slots_line_up_with_declarations() {
    insta::assert_snapshot!(
      disassemble("{ var a = 1; var b = 2; print a + b; }"),
      @r###"
    == <script> ==
    0000    1 constant           0 '1'
    0002    | constant           1 '2'
    0004    | get_local          1
    0006    | get_local          2
    0008    | add
    0009    | print
    0010    | pop
    0011    | pop
    0012    | nil
    0013    | return
    "###
    );
  }

  #[test]
  fn invalid_assignment_target() {
    assert_eq!(
      first_error("var a = 1; var b = 2; a * b = 5;"),
      "[line 1] Error at '=': Invalid assignment target."
    );
  }

  #[test]
  fn assignment_to_const() {
    assert_eq!(
      first_error("const k = 1; k = 2;"),
      "[line 1] Error at '=': Can not assign to constant."
    );
  }

  #[test]
  fn assignment_to_captured_const() {
    assert_eq!(
      first_error("fun outer() { const k = 1; fun inner() { k = 2; } }"),
      "[line 1] Error at '=': Can not assign to constant."
    );
  }

  #[test]
  fn duplicate_local_in_same_scope() {
    assert_eq!(
      first_error("{ var a = 1; var a = 2; }"),
      "[line 1] Error at 'a': Already a variable with this name in this scope."
    );
  }

  #[test]
  fn shadowing_in_inner_scope_is_fine() {
    let mut vm = Vm::new(Box::new(Vec::<u8>::new()), false);
    assert!(compile(&mut vm, "{ var a = 1; { var a = 2; } }").is_ok());
  }

  #[test]
  fn read_own_initializer() {
    assert_eq!(
      first_error("{ var a = 1; { var a = a; } }"),
      "[line 1] Error at 'a': Can't read local variable in its own initializer."
    );
  }

  #[test]
  fn this_outside_class() {
    assert_eq!(
      first_error("print this;"),
      "[line 1] Error at 'this': Can't use 'this' outside of a class."
    );
  }

  #[test]
  fn super_outside_class() {
    assert_eq!(
      first_error("print super.x;"),
      "[line 1] Error at 'super': Can't use 'super' outside of a class."
    );
  }

  #[test]
  fn super_without_superclass() {
    assert_eq!(
      first_error("class A { f() { return super.f(); } }"),
      "[line 1] Error at 'super': Can't use 'super' in a class with no superclass."
    );
  }

  #[test]
  fn class_inheriting_from_itself() {
    assert_eq!(
      first_error("class A < A {}"),
      "[line 1] Error at 'A': A class can't inherit from itself."
    );
  }

  #[test]
  fn return_at_top_level() {
    assert_eq!(
      first_error("return 1;"),
      "[line 1] Error at 'return': Can't return from top-level code."
    );
  }

  #[test]
  fn return_value_from_initializer() {
    assert_eq!(
      first_error("class A { init() { return 1; } }"),
      "[line 1] Error at 'return': Can't return a value from an initializer."
    );
  }

  #[test]
  fn unterminated_string_is_a_scanner_error() {
    assert_eq!(
      first_error("var s = \"oops"),
      "[line 1] Error: Unterminated string."
    );
  }

  #[test]
  fn unexpected_character() {
    assert_eq!(first_error("var @ = 1;"), "[line 1] Error: Unexpected character.");
  }

  #[test]
  fn require_is_reserved() {
    assert_eq!(
      first_error("require \"foo\";"),
      "[line 1] Error at 'require': Modules are not supported yet."
    );
  }

  #[test]
  fn missing_semicolon_after_print() {
    assert_eq!(
      first_error("print 1"),
      "[line 1] Error at end: Expected ; after value."
    );
  }

  #[test]
  fn panic_mode_reports_once_per_statement() {
    let errors = compile_errors("var = 1; var y = 2; var = 3;");
    assert_eq!(errors.len(), 2);
  }

  #[test]
  fn error_line_tracks_newlines() {
    assert_eq!(
      first_error("var a = 1;\nvar b = ;\n"),
      "[line 2] Error at ';': Expect expression."
    );
  }

  #[test]
  fn too_many_parameters() {
    let params = (0..256)
      .map(|i| format!("p{i}"))
      .collect::<Vec<_>>()
      .join(", ");
    let source = format!("fun f({params}) {{}}");
    let errors = compile_errors(&source);
    assert!(errors[0].contains("Can't have more than 255 parameters."));
  }

  #[test]
  fn too_many_arguments() {
    let args = (0..256).map(|_| "1").collect::<Vec<_>>().join(", ");
    let source = format!("fun f() {{}} f({args});");
    let errors = compile_errors(&source);
    assert!(errors[0].contains("Can't have more than 255 arguments."));
  }

  #[cfg(feature = "check-recursion-limit")]
  #[test]
  fn pathological_nesting_is_rejected() {
    let source = format!("print {}1{};", "(".repeat(50_000), ")".repeat(50_000));
    let errors = compile_errors(&source);
    assert!(errors[0].contains("Expression nesting too deep."));
  }

  #[test]
  fn too_many_upvalues() {
    let mut decls = String::new();
    let mut uses = String::new();
    for i in 0..257 {
      decls.push_str(&format!("var v{i} = {i}; "));
      uses.push_str(&format!("print v{i}; "));
    }
    let source = format!("fun outer() {{ {decls} fun inner() {{ {uses} }} }}");
    let errors = compile_errors(&source);
    assert!(errors[0].contains("Too many closure variables in function."));
  }
}
