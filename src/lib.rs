//! tako — a small dynamically-typed scripting language: a single-pass
//! bytecode compiler, a stack-based VM, and a precise mark-and-sweep
//! garbage collector.
//!
//! ```
//! use tako::Tako;
//!
//! let mut tako = Tako::with_io(Vec::new());
//! tako.eval("print 1 + 2;").unwrap();
//! let stdout = tako.io::<Vec<u8>>().unwrap();
//! assert_eq!(std::str::from_utf8(stdout).unwrap(), "3\n");
//! ```

pub mod builtins;
mod bytecode;
mod compiler;
mod error;
mod gc;
mod span;
mod syntax;
mod table;
mod value;
mod vm;

pub use error::{CompileError, Error, InterpretResult, RuntimeError};
pub use value::object::NativeFn;
pub use value::Value;
pub use vm::{Stdout, Vm};

use indexmap::IndexMap;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A complete interpreter: compiler, VM and heap behind one handle.
///
/// There is no hidden global state; every `Tako` is independent, and
/// globals persist across [`eval`](Tako::eval) calls on the same
/// instance, which is what a REPL wants.
pub struct Tako {
  vm: Vm,
}

impl Tako {
  pub fn builder() -> TakoBuilder {
    TakoBuilder::new()
  }

  /// Shorthand for a VM writing to `io` instead of the process stdout.
  pub fn with_io(io: impl Stdout) -> Tako {
    Self::builder().with_io(io).build()
  }

  /// Compile and run `source`. Errors come back as values; nothing is
  /// printed except the program's own output.
  pub fn eval(&mut self, source: &str) -> Result<()> {
    self.vm.eval(source)
  }

  /// The classic host entry point: like [`eval`](Tako::eval), but
  /// diagnostics go to stderr and the result collapses to three states.
  pub fn interpret(&mut self, source: &str) -> InterpretResult {
    match self.eval(source) {
      Ok(()) => InterpretResult::Ok,
      Err(Error::Compile(errors)) => {
        for error in &errors {
          eprintln!("{error}");
        }
        InterpretResult::CompileError
      }
      Err(Error::Runtime(error)) => {
        eprintln!("{error}");
        InterpretResult::RuntimeError
      }
    }
  }

  /// Register a native function as a read-only global. Call before the
  /// name is first compiled.
  pub fn define_native(&mut self, name: &str, function: NativeFn) {
    self.vm.define_native(name, function);
  }

  /// Compile `source` without running it and return the disassembly of
  /// the script and every nested function. Diagnostic only.
  pub fn dump(&mut self, source: &str) -> Result<String> {
    let function = self.vm.compile_only(source)?;
    Ok(bytecode::disasm::disassemble_function(
      self.vm.heap(),
      function,
    ))
  }

  /// Downcast the configured output sink, e.g. to read captured output
  /// back out of a `Vec<u8>`.
  pub fn io<T: 'static>(&self) -> Option<&T> {
    self.vm.io().as_any().downcast_ref::<T>()
  }
}

impl Default for Tako {
  fn default() -> Self {
    Self::builder().build()
  }
}

pub struct TakoBuilder {
  stdout: Option<Box<dyn Stdout>>,
  stress_gc: bool,
  natives: IndexMap<String, NativeFn>,
}

impl TakoBuilder {
  fn new() -> TakoBuilder {
    TakoBuilder {
      stdout: None,
      stress_gc: false,
      natives: IndexMap::new(),
    }
  }

  pub fn with_io(mut self, io: impl Stdout) -> TakoBuilder {
    self.stdout = Some(Box::new(io));
    self
  }

  /// Collect at every allocation safe point. Slow, and exactly the
  /// point: any GC bug becomes deterministic.
  pub fn stress_gc(mut self, enabled: bool) -> TakoBuilder {
    self.stress_gc = enabled;
    self
  }

  pub fn with_native(mut self, name: impl Into<String>, function: NativeFn) -> TakoBuilder {
    self.natives.insert(name.into(), function);
    self
  }

  pub fn build(self) -> Tako {
    let stdout = self
      .stdout
      .unwrap_or_else(|| Box::new(std::io::stdout()));
    let mut vm = Vm::new(stdout, self.stress_gc);
    builtins::register_default(&mut vm);
    for (name, function) in &self.natives {
      vm.define_native(name, *function);
    }
    Tako { vm }
  }
}
