//! The interpreter: a stack machine over [`Chunk`]s with call frames,
//! closures, classes and bound methods.

use std::any::Any;
use std::io::Write;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::opcode::Opcode;
use crate::error::{Error, RuntimeError, TraceLine};
use crate::gc::{Handle, Heap};
use crate::table::{AddressTable, Key, VarProps};
use crate::value::object::{
  Array, BoundMethod, Class, Closure, Function, Instance, Native, NativeFn, Object, Str, Upvalue,
};
use crate::value::Value;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Where `print` output goes. Defaults to the process stdout; tests plug
/// in a `Vec<u8>` and read it back through [`Vm::io`].
pub trait Stdout: Write + Any {
  fn as_any(&self) -> &dyn Any;
}

impl<T: Write + Any> Stdout for T {
  fn as_any(&self) -> &dyn Any {
    self
  }
}

struct CallFrame {
  closure: Handle<Closure>,
  ip: usize,
  /// Stack index of slot 0: the callee (or receiver) itself.
  base: usize,
}

pub struct Vm {
  heap: Heap,
  /// Global values by address. `None` marks an address that exists in the
  /// namespace but was never defined.
  globals: Vec<Option<Value>>,
  /// The global namespace, shared with the compiler.
  globals_table: AddressTable,
  stack: Vec<Value>,
  frames: Vec<CallFrame>,
  /// Open upvalues, ordered by descending stack slot.
  open_upvalues: Vec<Handle<Upvalue>>,
  init_string: Handle<Str>,
  stdout: Box<dyn Stdout>,
}

impl Vm {
  pub fn new(stdout: Box<dyn Stdout>, stress_gc: bool) -> Vm {
    let mut heap = Heap::new(stress_gc);
    let init_string = heap.intern("init");
    Vm {
      heap,
      globals: Vec::new(),
      globals_table: AddressTable::new(),
      stack: Vec::with_capacity(STACK_MAX),
      frames: Vec::with_capacity(FRAMES_MAX),
      open_upvalues: Vec::new(),
      init_string,
      stdout,
    }
  }

  pub fn io(&self) -> &dyn Stdout {
    &*self.stdout
  }

  pub(crate) fn heap(&self) -> &Heap {
    &self.heap
  }

  pub(crate) fn heap_mut(&mut self) -> &mut Heap {
    &mut self.heap
  }

  pub(crate) fn globals_table(&self) -> &AddressTable {
    &self.globals_table
  }

  pub(crate) fn globals_table_mut(&mut self) -> &mut AddressTable {
    &mut self.globals_table
  }

  /// Register a host function as a read-only global. Must happen before
  /// the name is first compiled.
  pub fn define_native(&mut self, name: &str, function: NativeFn) {
    self.maybe_collect();
    let name = self.heap.intern(name);
    self.heap.push_temp(Value::from(name));
    self.maybe_collect();
    let native = self.heap.alloc(Native { function });
    self.heap.pop_temp();

    let key = self.heap.key(name);
    let addr = match self.globals_table.address_of(key) {
      Some(addr) => addr,
      None => self.globals_table.add(VarProps {
        readonly: true,
        ..VarProps::new(key)
      }),
    };
    self.globals_table.props_mut(addr).readonly = true;
    self.define_global(addr, Value::from(native));
  }

  /// Compile `source` without running it.
  pub(crate) fn compile_only(&mut self, source: &str) -> Result<Handle<Function>, Error> {
    crate::compiler::compile(self, source).map_err(Error::Compile)
  }

  /// Compile and run `source` against this VM's globals.
  pub fn eval(&mut self, source: &str) -> Result<(), Error> {
    let function = crate::compiler::compile(self, source).map_err(Error::Compile)?;

    self.reset_stack();
    self.push(Value::from(function));
    self.maybe_collect();
    let closure = self.heap.alloc(Closure {
      function,
      upvalues: Vec::new(),
    });
    self.pop();
    self.push(Value::from(closure));

    self
      .call_closure(closure, 0)
      .and_then(|()| self.run())
      .map_err(|error| {
        self.reset_stack();
        Error::Runtime(error)
      })
  }

  // ---- garbage collection ------------------------------------------------

  /// Run a full cycle right now.
  pub(crate) fn collect_garbage(&mut self) {
    self.collect_with(|_| {});
  }

  /// Run a full cycle, letting the caller mark extra roots (the compiler
  /// marks its in-progress functions this way).
  pub(crate) fn collect_with(&mut self, extra: impl FnOnce(&mut Heap)) {
    self.heap.begin_cycle();
    self.mark_roots();
    extra(&mut self.heap);
    self.heap.finish_cycle();
  }

  /// Allocation safe point: collect if the heuristic (or stress mode)
  /// says so. Callers must have everything they hold rooted.
  pub(crate) fn maybe_collect(&mut self) {
    if self.heap.should_collect() {
      self.collect_garbage();
    }
  }

  fn mark_roots(&mut self) {
    let Vm {
      heap,
      globals,
      globals_table,
      stack,
      frames,
      open_upvalues,
      init_string,
      ..
    } = self;

    for value in stack.iter() {
      heap.mark_value(*value);
    }
    for frame in frames.iter() {
      heap.mark_handle(frame.closure);
    }
    for upvalue in open_upvalues.iter() {
      heap.mark_handle(*upvalue);
    }
    for value in globals.iter().flatten() {
      heap.mark_value(*value);
    }
    for props in globals_table.iter_props() {
      heap.mark_handle(props.name.handle);
    }
    heap.mark_handle(*init_string);
  }

  // ---- stack -------------------------------------------------------------

  fn push(&mut self, value: Value) {
    self.stack.push(value);
  }

  fn pop(&mut self) -> Value {
    self.stack.pop().expect("pop from empty value stack")
  }

  fn peek(&self, distance: usize) -> Value {
    self.stack[self.stack.len() - 1 - distance]
  }

  fn reset_stack(&mut self) {
    self.stack.clear();
    self.frames.clear();
    self.open_upvalues.clear();
  }

  // ---- frame helpers -----------------------------------------------------

  fn frame(&self) -> &CallFrame {
    self.frames.last().expect("no active call frame")
  }

  fn frame_mut(&mut self) -> &mut CallFrame {
    self.frames.last_mut().expect("no active call frame")
  }

  fn current_chunk(&self) -> &Chunk {
    let frame = self.frame();
    &self.heap[self.heap[frame.closure].function].chunk
  }

  fn read_byte(&mut self) -> u8 {
    let ip = self.frame().ip;
    let byte = self.current_chunk().code[ip];
    self.frame_mut().ip += 1;
    byte
  }

  fn read_u16(&mut self) -> u16 {
    let hi = self.read_byte() as u16;
    let lo = self.read_byte() as u16;
    (hi << 8) | lo
  }

  /// One operand byte for short opcodes, three (big-endian) for long.
  fn read_index(&mut self, long: bool) -> u32 {
    if long {
      let b1 = self.read_byte() as u32;
      let b2 = self.read_byte() as u32;
      let b3 = self.read_byte() as u32;
      (b1 << 16) | (b2 << 8) | b3
    } else {
      self.read_byte() as u32
    }
  }

  fn read_constant(&mut self, long: bool) -> Value {
    let index = self.read_index(long) as usize;
    self.current_chunk().constants[index]
  }

  fn read_string_constant(&mut self, long: bool) -> Handle<Str> {
    let value = self.read_constant(long);
    value
      .as_obj()
      .and_then(|r| self.heap.cast::<Str>(r))
      .expect("constant is not a string")
  }

  // ---- errors ------------------------------------------------------------

  fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
    let mut trace = Vec::with_capacity(self.frames.len());
    for frame in self.frames.iter().rev() {
      let function = &self.heap[self.heap[frame.closure].function];
      trace.push(TraceLine {
        line: function.chunk.line_at(frame.ip.saturating_sub(1)),
        name: function.name.map(|name| self.heap[name].chars.clone()),
      });
    }
    RuntimeError {
      message: message.into(),
      trace,
    }
  }

  fn global_name(&self, addr: u32) -> String {
    let name = self.globals_table.props(addr).name.handle;
    self.heap[name].chars.clone()
  }

  // ---- calls -------------------------------------------------------------

  fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
    enum Callee {
      Closure(Handle<Closure>),
      Native(NativeFn),
      Class(Handle<Class>),
      Bound(Value, Handle<Closure>),
      NotCallable,
    }

    let callee = match callee.as_obj() {
      Some(r) => match self.heap.get(r) {
        Object::Closure(_) => Callee::Closure(self.heap.cast(r).expect("checked")),
        Object::Native(native) => Callee::Native(native.function),
        Object::Class(_) => Callee::Class(self.heap.cast(r).expect("checked")),
        Object::BoundMethod(bound) => Callee::Bound(bound.receiver, bound.method),
        _ => Callee::NotCallable,
      },
      None => Callee::NotCallable,
    };

    match callee {
      Callee::Closure(closure) => self.call_closure(closure, argc),
      Callee::Native(function) => self.call_native(function, argc),
      Callee::Class(class) => self.construct(class, argc),
      Callee::Bound(receiver, method) => {
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = receiver;
        self.call_closure(method, argc)
      }
      Callee::NotCallable => Err(self.runtime_error("Can only call functions and classes.")),
    }
  }

  fn call_closure(&mut self, closure: Handle<Closure>, argc: usize) -> Result<(), RuntimeError> {
    let arity = self.heap[self.heap[closure].function].arity as usize;
    if argc != arity {
      return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
    }
    if self.frames.len() == FRAMES_MAX {
      return Err(self.runtime_error("Stack overflow."));
    }
    self.frames.push(CallFrame {
      closure,
      ip: 0,
      base: self.stack.len() - argc - 1,
    });
    Ok(())
  }

  fn call_native(&mut self, function: NativeFn, argc: usize) -> Result<(), RuntimeError> {
    // Copy the arguments out so the native can take `&mut Vm`; they stay
    // on the stack as roots until the call returns.
    let args: Vec<Value> = self.stack[self.stack.len() - argc..].to_vec();
    let result = function(self, &args).map_err(|message| self.runtime_error(message))?;
    self.stack.truncate(self.stack.len() - argc - 1);
    self.push(result);
    Ok(())
  }

  fn construct(&mut self, class: Handle<Class>, argc: usize) -> Result<(), RuntimeError> {
    self.maybe_collect();
    let instance = self.heap.alloc(Instance {
      class,
      fields: crate::table::Table::new(),
    });
    let slot = self.stack.len() - argc - 1;
    self.stack[slot] = Value::from(instance);

    let key = self.heap.key(self.init_string);
    match self.heap[class].methods.get(key).copied() {
      Some(init) => self.call_closure(init, argc),
      None if argc != 0 => {
        Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")))
      }
      None => Ok(()),
    }
  }

  fn invoke(&mut self, name: Handle<Str>, argc: usize) -> Result<(), RuntimeError> {
    let receiver = self.peek(argc);
    let Some(instance) = receiver.as_obj().and_then(|r| self.heap.cast::<Instance>(r)) else {
      return Err(self.runtime_error("Only instances have methods."));
    };

    // A field shadowing the method name wins, exactly like a property
    // read followed by a call would.
    let key = self.heap.key(name);
    if let Some(field) = self.heap[instance].fields.get(key).copied() {
      let slot = self.stack.len() - argc - 1;
      self.stack[slot] = field;
      return self.call_value(field, argc);
    }

    let class = self.heap[instance].class;
    self.invoke_from_class(class, name, argc)
  }

  fn invoke_from_class(
    &mut self,
    class: Handle<Class>,
    name: Handle<Str>,
    argc: usize,
  ) -> Result<(), RuntimeError> {
    let key = self.heap.key(name);
    let Some(method) = self.heap[class].methods.get(key).copied() else {
      return Err(
        self.runtime_error(format!("Undefined property '{}'.", self.heap[name].chars)),
      );
    };
    self.call_closure(method, argc)
  }

  /// Bind the method `name` of `class` to the receiver at the top of the
  /// stack, replacing it.
  fn bind_method(&mut self, class: Handle<Class>, name: Handle<Str>) -> Result<(), RuntimeError> {
    let key = self.heap.key(name);
    let Some(method) = self.heap[class].methods.get(key).copied() else {
      return Err(
        self.runtime_error(format!("Undefined property '{}'.", self.heap[name].chars)),
      );
    };
    self.maybe_collect();
    let bound = self.heap.alloc(BoundMethod {
      receiver: self.peek(0),
      method,
    });
    self.pop();
    self.push(Value::from(bound));
    Ok(())
  }

  // ---- upvalues ----------------------------------------------------------

  fn open_upvalue_slot(&self, handle: Handle<Upvalue>) -> usize {
    match self.heap[handle] {
      Upvalue::Open(slot) => slot,
      Upvalue::Closed(_) => unreachable!("closed upvalue in open list"),
    }
  }

  /// Find or create the open upvalue for `slot`, keeping the list sorted
  /// by descending stack slot.
  fn capture_upvalue(&mut self, slot: usize) -> Handle<Upvalue> {
    let mut index = 0;
    while index < self.open_upvalues.len() {
      let existing = self.open_upvalues[index];
      let existing_slot = self.open_upvalue_slot(existing);
      if existing_slot == slot {
        return existing;
      }
      if existing_slot < slot {
        break;
      }
      index += 1;
    }

    self.maybe_collect();
    let upvalue = self.heap.alloc(Upvalue::Open(slot));
    self.open_upvalues.insert(index, upvalue);
    upvalue
  }

  /// Close every open upvalue at or above `last`, moving the stack value
  /// into the upvalue itself.
  fn close_upvalues(&mut self, last: usize) {
    while let Some(&upvalue) = self.open_upvalues.first() {
      let slot = self.open_upvalue_slot(upvalue);
      if slot < last {
        break;
      }
      self.heap[upvalue] = Upvalue::Closed(self.stack[slot]);
      self.open_upvalues.remove(0);
    }
  }

  // ---- dispatch ----------------------------------------------------------

  fn run(&mut self) -> Result<(), RuntimeError> {
    loop {
      #[cfg(feature = "trace-execution")]
      self.trace_instruction();

      let byte = self.read_byte();
      let op = match Opcode::try_from(byte) {
        Ok(op) => op,
        Err(invalid) => return Err(self.runtime_error(invalid.to_string())),
      };

      match op {
        Opcode::Constant | Opcode::ConstantLong => {
          let value = self.read_constant(op == Opcode::ConstantLong);
          self.push(value);
        }
        Opcode::Nil => self.push(Value::Nil),
        Opcode::True => self.push(Value::Bool(true)),
        Opcode::False => self.push(Value::Bool(false)),
        Opcode::Pop => {
          self.pop();
        }

        Opcode::GetLocal | Opcode::GetLocalLong => {
          let slot = self.read_index(op == Opcode::GetLocalLong) as usize;
          let base = self.frame().base;
          self.push(self.stack[base + slot]);
        }
        Opcode::SetLocal | Opcode::SetLocalLong => {
          let slot = self.read_index(op == Opcode::SetLocalLong) as usize;
          let base = self.frame().base;
          self.stack[base + slot] = self.peek(0);
        }

        Opcode::GetGlobal | Opcode::GetGlobalLong => {
          let addr = self.read_index(op == Opcode::GetGlobalLong);
          match self.globals.get(addr as usize).copied().flatten() {
            Some(value) => self.push(value),
            None => {
              return Err(
                self.runtime_error(format!("Undefined variable '{}'.", self.global_name(addr))),
              )
            }
          }
        }
        Opcode::DefineGlobal | Opcode::DefineGlobalLong => {
          let addr = self.read_index(op == Opcode::DefineGlobalLong);
          let value = self.pop();
          self.define_global(addr, value);
        }
        Opcode::SetGlobal | Opcode::SetGlobalLong => {
          let addr = self.read_index(op == Opcode::SetGlobalLong);
          if self.globals.get(addr as usize).copied().flatten().is_none() {
            return Err(
              self.runtime_error(format!("Undefined variable '{}'.", self.global_name(addr))),
            );
          }
          self.globals[addr as usize] = Some(self.peek(0));
        }

        Opcode::GetUpvalue => {
          let index = self.read_byte() as usize;
          let upvalue = self.heap[self.frame().closure].upvalues[index];
          let value = match self.heap[upvalue] {
            Upvalue::Open(slot) => self.stack[slot],
            Upvalue::Closed(value) => value,
          };
          self.push(value);
        }
        Opcode::SetUpvalue => {
          let index = self.read_byte() as usize;
          let upvalue = self.heap[self.frame().closure].upvalues[index];
          let value = self.peek(0);
          let slot = match self.heap[upvalue] {
            Upvalue::Open(slot) => Some(slot),
            Upvalue::Closed(_) => None,
          };
          match slot {
            Some(slot) => self.stack[slot] = value,
            None => self.heap[upvalue] = Upvalue::Closed(value),
          }
        }

        Opcode::GetProperty | Opcode::GetPropertyLong => {
          let name = self.read_string_constant(op == Opcode::GetPropertyLong);
          let receiver = self.peek(0);
          let Some(instance) = receiver.as_obj().and_then(|r| self.heap.cast::<Instance>(r))
          else {
            return Err(self.runtime_error("Only instances have properties."));
          };
          let key = self.heap.key(name);
          match self.heap[instance].fields.get(key).copied() {
            Some(value) => {
              self.pop();
              self.push(value);
            }
            None => {
              let class = self.heap[instance].class;
              self.bind_method(class, name)?;
            }
          }
        }
        Opcode::SetProperty | Opcode::SetPropertyLong => {
          let name = self.read_string_constant(op == Opcode::SetPropertyLong);
          let Some(instance) = self.peek(1).as_obj().and_then(|r| self.heap.cast::<Instance>(r))
          else {
            return Err(self.runtime_error("Only instances have fields."));
          };
          let key = self.heap.key(name);
          let value = self.peek(0);
          let before = self.heap[instance].fields.heap_size();
          self.heap[instance].fields.set(key, value);
          let after = self.heap[instance].fields.heap_size();
          self.heap.tally(after - before);
          let value = self.pop();
          self.pop();
          self.push(value);
        }

        Opcode::GetSuper | Opcode::GetSuperLong => {
          let name = self.read_string_constant(op == Opcode::GetSuperLong);
          let superclass = self.pop();
          let Some(class) = superclass.as_obj().and_then(|r| self.heap.cast::<Class>(r)) else {
            return Err(self.runtime_error("Superclass must be a class."));
          };
          self.bind_method(class, name)?;
        }

        Opcode::Equal => {
          let b = self.pop();
          let a = self.pop();
          self.push(Value::Bool(a == b));
        }
        Opcode::NotEqual => {
          let b = self.pop();
          let a = self.pop();
          self.push(Value::Bool(a != b));
        }
        Opcode::Greater => self.binary_compare(op)?,
        Opcode::GreaterEqual => self.binary_compare(op)?,
        Opcode::Less => self.binary_compare(op)?,
        Opcode::LessEqual => self.binary_compare(op)?,

        Opcode::Add => {
          match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
              self.pop();
              self.pop();
              self.push(Value::Number(a + b));
            }
            (Value::Obj(a), Value::Obj(b)) => {
              let (Some(a), Some(b)) = (self.heap.cast::<Str>(a), self.heap.cast::<Str>(b))
              else {
                return Err(
                  self.runtime_error("Operands must be two numbers or two strings."),
                );
              };
              let mut chars =
                String::with_capacity(self.heap[a].chars.len() + self.heap[b].chars.len());
              chars.push_str(&self.heap[a].chars);
              chars.push_str(&self.heap[b].chars);
              // Operands stay on the stack across the allocation.
              self.maybe_collect();
              let result = self.heap.intern_owned(chars);
              self.pop();
              self.pop();
              self.push(Value::from(result));
            }
            _ => {
              return Err(self.runtime_error("Operands must be two numbers or two strings."))
            }
          }
        }
        Opcode::Subtract | Opcode::Multiply | Opcode::Divide => self.binary_arithmetic(op)?,

        Opcode::Not => {
          let value = self.pop();
          self.push(Value::Bool(value.is_falsey()));
        }
        Opcode::Negate => {
          let Some(value) = self.peek(0).as_number() else {
            return Err(self.runtime_error("Operand must be a number."));
          };
          self.pop();
          self.push(Value::Number(-value));
        }

        Opcode::Print => {
          let value = self.pop();
          let _ = writeln!(self.stdout, "{}", self.heap.show(value));
        }

        Opcode::Jump => {
          let offset = self.read_u16() as usize;
          self.frame_mut().ip += offset;
        }
        Opcode::JumpIfFalse => {
          let offset = self.read_u16() as usize;
          if self.peek(0).is_falsey() {
            self.frame_mut().ip += offset;
          }
        }
        Opcode::Loop => {
          let offset = self.read_u16() as usize;
          self.frame_mut().ip -= offset;
        }

        Opcode::Call => {
          let argc = self.read_byte() as usize;
          self.call_value(self.peek(argc), argc)?;
        }
        Opcode::Invoke | Opcode::InvokeLong => {
          let name = self.read_string_constant(op == Opcode::InvokeLong);
          let argc = self.read_byte() as usize;
          self.invoke(name, argc)?;
        }
        Opcode::SuperInvoke | Opcode::SuperInvokeLong => {
          let name = self.read_string_constant(op == Opcode::SuperInvokeLong);
          let argc = self.read_byte() as usize;
          let superclass = self.pop();
          let Some(class) = superclass.as_obj().and_then(|r| self.heap.cast::<Class>(r)) else {
            return Err(self.runtime_error("Superclass must be a class."));
          };
          self.invoke_from_class(class, name, argc)?;
        }

        Opcode::Closure | Opcode::ClosureLong => {
          let value = self.read_constant(op == Opcode::ClosureLong);
          let function: Handle<Function> = value
            .as_obj()
            .and_then(|r| self.heap.cast(r))
            .expect("closure constant is not a function");
          let upvalue_count = self.heap[function].upvalue_count as usize;

          self.maybe_collect();
          let closure = self.heap.alloc(Closure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
          });
          self.push(Value::from(closure));

          for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_u16() as usize;
            let upvalue = if is_local {
              let base = self.frame().base;
              self.capture_upvalue(base + index)
            } else {
              self.heap[self.frame().closure].upvalues[index]
            };
            self.heap[closure].upvalues.push(upvalue);
          }
        }
        Opcode::CloseUpvalue => {
          let top = self.stack.len() - 1;
          self.close_upvalues(top);
          self.pop();
        }

        Opcode::Return => {
          let result = self.pop();
          let frame = self.frames.pop().expect("return with no call frame");
          self.close_upvalues(frame.base);
          if self.frames.is_empty() {
            // The script closure itself.
            self.pop();
            return Ok(());
          }
          self.stack.truncate(frame.base);
          self.push(result);
        }

        Opcode::Class | Opcode::ClassLong => {
          let name = self.read_string_constant(op == Opcode::ClassLong);
          self.maybe_collect();
          let class = self.heap.alloc(Class {
            name,
            methods: crate::table::Table::new(),
          });
          self.push(Value::from(class));
        }
        Opcode::Inherit => {
          let Some(superclass) = self.peek(1).as_obj().and_then(|r| self.heap.cast::<Class>(r))
          else {
            return Err(self.runtime_error("Superclass must be a class."));
          };
          let subclass = self
            .peek(0)
            .as_obj()
            .and_then(|r| self.heap.cast::<Class>(r))
            .expect("inherit target is not a class");

          let methods: Vec<(Key, Handle<Closure>)> = self.heap[superclass]
            .methods
            .iter()
            .map(|(key, method)| (key, *method))
            .collect();
          let before = self.heap[subclass].methods.heap_size();
          for (key, method) in methods {
            self.heap[subclass].methods.set(key, method);
          }
          let after = self.heap[subclass].methods.heap_size();
          self.heap.tally(after - before);

          // The superclass stays behind as the `super` local.
          self.pop();
        }
        Opcode::Method | Opcode::MethodLong => {
          let name = self.read_string_constant(op == Opcode::MethodLong);
          let method = self
            .peek(0)
            .as_obj()
            .and_then(|r| self.heap.cast::<Closure>(r))
            .expect("method is not a closure");
          let class = self
            .peek(1)
            .as_obj()
            .and_then(|r| self.heap.cast::<Class>(r))
            .expect("method target is not a class");

          let key = self.heap.key(name);
          let before = self.heap[class].methods.heap_size();
          self.heap[class].methods.set(key, method);
          let after = self.heap[class].methods.heap_size();
          self.heap.tally(after - before);
          self.pop();
        }

        Opcode::ArrayInit => {
          let count = self.read_byte() as usize;
          let start = self.stack.len() - count;
          let elements = self.stack[start..].to_vec();
          // Elements stay on the stack across the allocation.
          self.maybe_collect();
          let array = self.heap.alloc(Array { elements });
          self.stack.truncate(start);
          self.push(Value::from(array));
        }
        Opcode::ArrayAdd => {
          let Some(array) = self.peek(1).as_obj().and_then(|r| self.heap.cast::<Array>(r))
          else {
            return Err(self.runtime_error("Can only append to arrays."));
          };
          let value = self.peek(0);
          let before = self.heap[array].elements.capacity();
          self.heap[array].elements.push(value);
          let after = self.heap[array].elements.capacity();
          self
            .heap
            .tally((after - before) * std::mem::size_of::<Value>());
          let value = self.pop();
          self.pop();
          self.push(value);
        }

        Opcode::GetPropertyStack => {
          let key = self.pop();
          let receiver = self.pop();
          let value = self.keyed_get(receiver, key)?;
          match value {
            KeyedGet::Value(value) => self.push(value),
            KeyedGet::BindMethod(class, name) => {
              self.push(receiver);
              self.bind_method(class, name)?;
            }
          }
        }
        Opcode::SetPropertyStack => {
          let value = self.pop();
          let key = self.pop();
          let receiver = self.pop();
          self.keyed_set(receiver, key, value)?;
          self.push(value);
        }
      }
    }
  }

  #[cfg(feature = "trace-execution")]
  fn trace_instruction(&self) {
    use std::fmt::Write as _;

    let mut line = String::from("          ");
    for value in &self.stack {
      let _ = write!(line, "[ {} ]", self.heap.show(*value));
    }
    line.push('\n');
    crate::bytecode::disasm::instruction(
      &self.heap,
      self.current_chunk(),
      self.frame().ip,
      &mut line,
    );
    eprint!("{line}");
  }

  fn binary_compare(&mut self, op: Opcode) -> Result<(), RuntimeError> {
    let (Some(a), Some(b)) = (self.peek(1).as_number(), self.peek(0).as_number()) else {
      return Err(self.runtime_error("Operands must be numbers."));
    };
    self.pop();
    self.pop();
    let result = match op {
      Opcode::Greater => a > b,
      Opcode::GreaterEqual => a >= b,
      Opcode::Less => a < b,
      Opcode::LessEqual => a <= b,
      _ => unreachable!("not a comparison opcode"),
    };
    self.push(Value::Bool(result));
    Ok(())
  }

  fn binary_arithmetic(&mut self, op: Opcode) -> Result<(), RuntimeError> {
    let (Some(a), Some(b)) = (self.peek(1).as_number(), self.peek(0).as_number()) else {
      return Err(self.runtime_error("Operands must be numbers."));
    };
    self.pop();
    self.pop();
    let result = match op {
      Opcode::Subtract => a - b,
      Opcode::Multiply => a * b,
      Opcode::Divide => a / b,
      _ => unreachable!("not an arithmetic opcode"),
    };
    self.push(Value::Number(result));
    Ok(())
  }

  fn array_index(&self, array: Handle<Array>, key: Value) -> Result<usize, RuntimeError> {
    let Some(index) = key.as_number() else {
      return Err(self.runtime_error("Array index must be a number."));
    };
    let len = self.heap[array].elements.len();
    if index.fract() != 0.0 || index < 0.0 || index as usize >= len {
      return Err(self.runtime_error("Array index out of range."));
    }
    Ok(index as usize)
  }

  fn keyed_get(&mut self, receiver: Value, key: Value) -> Result<KeyedGet, RuntimeError> {
    let object = receiver.as_obj();
    if let Some(array) = object.and_then(|r| self.heap.cast::<Array>(r)) {
      let index = self.array_index(array, key)?;
      return Ok(KeyedGet::Value(self.heap[array].elements[index]));
    }
    if let Some(instance) = object.and_then(|r| self.heap.cast::<Instance>(r)) {
      let Some(name) = key.as_obj().and_then(|r| self.heap.cast::<Str>(r)) else {
        return Err(self.runtime_error("Property name must be a string."));
      };
      let table_key = self.heap.key(name);
      return match self.heap[instance].fields.get(table_key).copied() {
        Some(value) => Ok(KeyedGet::Value(value)),
        None => Ok(KeyedGet::BindMethod(self.heap[instance].class, name)),
      };
    }
    Err(self.runtime_error("Only arrays and instances support indexing."))
  }

  fn keyed_set(&mut self, receiver: Value, key: Value, value: Value) -> Result<(), RuntimeError> {
    let object = receiver.as_obj();
    if let Some(array) = object.and_then(|r| self.heap.cast::<Array>(r)) {
      let index = self.array_index(array, key)?;
      self.heap[array].elements[index] = value;
      return Ok(());
    }
    if let Some(instance) = object.and_then(|r| self.heap.cast::<Instance>(r)) {
      let Some(name) = key.as_obj().and_then(|r| self.heap.cast::<Str>(r)) else {
        return Err(self.runtime_error("Property name must be a string."));
      };
      let table_key = self.heap.key(name);
      let before = self.heap[instance].fields.heap_size();
      self.heap[instance].fields.set(table_key, value);
      let after = self.heap[instance].fields.heap_size();
      self.heap.tally(after - before);
      return Ok(());
    }
    Err(self.runtime_error("Only arrays and instances support indexing."))
  }

  fn define_global(&mut self, addr: u32, value: Value) {
    let addr = addr as usize;
    if addr >= self.globals.len() {
      self.globals.resize(addr + 1, None);
    }
    self.globals[addr] = Some(value);
  }
}

enum KeyedGet {
  Value(Value),
  BindMethod(Handle<Class>, Handle<Str>),
}

#[cfg(test)]
mod tests {
  use super::*;

  fn vm() -> Vm {
    Vm::new(Box::new(Vec::<u8>::new()), false)
  }

  #[test]
  fn capture_upvalue_is_ordered_and_deduped() {
    let mut vm = vm();
    vm.stack
      .extend([Value::Number(0.0), Value::Number(1.0), Value::Number(2.0)]);

    let a = vm.capture_upvalue(2);
    let b = vm.capture_upvalue(0);
    let c = vm.capture_upvalue(1);
    assert_eq!(vm.capture_upvalue(2), a);
    assert_eq!(vm.capture_upvalue(0), b);

    // Descending by stack slot.
    let slots: Vec<usize> = vm
      .open_upvalues
      .iter()
      .map(|u| vm.open_upvalue_slot(*u))
      .collect();
    assert_eq!(slots, vec![2, 1, 0]);

    // Closing from slot 1 up closes two of them and leaves slot 0 open.
    vm.close_upvalues(1);
    assert_eq!(vm.open_upvalues.len(), 1);
    assert_eq!(vm.open_upvalue_slot(vm.open_upvalues[0]), 0);
    match vm.heap[c] {
      Upvalue::Closed(Value::Number(n)) => assert_eq!(n, 1.0),
      _ => panic!("expected a closed upvalue holding 1"),
    }
  }

  #[test]
  fn open_upvalues_drain_after_a_run() {
    let mut vm = vm();
    vm.eval(
      "fun outer() {\
         var x = 1;\
         fun inner() { return x; }\
         return inner;\
       }\
       outer()();",
    )
    .unwrap();
    assert!(vm.open_upvalues.is_empty());
    assert!(vm.frames.is_empty());
    assert!(vm.stack.is_empty());
  }

  #[test]
  fn runtime_error_resets_the_stack() {
    let mut vm = vm();
    assert!(vm.eval("print 1 + nil;").is_err());
    assert!(vm.stack.is_empty());
    assert!(vm.frames.is_empty());
    assert!(vm.open_upvalues.is_empty());
  }

  #[test]
  fn define_native_makes_a_readonly_global() {
    fn nothing(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
      Ok(Value::Nil)
    }

    let mut vm = vm();
    vm.define_native("nothing", nothing);
    let name = vm.heap.intern("nothing");
    let key = vm.heap.key(name);
    let addr = vm.globals_table.address_of(key).unwrap();
    assert!(vm.globals_table.props(addr).readonly);
    assert!(vm.globals[addr as usize].is_some());
  }

  #[test]
  fn globals_grow_with_a_sentinel() {
    let mut vm = vm();
    vm.define_global(5, Value::Bool(true));
    assert_eq!(vm.globals.len(), 6);
    assert!(vm.globals[3].is_none());
    assert_eq!(vm.globals[5], Some(Value::Bool(true)));
  }
}
