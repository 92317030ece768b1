use paste::paste;

use crate::bytecode::chunk::Chunk;
use crate::gc::Handle;
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// A host function callable from scripts.
///
/// Receives the VM (for allocation and forced collection) and the argument
/// slice. An `Err` becomes a runtime error at the call site.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

/// An interned, immutable string.
///
/// The FNV-1a hash is computed once at interning time; every table keyed by
/// strings probes with it.
pub struct Str {
  pub chars: String,
  pub hash: u32,
}

impl Str {
  pub fn as_str(&self) -> &str {
    self.chars.as_str()
  }
}

/// Compiled function: bytecode plus the shape of its frame.
pub struct Function {
  pub arity: u32,
  pub upvalue_count: u32,
  /// `None` for the top-level script function.
  pub name: Option<Handle<Str>>,
  pub chunk: Chunk,
}

impl Function {
  pub fn new() -> Function {
    Function {
      arity: 0,
      upvalue_count: 0,
      name: None,
      chunk: Chunk::new(),
    }
  }
}

impl Default for Function {
  fn default() -> Self {
    Function::new()
  }
}

/// A function together with the upvalues it captured.
pub struct Closure {
  pub function: Handle<Function>,
  pub upvalues: Vec<Handle<Upvalue>>,
}

/// A captured variable.
///
/// `Open` refers to a live value-stack slot by index (not by pointer, so a
/// reallocating stack stays sound). Closing moves the value into the
/// upvalue itself.
pub enum Upvalue {
  Open(usize),
  Closed(Value),
}

pub struct Native {
  pub function: NativeFn,
}

pub struct Class {
  pub name: Handle<Str>,
  pub methods: Table<Handle<Closure>>,
}

pub struct Instance {
  pub class: Handle<Class>,
  pub fields: Table<Value>,
}

pub struct BoundMethod {
  pub receiver: Value,
  pub method: Handle<Closure>,
}

pub struct Array {
  pub elements: Vec<Value>,
}

pub trait ObjectType: Sized + private::Sealed {
  fn as_object(object: &Object) -> Option<&Self>;
  fn as_object_mut(object: &mut Object) -> Option<&mut Self>;
  fn into_object(self) -> Object;
}

mod private {
  pub trait Sealed {}
}

macro_rules! objects {
  ($($name:ident),* $(,)?) => {
    /// Any heap object. The variant is the type tag; the arena slot
    /// carries the mark bit.
    pub enum Object {
      $($name($name),)*
    }

    impl Object {
      pub fn type_name(&self) -> &'static str {
        paste! {
          match self {
            $(Object::$name(_) => stringify!([<$name:snake>]),)*
          }
        }
      }
    }

    $(
      impl private::Sealed for $name {}

      impl ObjectType for $name {
        fn as_object(object: &Object) -> Option<&$name> {
          match object {
            Object::$name(v) => Some(v),
            _ => None,
          }
        }

        fn as_object_mut(object: &mut Object) -> Option<&mut $name> {
          match object {
            Object::$name(v) => Some(v),
            _ => None,
          }
        }

        fn into_object(self) -> Object {
          Object::$name(self)
        }
      }
    )*
  };
}

objects! {
  Str,
  Function,
  Closure,
  Upvalue,
  Native,
  Class,
  Instance,
  BoundMethod,
  Array,
}

impl std::fmt::Debug for Object {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "<{}>", self.type_name())
  }
}

impl Object {
  /// Estimate of the payload owned by this object, outside the arena slot
  /// itself. Allocation adds it, sweeping subtracts it, and mutation sites
  /// tally the difference when they grow an object in place.
  pub fn heap_size(&self) -> usize {
    use std::mem::size_of;
    match self {
      Object::Str(v) => v.chars.capacity(),
      Object::Function(v) => {
        v.chunk.code.capacity()
          + v.chunk.constants.capacity() * size_of::<Value>()
          + v.chunk.source_info().heap_size()
      }
      Object::Closure(v) => v.upvalues.capacity() * size_of::<Handle<Upvalue>>(),
      Object::Upvalue(_) => 0,
      Object::Native(_) => 0,
      Object::Class(v) => v.methods.heap_size(),
      Object::Instance(v) => v.fields.heap_size(),
      Object::BoundMethod(_) => 0,
      Object::Array(v) => v.elements.capacity() * size_of::<Value>(),
    }
  }
}
