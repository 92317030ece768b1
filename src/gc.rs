//! The heap: an arena owning every object, plus the tri-color
//! mark-and-sweep collector and the string intern table.
//!
//! Objects are addressed by stable slot indices ([`Ref`], typed
//! [`Handle<T>`]), never by pointer, so marking and sweeping are plain
//! index walks and cycles are benign: the arena owns everything.
//!
//! The heap itself never decides *when* to collect. Allocation safe points
//! live in the VM and the compiler, which check [`Heap::should_collect`]
//! while everything they hold is still rooted, run a cycle, and only then
//! allocate.

use std::fmt::{self, Display};
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::{Index, IndexMut};

use crate::table::{Key, Table};
use crate::value::object::{Object, ObjectType, Str, Upvalue};
use crate::value::Value;

/// Collection threshold before the first cycle.
const FIRST_GC: usize = 1024 * 1024;
/// `next_gc = bytes_allocated * GROW_FACTOR` after each cycle.
const GROW_FACTOR: usize = 2;
/// Bound on the temp-root array. Anything that needs more roots than this
/// should be holding them on the value stack instead.
const TEMPS_MAX: usize = 16;

/// An untyped reference to a heap object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ref(u32);

impl Ref {
  #[inline]
  fn index(self) -> usize {
    self.0 as usize
  }
}

/// A reference to a heap object known to be a `T`.
pub struct Handle<T> {
  index: u32,
  _type: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
  fn new(index: u32) -> Handle<T> {
    Handle {
      index,
      _type: PhantomData,
    }
  }

  #[inline]
  pub fn erase(self) -> Ref {
    Ref(self.index)
  }
}

impl<T> Clone for Handle<T> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
  fn eq(&self, other: &Self) -> bool {
    self.index == other.index
  }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Handle({})", self.index)
  }
}

pub struct Heap {
  objects: Vec<Option<Object>>,
  marks: Vec<bool>,
  free: Vec<u32>,
  gray: Vec<Ref>,
  /// The intern table, used as a set. Entries are weak: unmarked keys are
  /// deleted right before sweeping would free them.
  strings: Table<()>,
  temps: Vec<Value>,
  bytes_allocated: usize,
  next_gc: usize,
  stress: bool,
}

impl Heap {
  pub fn new(stress: bool) -> Heap {
    Heap {
      objects: Vec::new(),
      marks: Vec::new(),
      free: Vec::new(),
      gray: Vec::new(),
      strings: Table::new(),
      temps: Vec::new(),
      bytes_allocated: 0,
      next_gc: FIRST_GC,
      stress: stress || cfg!(feature = "stress-gc"),
    }
  }

  pub fn bytes_allocated(&self) -> usize {
    self.bytes_allocated
  }

  /// True when the next allocation safe point should run a cycle.
  pub fn should_collect(&self) -> bool {
    self.stress || self.bytes_allocated > self.next_gc
  }

  /// Allocate `object` in a fresh or recycled slot. Born unmarked.
  ///
  /// Does *not* collect; the caller is responsible for hitting a safe
  /// point first, while the object's children are still rooted.
  pub fn alloc<T: ObjectType>(&mut self, object: T) -> Handle<T> {
    let object = object.into_object();
    let size = size_of::<Object>() + object.heap_size();
    self.bytes_allocated += size;

    let index = match self.free.pop() {
      Some(index) => {
        self.objects[index as usize] = Some(object);
        self.marks[index as usize] = false;
        index
      }
      None => {
        self.objects.push(Some(object));
        self.marks.push(false);
        (self.objects.len() - 1) as u32
      }
    };

    #[cfg(feature = "log-gc")]
    eprintln!(
      "[gc] {index} allocate {size} for {}",
      self.objects[index as usize]
        .as_ref()
        .map(Object::type_name)
        .unwrap_or("?")
    );

    Handle::new(index)
  }

  /// Record payload growth of an already-allocated object.
  pub fn tally(&mut self, bytes: usize) {
    self.bytes_allocated += bytes;
  }

  pub fn get(&self, r: Ref) -> &Object {
    self.objects[r.index()]
      .as_ref()
      .expect("reference to freed object")
  }

  pub fn get_mut(&mut self, r: Ref) -> &mut Object {
    self.objects[r.index()]
      .as_mut()
      .expect("reference to freed object")
  }

  /// Downcast an untyped reference.
  pub fn cast<T: ObjectType>(&self, r: Ref) -> Option<Handle<T>> {
    T::as_object(self.get(r)).map(|_| Handle::new(r.0))
  }

  /// The table key for an interned string.
  pub fn key(&self, handle: Handle<Str>) -> Key {
    Key {
      handle,
      hash: self[handle].hash,
    }
  }

  // ---- string interning -------------------------------------------------

  pub fn intern(&mut self, chars: &str) -> Handle<Str> {
    let hash = hash_str(chars);
    if let Some(handle) = self.find_string(chars, hash) {
      return handle;
    }
    self.intern_new(Str {
      chars: chars.to_owned(),
      hash,
    })
  }

  /// Interning for strings the caller already owns (concatenation).
  pub fn intern_owned(&mut self, chars: String) -> Handle<Str> {
    let hash = hash_str(&chars);
    if let Some(handle) = self.find_string(&chars, hash) {
      return handle;
    }
    self.intern_new(Str { chars, hash })
  }

  fn find_string(&self, chars: &str, hash: u32) -> Option<Handle<Str>> {
    self
      .strings
      .find_key(hash, |handle| self[handle].as_str() == chars)
  }

  fn intern_new(&mut self, string: Str) -> Handle<Str> {
    let hash = string.hash;
    let handle = self.alloc(string);
    self.strings.set(Key { handle, hash }, ());
    handle
  }

  // ---- temp roots -------------------------------------------------------

  /// Keep `value` alive across allocations that happen before it is
  /// reachable from a real root.
  pub fn push_temp(&mut self, value: Value) {
    assert!(self.temps.len() < TEMPS_MAX, "temp root overflow");
    self.temps.push(value);
  }

  pub fn pop_temp(&mut self) {
    self.temps.pop().expect("pop from empty temp roots");
  }

  // ---- collection -------------------------------------------------------

  /// Start a cycle: the caller marks every root, then calls
  /// [`Heap::finish_cycle`].
  pub fn begin_cycle(&mut self) {
    #[cfg(feature = "log-gc")]
    eprintln!("[gc] -- begin ({} bytes)", self.bytes_allocated);

    for i in 0..self.temps.len() {
      let value = self.temps[i];
      self.mark_value(value);
    }
  }

  /// Trace from the marked roots, drop dead intern entries, sweep.
  pub fn finish_cycle(&mut self) {
    #[cfg(feature = "log-gc")]
    let before = self.bytes_allocated;

    self.trace();
    self.remove_white_strings();
    self.sweep();
    self.next_gc = self.bytes_allocated * GROW_FACTOR;

    #[cfg(feature = "log-gc")]
    eprintln!(
      "[gc] -- end, collected {} bytes (from {before} to {}), next at {}",
      before - self.bytes_allocated,
      self.bytes_allocated,
      self.next_gc
    );
  }

  pub fn mark_value(&mut self, value: Value) {
    if let Value::Obj(r) = value {
      self.mark_ref(r);
    }
  }

  pub fn mark_handle<T>(&mut self, handle: Handle<T>) {
    self.mark_ref(handle.erase());
  }

  pub fn mark_ref(&mut self, r: Ref) {
    let index = r.index();
    if self.marks[index] {
      return;
    }
    self.marks[index] = true;

    #[cfg(feature = "log-gc")]
    eprintln!("[gc] {index} mark");

    // Leaves go straight from white to black: they hold no references.
    match &self.objects[index] {
      Some(Object::Str(_)) | Some(Object::Native(_)) => {}
      _ => self.gray.push(r),
    }
  }

  fn trace(&mut self) {
    while let Some(r) = self.gray.pop() {
      self.blacken(r);
    }
  }

  fn blacken(&mut self, r: Ref) {
    #[cfg(feature = "log-gc")]
    eprintln!("[gc] {} blacken", r.index());

    // Move the object out of its slot while its children are marked. Any
    // cycle back into `r` bails on the mark bit before touching the slot.
    let object = self.objects[r.index()]
      .take()
      .expect("blacken of freed object");
    match &object {
      Object::Str(_) | Object::Native(_) => {}
      Object::Function(function) => {
        if let Some(name) = function.name {
          self.mark_handle(name);
        }
        for i in 0..function.chunk.constants.len() {
          self.mark_value(function.chunk.constants[i]);
        }
      }
      Object::Closure(closure) => {
        self.mark_handle(closure.function);
        for upvalue in &closure.upvalues {
          self.mark_handle(*upvalue);
        }
      }
      Object::Upvalue(upvalue) => {
        if let Upvalue::Closed(value) = upvalue {
          self.mark_value(*value);
        }
      }
      Object::Class(class) => {
        self.mark_handle(class.name);
        for (key, method) in class.methods.iter() {
          self.mark_handle(key.handle);
          self.mark_handle(*method);
        }
      }
      Object::Instance(instance) => {
        self.mark_handle(instance.class);
        for (key, value) in instance.fields.iter() {
          self.mark_handle(key.handle);
          self.mark_value(*value);
        }
      }
      Object::BoundMethod(bound) => {
        self.mark_value(bound.receiver);
        self.mark_handle(bound.method);
      }
      Object::Array(array) => {
        for value in &array.elements {
          self.mark_value(*value);
        }
      }
    }
    self.objects[r.index()] = Some(object);
  }

  /// Delete intern entries whose string is about to be swept, so the
  /// table never yields a dangling key.
  fn remove_white_strings(&mut self) {
    let Heap { strings, marks, .. } = self;
    strings.retain(|key, _| marks[key.handle.erase().index()]);
  }

  fn sweep(&mut self) {
    for index in 0..self.objects.len() {
      if self.marks[index] {
        self.marks[index] = false;
        continue;
      }
      if let Some(object) = self.objects[index].take() {
        #[cfg(feature = "log-gc")]
        eprintln!("[gc] {index} free {}", object.type_name());

        self.bytes_allocated -= size_of::<Object>() + object.heap_size();
        self.free.push(index as u32);
      }
    }
  }

  // ---- display ----------------------------------------------------------

  /// Render `value` the way `print` does. Requires the heap because
  /// object payloads live here.
  pub fn show(&self, value: Value) -> ShowValue<'_> {
    ShowValue { heap: self, value }
  }
}

pub struct ShowValue<'a> {
  heap: &'a Heap,
  value: Value,
}

impl Display for ShowValue<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let heap = self.heap;
    match self.value {
      Value::Nil => write!(f, "nil"),
      Value::Bool(v) => write!(f, "{v}"),
      Value::Number(v) => write!(f, "{v}"),
      Value::Obj(r) => match heap.get(r) {
        Object::Str(v) => write!(f, "{}", v.chars),
        Object::Function(v) => write_function(f, heap, v.name),
        Object::Closure(v) => write_function(f, heap, heap[v.function].name),
        Object::Upvalue(_) => write!(f, "upvalue"),
        Object::Native(_) => write!(f, "<native fn>"),
        Object::Class(v) => write!(f, "{}", heap[v.name].chars),
        Object::Instance(v) => {
          write!(f, "{} instance", heap[heap[v.class].name].chars)
        }
        Object::BoundMethod(v) => {
          write_function(f, heap, heap[heap[v.method].function].name)
        }
        Object::Array(v) => {
          write!(f, "[")?;
          for (i, element) in v.elements.iter().enumerate() {
            if i > 0 {
              write!(f, ", ")?;
            }
            write!(f, "{}", heap.show(*element))?;
          }
          write!(f, "]")
        }
      },
    }
  }
}

fn write_function(
  f: &mut fmt::Formatter<'_>,
  heap: &Heap,
  name: Option<Handle<Str>>,
) -> fmt::Result {
  match name {
    Some(name) => write!(f, "<fn {}>", heap[name].chars),
    None => write!(f, "<script>"),
  }
}

impl<T: ObjectType> Index<Handle<T>> for Heap {
  type Output = T;

  fn index(&self, handle: Handle<T>) -> &T {
    T::as_object(self.get(handle.erase())).expect("heap handle type mismatch")
  }
}

impl<T: ObjectType> IndexMut<Handle<T>> for Heap {
  fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
    T::as_object_mut(self.get_mut(handle.erase())).expect("heap handle type mismatch")
  }
}

/// FNV-1a, 32 bits.
pub fn hash_str(s: &str) -> u32 {
  let mut hash: u32 = 2166136261;
  for byte in s.bytes() {
    hash ^= byte as u32;
    hash = hash.wrapping_mul(16777619);
  }
  hash
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::value::object::Array;

  #[test]
  fn intern_is_canonical() {
    let mut heap = Heap::new(false);
    let a = heap.intern("hello");
    let b = heap.intern("hello");
    let c = heap.intern("world");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(heap[a].chars, "hello");
  }

  #[test]
  fn intern_owned_matches_borrowed() {
    let mut heap = Heap::new(false);
    let a = heap.intern("con");
    let b = heap.intern_owned(String::from("con"));
    assert_eq!(a, b);
  }

  #[test]
  fn unrooted_objects_are_swept() {
    let mut heap = Heap::new(false);
    heap.intern("garbage");
    let before = heap.bytes_allocated();
    heap.begin_cycle();
    heap.finish_cycle();
    assert!(heap.bytes_allocated() < before);
  }

  #[test]
  fn temp_roots_survive() {
    let mut heap = Heap::new(false);
    let s = heap.intern("kept");
    heap.push_temp(Value::from(s));
    heap.begin_cycle();
    heap.finish_cycle();
    assert_eq!(heap[s].chars, "kept");
    heap.pop_temp();
  }

  #[test]
  fn reachability_is_transitive() {
    let mut heap = Heap::new(false);
    let s = heap.intern("elem");
    let array = heap.alloc(Array {
      elements: vec![Value::from(s)],
    });

    heap.push_temp(Value::from(array));
    heap.begin_cycle();
    heap.finish_cycle();
    // The string is only reachable through the array.
    assert_eq!(heap[s].chars, "elem");

    heap.pop_temp();
    let before = heap.bytes_allocated();
    heap.begin_cycle();
    heap.finish_cycle();
    assert!(heap.bytes_allocated() < before);
  }

  #[test]
  fn dead_intern_entries_are_removed() {
    let mut heap = Heap::new(false);
    let a = heap.intern("transient");
    heap.begin_cycle();
    heap.finish_cycle();
    // Re-interning the same content after collection must produce a fresh
    // object, not a dangling table hit.
    let b = heap.intern("transient");
    assert_eq!(heap[b].chars, "transient");
    // Slot reuse may hand back the same index; the point is the lookup
    // goes through a live object.
    let _ = a;
  }

  #[test]
  fn marks_are_cleared_after_cycle() {
    let mut heap = Heap::new(false);
    let s = heap.intern("twice");
    heap.push_temp(Value::from(s));
    heap.begin_cycle();
    heap.finish_cycle();
    heap.begin_cycle();
    heap.finish_cycle();
    assert_eq!(heap[s].chars, "twice");
  }

  #[test]
  fn stress_mode_always_wants_collection() {
    let heap = Heap::new(true);
    assert!(heap.should_collect());
    if !cfg!(feature = "stress-gc") {
      assert!(!Heap::new(false).should_collect());
    }
  }
}
