//! Human-readable rendering of chunks. Diagnostic only: the format is
//! stable enough for tests, nothing more.

use std::fmt::Write;

use super::chunk::Chunk;
use super::opcode::Opcode;
use crate::gc::Heap;
use crate::value::object::Function;

pub fn disassemble(heap: &Heap, chunk: &Chunk, name: &str) -> String {
  let mut out = String::new();
  let _ = writeln!(out, "== {name} ==");
  let mut offset = 0;
  while offset < chunk.code.len() {
    offset = instruction(heap, chunk, offset, &mut out);
  }
  out
}

/// Render `function` followed by every function reachable through its
/// constant pool, breadth-first.
pub fn disassemble_function(heap: &Heap, function: crate::gc::Handle<Function>) -> String {
  let mut out = String::new();
  let mut queue = vec![function];
  let mut next = 0;
  while next < queue.len() {
    let function = &heap[queue[next]];
    next += 1;

    let name = match function.name {
      Some(name) => heap[name].chars.clone(),
      None => String::from("<script>"),
    };
    out.push_str(&disassemble(heap, &function.chunk, &name));

    for value in &function.chunk.constants {
      if let Some(nested) = value.as_obj().and_then(|r| heap.cast::<Function>(r)) {
        queue.push(nested);
      }
    }
  }
  out
}

/// Render one instruction, returning the offset of the next one.
pub fn instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
  let _ = write!(out, "{offset:04} ");
  if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
    let _ = write!(out, "   | ");
  } else {
    let _ = write!(out, "{:4} ", chunk.line_at(offset));
  }

  let op = match Opcode::try_from(chunk.code[offset]) {
    Ok(op) => op,
    Err(_) => {
      let _ = writeln!(out, "<bad opcode 0x{:02x}>", chunk.code[offset]);
      return offset + 1;
    }
  };

  use Opcode::*;
  match op {
    Nil | True | False | Pop | Equal | NotEqual | Greater | GreaterEqual | Less | LessEqual
    | Add | Subtract | Multiply | Divide | Not | Negate | Print | CloseUpvalue | Return
    | Inherit | ArrayAdd | GetPropertyStack | SetPropertyStack => {
      let _ = writeln!(out, "{}", op.mnemonic());
      offset + 1
    }
    GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call | ArrayInit => {
      let operand = chunk.code[offset + 1];
      let _ = writeln!(out, "{:<18} {operand}", op.mnemonic());
      offset + 2
    }
    GetLocalLong | SetLocalLong => {
      let operand = read_u24(chunk, offset + 1);
      let _ = writeln!(out, "{:<18} {operand}", op.mnemonic());
      offset + 4
    }
    GetGlobal | DefineGlobal | SetGlobal => {
      let operand = chunk.code[offset + 1];
      let _ = writeln!(out, "{:<18} {operand}", op.mnemonic());
      offset + 2
    }
    GetGlobalLong | DefineGlobalLong | SetGlobalLong => {
      let operand = read_u24(chunk, offset + 1);
      let _ = writeln!(out, "{:<18} {operand}", op.mnemonic());
      offset + 4
    }
    Constant | GetProperty | SetProperty | GetSuper | Class | Method => {
      constant_instruction(heap, chunk, op, offset, 1, out)
    }
    ConstantLong | GetPropertyLong | SetPropertyLong | GetSuperLong | ClassLong | MethodLong => {
      constant_instruction(heap, chunk, op, offset, 3, out)
    }
    Jump | JumpIfFalse => {
      let jump = read_u16(chunk, offset + 1) as usize;
      let _ = writeln!(out, "{:<18} {offset} -> {}", op.mnemonic(), offset + 3 + jump);
      offset + 3
    }
    Loop => {
      let jump = read_u16(chunk, offset + 1) as usize;
      let _ = writeln!(out, "{:<18} {offset} -> {}", op.mnemonic(), offset + 3 - jump);
      offset + 3
    }
    Invoke => invoke_instruction(heap, chunk, op, offset, 1, out),
    InvokeLong => invoke_instruction(heap, chunk, op, offset, 3, out),
    SuperInvoke => invoke_instruction(heap, chunk, op, offset, 1, out),
    SuperInvokeLong => invoke_instruction(heap, chunk, op, offset, 3, out),
    Closure | ClosureLong => {
      let width = if op == Closure { 1 } else { 3 };
      let index = read_index(chunk, offset + 1, width);
      let value = chunk.constants[index as usize];
      let _ = writeln!(out, "{:<18} {index} '{}'", op.mnemonic(), heap.show(value));

      let function = value
        .as_obj()
        .and_then(|r| heap.cast::<Function>(r))
        .map(|h| &heap[h]);
      let upvalue_count = function.map(|f| f.upvalue_count).unwrap_or(0);

      let mut next = offset + 1 + width;
      for _ in 0..upvalue_count {
        let is_local = chunk.code[next] != 0;
        let slot = read_u16(chunk, next + 1);
        let _ = writeln!(
          out,
          "{:04}    |   {:<16} {slot}",
          next,
          if is_local { "local" } else { "upvalue" },
        );
        next += 3;
      }
      next
    }
  }
}

fn constant_instruction(
  heap: &Heap,
  chunk: &Chunk,
  op: Opcode,
  offset: usize,
  width: usize,
  out: &mut String,
) -> usize {
  let index = read_index(chunk, offset + 1, width);
  let value = chunk.constants[index as usize];
  let _ = writeln!(out, "{:<18} {index} '{}'", op.mnemonic(), heap.show(value));
  offset + 1 + width
}

fn invoke_instruction(
  heap: &Heap,
  chunk: &Chunk,
  op: Opcode,
  offset: usize,
  width: usize,
  out: &mut String,
) -> usize {
  let index = read_index(chunk, offset + 1, width);
  let argc = chunk.code[offset + 1 + width];
  let value = chunk.constants[index as usize];
  let _ = writeln!(
    out,
    "{:<18} ({argc} args) {index} '{}'",
    op.mnemonic(),
    heap.show(value)
  );
  offset + 2 + width
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
  ((chunk.code[offset] as u16) << 8) | chunk.code[offset + 1] as u16
}

fn read_u24(chunk: &Chunk, offset: usize) -> u32 {
  ((chunk.code[offset] as u32) << 16)
    | ((chunk.code[offset + 1] as u32) << 8)
    | chunk.code[offset + 2] as u32
}

fn read_index(chunk: &Chunk, offset: usize, width: usize) -> u32 {
  match width {
    1 => chunk.code[offset] as u32,
    _ => read_u24(chunk, offset),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::value::Value;

  #[test]
  fn renders_a_small_chunk() {
    let heap = Heap::new(false);
    let mut chunk = Chunk::new();
    let index = chunk.add_constant(Value::Number(1.2));
    chunk.write_index_op(Opcode::Constant, Opcode::ConstantLong, index, 123);
    chunk.write_op(Opcode::Negate, 123);
    chunk.write_op(Opcode::Return, 124);

    insta::assert_snapshot!(disassemble(&heap, &chunk, "test"), @r###"
    == test ==
    0000  123 constant           0 '1.2'
    0002    | negate
    0003  124 return
    "###);
  }
}
