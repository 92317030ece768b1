use paste::paste;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("invalid opcode 0x{0:02x}")]
pub struct InvalidOpcode(pub u8);

macro_rules! opcodes {
  ($($name:ident),* $(,)?) => {
    /// One byte per opcode. Operands follow inline in the code stream,
    /// big-endian; `*Long` variants widen a one-byte index operand to
    /// three bytes.
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Opcode {
      $($name,)*
    }

    impl Opcode {
      pub const COUNT: usize = [$(Opcode::$name),*].len();

      pub fn mnemonic(self) -> &'static str {
        paste! {
          match self {
            $(Opcode::$name => stringify!([<$name:snake>]),)*
          }
        }
      }
    }

    impl TryFrom<u8> for Opcode {
      type Error = InvalidOpcode;

      fn try_from(byte: u8) -> Result<Opcode, InvalidOpcode> {
        $(
          if byte == Opcode::$name as u8 {
            return Ok(Opcode::$name);
          }
        )*
        Err(InvalidOpcode(byte))
      }
    }
  };
}

opcodes! {
  Constant,
  ConstantLong,
  Nil,
  True,
  False,
  Pop,
  GetLocal,
  GetLocalLong,
  SetLocal,
  SetLocalLong,
  GetGlobal,
  GetGlobalLong,
  DefineGlobal,
  DefineGlobalLong,
  SetGlobal,
  SetGlobalLong,
  GetUpvalue,
  SetUpvalue,
  GetProperty,
  GetPropertyLong,
  SetProperty,
  SetPropertyLong,
  GetPropertyStack,
  SetPropertyStack,
  GetSuper,
  GetSuperLong,
  Equal,
  NotEqual,
  Greater,
  GreaterEqual,
  Less,
  LessEqual,
  Add,
  Subtract,
  Multiply,
  Divide,
  Not,
  Negate,
  Print,
  Jump,
  JumpIfFalse,
  Loop,
  Call,
  Invoke,
  InvokeLong,
  SuperInvoke,
  SuperInvokeLong,
  Closure,
  ClosureLong,
  CloseUpvalue,
  Return,
  Class,
  ClassLong,
  Inherit,
  Method,
  MethodLong,
  ArrayInit,
  ArrayAdd,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trip_all() {
    for byte in 0..Opcode::COUNT as u8 {
      let op = Opcode::try_from(byte).unwrap();
      assert_eq!(op as u8, byte);
    }
  }

  #[test]
  fn out_of_range_is_rejected() {
    assert_eq!(
      Opcode::try_from(0xFF),
      Err(InvalidOpcode(0xFF))
    );
  }

  #[test]
  fn mnemonics_are_snake_case() {
    assert_eq!(Opcode::Constant.mnemonic(), "constant");
    assert_eq!(Opcode::GetLocalLong.mnemonic(), "get_local_long");
    assert_eq!(Opcode::JumpIfFalse.mnemonic(), "jump_if_false");
  }
}
