//! Native functions every VM starts with.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Value;
use crate::vm::Vm;

/// Seconds since the Unix epoch, as a number. Good enough for timing
/// scripts against each other.
pub fn clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
  let elapsed = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map_err(|_| String::from("System clock is before the epoch."))?;
  Ok(Value::Number(elapsed.as_secs_f64()))
}

/// Force a full collection cycle right now.
pub fn collect_garbage(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
  vm.collect_garbage();
  Ok(Value::Nil)
}

pub(crate) fn register_default(vm: &mut Vm) {
  vm.define_native("clock", clock);
  vm.define_native("collect_garbage", collect_garbage);
}
