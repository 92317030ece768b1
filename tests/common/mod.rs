/// Run a program and assert its stdout, both with the default collector
/// schedule and with stress GC (a cycle at every allocation safe point).
/// The two runs must agree: collection timing is not allowed to be
/// observable.
#[macro_export]
macro_rules! check {
  ($name:ident, $input:literal, $expected:literal) => {
    #[test]
    fn $name() {
      let input = indoc::indoc!($input);
      let expected = indoc::indoc!($expected);
      for stress in [false, true] {
        let mut vm = tako::Tako::builder().with_io(Vec::new()).stress_gc(stress).build();
        if let Err(error) = vm.eval(input) {
          panic!("eval failed (stress: {stress}):\n{error}");
        }
        let stdout = vm.io::<Vec<u8>>().unwrap();
        let stdout = std::str::from_utf8(stdout).unwrap();
        assert_eq!(stdout, expected, "stress: {stress}");
      }
    }
  };
}

/// Run a program expecting a runtime error; assert the full rendering
/// (message plus stack trace) and any stdout produced before the error.
#[macro_export]
macro_rules! check_error {
  ($name:ident, $input:literal, $expected:literal) => {
    check_error!($name, $input, $expected, "");
  };
  ($name:ident, $input:literal, $expected:literal, $stdout:literal) => {
    #[test]
    fn $name() {
      let input = indoc::indoc!($input);
      for stress in [false, true] {
        let mut vm = tako::Tako::builder().with_io(Vec::new()).stress_gc(stress).build();
        match vm.eval(input) {
          Ok(()) => panic!("expected runtime error (stress: {stress})"),
          Err(tako::Error::Compile(errors)) => {
            panic!("expected runtime error, got compile errors (stress: {stress}): {errors:?}")
          }
          Err(tako::Error::Runtime(error)) => {
            assert_eq!(error.to_string(), $expected, "stress: {stress}");
          }
        }
        let stdout = vm.io::<Vec<u8>>().unwrap();
        let stdout = std::str::from_utf8(stdout).unwrap();
        assert_eq!(stdout, indoc::indoc!($stdout), "stress: {stress}");
      }
    }
  };
}

/// Run a program expecting compile errors; assert their rendering.
#[macro_export]
macro_rules! check_compile_error {
  ($name:ident, $input:literal, $expected:literal) => {
    #[test]
    fn $name() {
      let input = indoc::indoc!($input);
      let mut vm = tako::Tako::with_io(Vec::new());
      match vm.eval(input) {
        Ok(()) => panic!("expected compile error"),
        Err(error @ tako::Error::Compile(_)) => {
          assert_eq!(error.to_string(), $expected);
        }
        Err(tako::Error::Runtime(error)) => {
          panic!("expected compile error, got runtime error: {error}")
        }
      }
    }
  };
}
