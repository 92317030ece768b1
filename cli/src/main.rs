use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::Editor;
use tako::{Error, Tako};

#[derive(Debug, Parser)]
#[clap(name = "tako", version)]
struct App {
  /// Script to run; opens a REPL when omitted.
  file: Option<PathBuf>,

  /// Print the compiled bytecode instead of running.
  #[clap(long)]
  dump: bool,
}

// sysexits: 65 = bad input, 70 = internal software error.
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;

fn main() -> Result<ExitCode> {
  let app = App::parse();
  match app.file {
    Some(path) if app.dump => dump_file(&path),
    Some(path) => run_file(&path),
    None => repl(),
  }
}

fn dump_file(path: &PathBuf) -> Result<ExitCode> {
  let source = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read `{}`", path.display()))?;
  let mut tako = Tako::default();
  match tako.dump(&source) {
    Ok(listing) => {
      print!("{listing}");
      Ok(ExitCode::SUCCESS)
    }
    Err(error) => {
      report(&error);
      Ok(ExitCode::from(EX_DATAERR))
    }
  }
}

fn report(error: &Error) {
  let color = atty::is(atty::Stream::Stderr);
  match error {
    Error::Compile(errors) => {
      for error in errors {
        eprintln!("{}", error.report(color));
      }
    }
    Error::Runtime(error) => eprintln!("{}", error.report(color)),
  }
}

fn run_file(path: &PathBuf) -> Result<ExitCode> {
  let source = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read `{}`", path.display()))?;
  let mut tako = Tako::default();
  let code = match tako.eval(&source) {
    Ok(()) => ExitCode::SUCCESS,
    Err(error) => {
      let code = match &error {
        Error::Compile(_) => EX_DATAERR,
        Error::Runtime(_) => EX_SOFTWARE,
      };
      report(&error);
      ExitCode::from(code)
    }
  };
  Ok(code)
}

fn repl() -> Result<ExitCode> {
  let mut editor = Editor::<()>::new()?;
  let mut tako = Tako::default();
  loop {
    match editor.readline("> ") {
      Ok(line) => {
        if line.trim().is_empty() {
          continue;
        }
        editor.add_history_entry(&line);
        // Errors are reported and the REPL keeps going; globals survive
        // from line to line.
        if let Err(error) = tako.eval(&line) {
          report(&error);
        }
      }
      Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
      Err(error) => return Err(error.into()),
    }
  }
  Ok(ExitCode::SUCCESS)
}
