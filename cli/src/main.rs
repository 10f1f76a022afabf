mod args;

use args::{get_action, Action, EvalMode};
use rustyline::Editor;
use std::{fs, path::PathBuf, process::exit};
use vm::Vm;

const HELP_MSG: &str = "Usage:
  lox [settings] [file]

If no file is given, the language runs in interactive mode.

Settings:
  --version
    Prints the currently installed version (ignores the file).
  --help
    Prints this message (ignores the file).
";

fn main() {
    match get_action() {
        Ok(Action::Eval(EvalMode::File(path))) => run_file(path),
        Ok(Action::Eval(EvalMode::Repl)) => run_repl(),
        Ok(Action::Version) => println!("{}", env!("CARGO_PKG_VERSION")),
        Ok(Action::Help) => {
            println!(
                "{} {}\n\n{HELP_MSG}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            );
        }
        Err(err) => {
            eprintln!("{err}");
            eprintln!("see '--help' for usage");
            exit(exitcode::USAGE)
        }
    }
}

fn run_repl() {
    let mut vm = Vm::new();
    let mut rl = Editor::<()>::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                if let Outcome::Fatal = run_source(&mut vm, line) {
                    eprintln!("unrecoverable error, exiting");
                    exit(exitcode::SOFTWARE);
                }
            }
            Err(_) => break,
        }
    }
}

fn run_file(path: PathBuf) {
    let source = fs::read_to_string(&path).unwrap_or_else(|err| {
        eprintln!("error reading file: {err}");
        exit(exitcode::IOERR);
    });
    let mut vm = Vm::new();
    match run_source(&mut vm, source) {
        Outcome::Ok => exit(exitcode::OK),
        Outcome::CompileError => exit(exitcode::DATAERR),
        Outcome::RuntimeError | Outcome::Fatal => exit(exitcode::SOFTWARE),
    }
}

enum Outcome {
    Ok,
    CompileError,
    RuntimeError,
    Fatal,
}

/// Compiles and runs one chunk of source against a persistent `Vm`, so a REPL
/// session keeps seeing earlier globals and interned strings across lines.
fn run_source(vm: &mut Vm, source: String) -> Outcome {
    let function = match compiler::compile(source, vm.heap_mut()) {
        Ok(function) => function,
        Err(errors) => {
            for err in errors {
                eprintln!("{err}");
            }
            return Outcome::CompileError;
        }
    };
    match vm.interpret(function) {
        Ok(()) => Outcome::Ok,
        Err(err) => {
            eprintln!("{err}");
            if err.is_fatal() {
                Outcome::Fatal
            } else {
                Outcome::RuntimeError
            }
        }
    }
}
