use std::fmt;

use colored::Colorize;

/// Every way a running program can fail once it's past the compiler. Unlike
/// `compiler::CompileError`, these carry a source line rather than an
/// `Rc<Token>`: by the time bytecode runs, the chunk's line table is all
/// that's left of the original tokens.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    Type(String, u32, Backtrace),
    UndefinedVariable(String, u32, Backtrace),
    UndefinedProperty(String, u32, Backtrace),
    WrongArity(u8, usize, u32, Backtrace),
    IndexOutOfBounds(f64, usize, u32, Backtrace),
    NotCallable(&'static str, u32, Backtrace),
    NoProperties(&'static str, u32, Backtrace),
    StackOverflow(u32, Backtrace),
    /// Bytecode corruption or allocator exhaustion. There's no recovering
    /// from this one; the CLI exits instead of returning to the REPL prompt.
    Fatal(String, u32, Backtrace),
}

impl RuntimeError {
    pub fn line(&self) -> u32 {
        match self {
            Self::Type(.., line, _)
            | Self::UndefinedVariable(.., line, _)
            | Self::UndefinedProperty(.., line, _)
            | Self::WrongArity(.., line, _)
            | Self::IndexOutOfBounds(.., line, _)
            | Self::NotCallable(.., line, _)
            | Self::NoProperties(.., line, _)
            | Self::StackOverflow(line, _)
            | Self::Fatal(.., line, _) => *line,
        }
    }

    pub fn backtrace(&self) -> &Backtrace {
        match self {
            Self::Type(.., bt)
            | Self::UndefinedVariable(.., bt)
            | Self::UndefinedProperty(.., bt)
            | Self::WrongArity(.., bt)
            | Self::IndexOutOfBounds(.., bt)
            | Self::NotCallable(.., bt)
            | Self::NoProperties(.., bt)
            | Self::StackOverflow(bt)
            | Self::Fatal(.., bt) => bt,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(..))
    }

    fn message(&self) -> String {
        match self {
            Self::Type(msg, ..) => msg.clone(),
            Self::UndefinedVariable(name, ..) => format!("undefined variable '{name}'"),
            Self::UndefinedProperty(name, ..) => format!("undefined property '{name}'"),
            Self::WrongArity(expected, got, ..) => {
                format!("expected {expected} arguments but got {got}")
            }
            Self::IndexOutOfBounds(index, len, ..) => {
                format!("array index {index} out of bounds for length {len}")
            }
            Self::NotCallable(kind, ..) => format!("can only call functions and classes, got {kind}"),
            Self::NoProperties(kind, ..) => {
                format!("only instances and arrays have properties, got {kind}")
            }
            Self::StackOverflow(..) => "stack overflow".to_string(),
            Self::Fatal(msg, ..) => msg.clone(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", "runtime error:".bright_red(), self.message())?;
        write!(f, "{}", self.backtrace())
    }
}

/// One frame per active call, innermost first, matching the order a stack
/// trace is read top to bottom.
#[derive(Debug, Clone, Default)]
pub struct Backtrace {
    frames: Vec<(Option<String>, u32)>,
}

impl Backtrace {
    pub fn push(&mut self, name: Option<String>, line: u32) {
        self.frames.push((name, line));
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.frames.iter().peekable();
        while let Some((name, line)) = iter.next() {
            match name {
                Some(name) => write!(f, "[line {line}] in {name}()")?,
                None => write!(f, "[line {line}] in script")?,
            }
            if iter.peek().is_some() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
