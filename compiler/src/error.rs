use std::fmt;
use std::rc::Rc;

use colored::Colorize;
use lexer::Token;

/// Every way a source file can fail to become bytecode. Each variant carries
/// the token whose position should be reported.
#[derive(Debug, Clone)]
pub enum CompileError {
    InvalidToken(Rc<Token>),
    ExpectedExpression(Rc<Token>),
    Expected(&'static str, Rc<Token>),
    TooManyConstants(Rc<Token>),
    TooManyLocals(Rc<Token>),
    TooManyUpvalues(Rc<Token>),
    TooManyParameters(Rc<Token>),
    TooManyArguments(Rc<Token>),
    TooManyArrayElements(Rc<Token>),
    JumpTooLarge(Rc<Token>),
    VariableAlreadyDeclared(Rc<Token>),
    SelfReadInOwnInitializer(Rc<Token>),
    InvalidAssignmentTarget(Rc<Token>),
    ReturnOutsideFunction(Rc<Token>),
    ReturnValueFromInitializer(Rc<Token>),
    SelfInheritance(Rc<Token>),
    ThisOutsideMethod(Rc<Token>),
    SuperOutsideMethod(Rc<Token>),
    SuperWithoutSuperclass(Rc<Token>),
}

impl CompileError {
    pub fn token(&self) -> &Rc<Token> {
        match self {
            Self::InvalidToken(t)
            | Self::ExpectedExpression(t)
            | Self::Expected(_, t)
            | Self::TooManyConstants(t)
            | Self::TooManyLocals(t)
            | Self::TooManyUpvalues(t)
            | Self::TooManyParameters(t)
            | Self::TooManyArguments(t)
            | Self::TooManyArrayElements(t)
            | Self::JumpTooLarge(t)
            | Self::VariableAlreadyDeclared(t)
            | Self::SelfReadInOwnInitializer(t)
            | Self::InvalidAssignmentTarget(t)
            | Self::ReturnOutsideFunction(t)
            | Self::ReturnValueFromInitializer(t)
            | Self::SelfInheritance(t)
            | Self::ThisOutsideMethod(t)
            | Self::SuperOutsideMethod(t)
            | Self::SuperWithoutSuperclass(t) => t,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::InvalidToken(_) => "unrecognized character or unterminated string".to_string(),
            Self::ExpectedExpression(_) => "expected an expression".to_string(),
            Self::Expected(what, _) => format!("expected {what}"),
            Self::TooManyConstants(_) => {
                "a single function cannot hold more than 256 constants".to_string()
            }
            Self::TooManyLocals(_) => {
                "a single function cannot declare more than 256 local variables".to_string()
            }
            Self::TooManyUpvalues(_) => {
                "a single function cannot close over more than 256 variables".to_string()
            }
            Self::TooManyParameters(_) => {
                "a function cannot take more than 255 parameters".to_string()
            }
            Self::TooManyArguments(_) => {
                "a call cannot pass more than 255 arguments".to_string()
            }
            Self::TooManyArrayElements(_) => {
                "an array literal cannot hold more than 255 elements".to_string()
            }
            Self::JumpTooLarge(_) => {
                "the body of this branch or loop is too large to jump over".to_string()
            }
            Self::VariableAlreadyDeclared(t) => {
                format!("a variable named '{}' already exists in this scope", t.lexeme())
            }
            Self::SelfReadInOwnInitializer(t) => {
                format!("can't read '{}' in its own initializer", t.lexeme())
            }
            Self::InvalidAssignmentTarget(_) => "invalid assignment target".to_string(),
            Self::ReturnOutsideFunction(_) => "can't return from top-level code".to_string(),
            Self::ReturnValueFromInitializer(_) => {
                "can't return a value from an initializer".to_string()
            }
            Self::SelfInheritance(t) => {
                format!("class '{}' can't inherit from itself", t.lexeme())
            }
            Self::ThisOutsideMethod(_) => "can't use 'this' outside of a method".to_string(),
            Self::SuperOutsideMethod(_) => "can't use 'super' outside of a method".to_string(),
            Self::SuperWithoutSuperclass(_) => {
                "can't use 'super' in a class with no superclass".to_string()
            }
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", "compile error:".bright_red(), self.message())?;
        write!(f, "{}", self.token())
    }
}
