use std::convert::{From, Into};
use std::{env, fmt, path::PathBuf};

#[derive(Debug, Clone)]
enum Setting {
    Version,
    Help,
    Unknown(String),
}

const VERSION: &str = "--version";
const HELP: &str = "--help";

impl From<String> for Setting {
    fn from(value: String) -> Self {
        match value.as_str() {
            VERSION => Self::Version,
            HELP => Self::Help,
            string => Self::Unknown(string.to_owned()),
        }
    }
}

impl Into<String> for Setting {
    fn into(self) -> String {
        match self {
            Self::Version => VERSION.to_owned(),
            Self::Help => HELP.to_owned(),
            Self::Unknown(string) => string,
        }
    }
}

#[derive(Debug, Clone)]
enum Token {
    Setting(Setting),
    Path(PathBuf),
}

fn lex(iter: &mut env::Args) -> Result<Vec<Token>, ParseError> {
    iter.next();
    let mut tokens = vec![];
    while let Some(string) = iter.next() {
        match string.as_str() {
            x if x.starts_with("--") => tokens.push(Token::Setting(Setting::from(string))),
            path => tokens.push(Token::Path(PathBuf::from(path))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
struct Args {
    settings: Vec<Setting>,
    path: Option<PathBuf>,
}

impl Args {
    fn new(settings: Vec<Setting>, path: Option<PathBuf>) -> Self {
        Self { settings, path }
    }
}

#[derive(Debug, Clone)]
pub enum ParseError {
    ExpectedPathOrSetting(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpectedPathOrSetting(string) => {
                write!(f, "expected a file path or a setting but got \"{string}\"")
            }
        }
    }
}

fn parse(tokens: Vec<Token>) -> Result<Args, ParseError> {
    let mut settings = vec![];
    let mut path = None;
    for token in tokens {
        match token {
            Token::Setting(Setting::Unknown(string)) => {
                return Err(ParseError::ExpectedPathOrSetting(string));
            }
            Token::Setting(setting) => settings.push(setting),
            Token::Path(new_path) => {
                if path.is_some() {
                    return Err(ParseError::ExpectedPathOrSetting(new_path.display().to_string()));
                }
                path = Some(new_path);
            }
        }
    }
    Ok(Args::new(settings, path))
}

#[derive(Debug, Clone)]
pub enum EvalMode {
    File(PathBuf),
    Repl,
}

#[derive(Clone)]
pub enum Action {
    Eval(EvalMode),
    Version,
    Help,
}

impl From<Args> for Action {
    fn from(value: Args) -> Self {
        for setting in value.settings {
            match setting {
                Setting::Help => return Self::Help,
                Setting::Version => return Self::Version,
                Setting::Unknown(_) => unreachable!(),
            }
        }
        match value.path {
            Some(path) => Self::Eval(EvalMode::File(path)),
            None => Self::Eval(EvalMode::Repl),
        }
    }
}

pub fn get_action() -> Result<Action, ParseError> {
    let tokens = lex(&mut env::args())?;
    let args = parse(tokens)?;
    Ok(Action::from(args))
}
