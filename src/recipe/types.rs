use std::fmt;

use thiserror::Error;

/// One line of a build recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    From(String),
    Add { src: String, dest: String },
    Env { key: String, value: String },
    User(String),
    Workdir(String),
    Run(String),
    Entrypoint(String),
}

impl Directive {
    pub const KEYWORDS: [&'static str; 7] =
        ["FROM", "ADD", "RUN", "USER", "ENV", "WORKDIR", "ENTRYPOINT"];

    pub fn keyword(&self) -> &'static str {
        match self {
            Directive::From(_) => "FROM",
            Directive::Add { .. } => "ADD",
            Directive::Env { .. } => "ENV",
            Directive::User(_) => "USER",
            Directive::Workdir(_) => "WORKDIR",
            Directive::Run(_) => "RUN",
            Directive::Entrypoint(_) => "ENTRYPOINT",
        }
    }

    pub fn args(&self) -> Vec<&str> {
        match self {
            Directive::Add { src, dest } => vec![src, dest],
            Directive::Env { key, value } => vec![key, value],
            Directive::From(arg)
            | Directive::User(arg)
            | Directive::Workdir(arg)
            | Directive::Run(arg)
            | Directive::Entrypoint(arg) => vec![arg],
        }
    }
}

/// Rendered in place of an empty `ENV` value, which would otherwise leave
/// the directive one argument short.
pub(crate) const EMPTY_VALUE: &str = "\"\"";

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Env { key, value } if value.is_empty() => {
                write!(f, "ENV {key} {EMPTY_VALUE}")
            }
            _ => write!(f, "{} {}", self.keyword(), self.args().join(" ")),
        }
    }
}

/// An ordered sequence of directives describing the per-build image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipe {
    directives: Vec<Directive>,
}

impl Recipe {
    pub(crate) fn from_directives(directives: Vec<Directive>) -> Self {
        Self { directives }
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    /// Render as newline-terminated `KEYWORD ARGS...` lines.
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Effective value of an `ENV` key: the last directive setting it wins.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.directives.iter().rev().find_map(|d| match d {
            Directive::Env { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Whether a directive with exactly this keyword and these arguments exists.
    pub fn is_written(&self, keyword: &str, args: &[&str]) -> bool {
        self.directives
            .iter()
            .any(|d| d.keyword() == keyword && d.args() == args)
    }

    /// The `RUN` commands, in order.
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.directives.iter().filter_map(|d| match d {
            Directive::Run(cmd) => Some(cmd.as_str()),
            _ => None,
        })
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for directive in &self.directives {
            writeln!(f, "{directive}")?;
        }
        Ok(())
    }
}

/// Errors raised while generating or reading a recipe. All of them are
/// caller configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecipeError {
    #[error("build script does not declare a base image")]
    EmptyImage,

    #[error("build script has no commands")]
    NoCommands,

    #[error("repository working directory is empty")]
    EmptyWorkingDir,

    #[error("invalid environment variable name `{key}`")]
    InvalidEnvKey { key: String },

    #[error("{keyword} argument contains a line break: {arg:?}")]
    LineBreak { keyword: &'static str, arg: String },

    #[error("line {line}: unknown directive `{keyword}`")]
    UnknownKeyword { line: usize, keyword: String },

    #[error("line {line}: {keyword} takes {expected} argument(s)")]
    Arity {
        line: usize,
        keyword: &'static str,
        expected: usize,
    },
}
