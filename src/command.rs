//! Stage specifications and the command-string tokenizer.

use std::env;
use std::fmt;

use crate::error::{Error, Result};

/// Whether a stage gates the pipeline or merely runs alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Runs to completion before the next stage starts; failure aborts the chain.
    Sequential,
    /// Fired once the chain has passed and monitored independently.
    Background,
}

/// An immutable description of one command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub program: String,
    pub args: Vec<String>,
    pub kind: StageKind,
}

impl StageSpec {
    pub fn new<S: Into<String>>(program: S, args: Vec<String>, kind: StageKind) -> Self {
        Self {
            program: program.into(),
            args,
            kind,
        }
    }

    /// Tokenizes a command line such as `cargo test -- "some filter"`.
    pub fn parse(cmd: &str, kind: StageKind) -> Result<Self> {
        let mut tokens = split(cmd).into_iter();
        let program = tokens
            .next()
            .ok_or_else(|| Error::Config(format!("command {:?} is empty", cmd)))?;

        Ok(Self::new(program, tokens.collect(), kind))
    }

    pub const fn is_background(&self) -> bool {
        matches!(self.kind, StageKind::Background)
    }
}

impl fmt::Display for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Splits on whitespace, keeping quoted runs together.
///
/// A token opening with `'` or `"` extends to the next matching quote, and
/// the quotes are dropped. An unterminated quote swallows the rest of the
/// line. A whole token of the form `$$NAME` is replaced by the value of the
/// environment variable `NAME`, or by an empty string if it isn't set.
pub fn split(cmd: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = cmd.chars().peekable();

    loop {
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }

        let first = match chars.next() {
            Some(c) => c,
            None => break,
        };

        let mut token = String::new();
        if first == '"' || first == '\'' {
            for c in chars.by_ref() {
                if c == first {
                    break;
                }
                token.push(c);
            }
            tokens.push(token);
            continue;
        }

        token.push(first);
        while let Some(c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            token.push(*c);
            chars.next();
        }

        tokens.push(substitute_env(token));
    }

    tokens
}

fn substitute_env(token: String) -> String {
    match token.strip_prefix("$$") {
        Some(name) => env::var(name).unwrap_or_else(|_| {
            debug!("${} is not set, substituting an empty argument", name);
            String::new()
        }),
        None => token,
    }
}
