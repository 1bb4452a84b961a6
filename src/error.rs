use std::{error::Error as StdError, fmt, io};

pub type Result<T> = ::std::result::Result<T, Error>;

pub enum Error {
    Canonicalization(String, io::Error),
    Config(String),
    Glob(globset::Error),
    Pattern(glob::PatternError),
    Io(io::Error),
    Notify(notify::Error),
}

impl StdError for Error {}

impl From<globset::Error> for Error {
    fn from(err: globset::Error) -> Self {
        Self::Glob(err)
    }
}

impl From<glob::PatternError> for Error {
    fn from(err: glob::PatternError) -> Self {
        Self::Pattern(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        match err {
            notify::Error::Io(err) => Self::Io(err),
            other => Self::Notify(other),
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::Config(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} error: {}",
            match self {
                Self::Canonicalization(_, _) => "Path",
                Self::Config(_) => "Configuration",
                Self::Glob(_) => "Globset",
                Self::Pattern(_) => "Pattern",
                Self::Io(_) => "I/O",
                Self::Notify(_) => "Notify",
            },
            match self {
                Self::Canonicalization(path, err) => {
                    format!("couldn't canonicalize '{}':\n{}", path, err)
                }
                Self::Config(msg) => msg.clone(),
                Self::Glob(err) => err.to_string(),
                Self::Pattern(err) => err.to_string(),
                Self::Io(err) => err.to_string(),
                Self::Notify(err) => err.to_string(),
            }
        )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
