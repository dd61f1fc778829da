//! Uniform fallible-return contract shared by every corio operation.

use std::fmt;

/// A human-readable error carrying an owned message.
///
/// Unlike the C++ original this wraps `std::result::Result` instead of a
/// hand-rolled tagged union: Rust's `Result` already has exactly two states
/// (`Ok`/`Err`), so there is no separate "empty" state to model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HumanError {
    message: String,
}

impl HumanError {
    pub fn new(message: impl Into<String>) -> Self {
        HumanError { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HumanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HumanError {}

impl From<std::io::Error> for HumanError {
    fn from(err: std::io::Error) -> Self {
        HumanError::new(err.to_string())
    }
}

impl From<std::str::Utf8Error> for HumanError {
    fn from(err: std::str::Utf8Error) -> Self {
        HumanError::new(err.to_string())
    }
}

impl From<url::ParseError> for HumanError {
    fn from(err: url::ParseError) -> Self {
        HumanError::new(err.to_string())
    }
}

/// The result type every fallible `corio` operation returns.
pub type Result<T> = std::result::Result<T, HumanError>;

/// Builds a [`HumanError`] from a `format!`-style literal, mirroring the
/// original `errf(fmt, args...)` helper.
macro_rules! errf {
    ($($arg:tt)*) => {
        $crate::error::HumanError::new(format!($($arg)*))
    };
}

pub(crate) use errf;
