/// faultline errors. All errors are converted into this type before they
/// surface. Errors never cross a component boundary: they are handled where
/// they are observed, by dropping a connection, retrying, or replying with a
/// protocol-level ERROR line (see the per-component failure policies).
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// An internal invariant violation, e.g. a poisoned lock. These are
    /// bugs, not expected runtime conditions.
    Internal(String),
    /// Invalid data received from a peer, e.g. an unparseable JSON envelope
    /// or an unknown control line.
    InvalidData(String),
    /// Invalid user input, e.g. a malformed replica table or address.
    InvalidInput(String),
    /// An IO error, on the network or the terminal.
    IO(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Internal(message) => write!(f, "internal error: {message}"),
            Error::InvalidData(message) => write!(f, "invalid data: {message}"),
            Error::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Error::IO(message) => write!(f, "io error: {message}"),
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<rustyline::error::ReadlineError> for Error {
    fn from(err: rustyline::error::ReadlineError) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

/// A faultline Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Allows returning errdata!/errinput! constructions directly from functions
/// returning Result.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}
