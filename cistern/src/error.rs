//! `cistern` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::config::ParseError;

/// A specialized [`Result`] type for `cistern` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible errors from the `cistern` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            context: String::new(),
            backtrace: Backtrace::capture(),
            kind,
        }
    }

    pub(crate) fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            backtrace: Backtrace::capture(),
            kind,
        }
    }

    /// The structured kind of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Backtrace captured at the point the error was constructed.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Whether [`Pool::retry`][crate::pool::Pool::retry] should replay the
    /// operation that produced this error.
    ///
    /// Only a driver-classified connection fault is retryable; misuse,
    /// bad SQL/args, and resource exhaustion are not.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            ErrorKind::ConnectionLost => true,
            ErrorKind::Driver(e) => e.retryable,
            _ => false,
        }
    }
}

/// All possible error kinds from the `cistern` library.
#[non_exhaustive]
pub enum ErrorKind {
    /// `open(url)` named a scheme with no registered driver.
    UnknownScheme(String),
    /// `checkout` exhausted `checkout_timeout` before a connection became available.
    PoolTimeout,
    /// An operation was attempted after [`Database::close`][crate::database::Database::close].
    PoolClosed,
    /// A connection was observed to be broken; classified retryable by default.
    ConnectionLost,
    /// A bound argument's type is not understood by the driver.
    UnsupportedParamType {
        driver: &'static str,
        type_name: &'static str,
    },
    /// A requested column read type is not understood by the driver.
    UnsupportedReadType {
        driver: &'static str,
        type_name: &'static str,
    },
    /// A column read was requested as a type that does not match the stored value.
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// Misuse of the pool/statement-cache API (releasing a foreign connection,
    /// double-release, and similar programmer errors).
    Programmer(&'static str),
    /// URL/config parse failure.
    Config(ParseError),
    /// Driver-specific error, opaque to the framework beyond its `retryable` tag.
    Driver(DriverError),
    /// I/O failure surfaced by a driver.
    Io(io::Error),
}

/// Error wrapper every driver uses to surface its own failures through
/// the framework's [`Error`] type.
pub struct DriverError {
    pub scheme: &'static str,
    pub message: String,
    pub retryable: bool,
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl DriverError {
    pub fn new(scheme: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            scheme,
            message: message.into(),
            retryable,
            source: None,
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scheme, self.message)
    }
}

impl fmt::Debug for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                Error::new($body)
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<DriverError>e => ErrorKind::Driver(e));
from!(<std::io::Error>e => ErrorKind::Io(e));

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Config(e) => Some(e),
            ErrorKind::Driver(e) => Some(e),
            ErrorKind::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownScheme(scheme) => write!(f, "no driver registered for scheme \"{scheme}\""),
            Self::PoolTimeout => f.write_str("timed out waiting for a pooled connection"),
            Self::PoolClosed => f.write_str("pool is closed"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::UnsupportedParamType { driver, type_name } => {
                write!(f, "driver \"{driver}\" does not support argument type {type_name}")
            }
            Self::UnsupportedReadType { driver, type_name } => {
                write!(f, "driver \"{driver}\" does not support reading column as {type_name}")
            }
            Self::TypeMismatch { expected, found } => {
                write!(f, "expected column of type {expected}, found {found}")
            }
            Self::Programmer(msg) => write!(f, "programmer error: {msg}"),
            Self::Config(e) => e.fmt(f),
            Self::Driver(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
