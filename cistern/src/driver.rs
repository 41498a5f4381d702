//! The polymorphic surface every driver implements.
//!
//! `cistern` never parses SQL or speaks a wire protocol itself; every
//! concrete database integration plugs in through these four traits and
//! registers its [`Driver`] under a URL scheme (see [`crate::registry`]).
use std::{any::Any, sync::Arc};

use async_trait::async_trait;

use crate::{config::ConnInfo, error::Result, pool::PoolConfig};

/// A value bound as a statement argument, or read back from a result set.
///
/// The core set covers what nearly every database needs. A driver that needs
/// a domain-specific type (a Postgres range, a Mongo ObjectId, ...) carries it
/// in [`Value::Other`]; a driver that receives a `Value` variant (including
/// `Other` payloads from a *different* driver) that it does not recognize
/// must fail with [`crate::error::ErrorKind::UnsupportedParamType`].
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(bytes::Bytes),
    Time(std::time::SystemTime),
    /// A driver-specific value opaque to the framework.
    Other(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Int(i) => write!(f, "Int({i})"),
            Self::Float(x) => write!(f, "Float({x})"),
            Self::Text(s) => write!(f, "Text({s:?})"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Time(_) => f.write_str("Time(..)"),
            Self::Other(_) => f.write_str("Other(..)"),
        }
    }
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Time(_) => "time",
            Self::Other(_) => "other",
        }
    }
}

/// Converts a raw [`Value`] read from a result set into a concrete Rust type.
///
/// [`ResultSet::read_column`] has to stay non-generic to keep `ResultSet`
/// object-safe, so the generic, driver-extensible column read the source
/// exposes as a single `read_column<T>` lives one level up: callers ask for
/// `T` through [`crate::statement::CachedResultSet::read`], which converts
/// the trait object's raw `Value` via this trait.
///
/// The core primitive conversions below fail with
/// [`crate::error::ErrorKind::TypeMismatch`] on a type they can't satisfy. A
/// driver implementing `FromValue` for one of its own [`Value::Other`] types
/// should use [`downcast_other`] and let a failed downcast surface as
/// [`crate::error::ErrorKind::UnsupportedReadType`] instead.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

/// Downcast a [`Value::Other`] payload to `T`, for use by a driver's own
/// [`FromValue`] implementations. Fails with
/// [`crate::error::ErrorKind::UnsupportedReadType`] if `value` isn't
/// `Other`, or carries a payload of a different concrete type.
pub fn downcast_other<T: Clone + Send + Sync + 'static>(
    value: Value,
    driver: &'static str,
    type_name: &'static str,
) -> Result<T> {
    match value {
        Value::Other(payload) => payload
            .downcast::<T>()
            .map(|v| (*v).clone())
            .map_err(|_| crate::error::Error::from(crate::error::ErrorKind::UnsupportedReadType { driver, type_name })),
        other => Err(crate::error::Error::from(crate::error::ErrorKind::TypeMismatch {
            expected: type_name,
            found: other.type_name(),
        })),
    }
}

macro_rules! from_value_core {
    ($ty:ty, $name:literal, $pat:pat => $body:expr) => {
        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self> {
                match value {
                    $pat => Ok($body),
                    other => Err(crate::error::Error::from(crate::error::ErrorKind::TypeMismatch {
                        expected: $name,
                        found: other.type_name(),
                    })),
                }
            }
        }
    };
}

from_value_core!(bool, "bool", Value::Bool(b) => b);
from_value_core!(i64, "int", Value::Int(i) => i);
from_value_core!(f64, "float", Value::Float(f) => f);
from_value_core!(String, "text", Value::Text(s) => s);
from_value_core!(bytes::Bytes, "bytes", Value::Bytes(b) => b);
from_value_core!(std::time::SystemTime, "time", Value::Time(t) => t);

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// The outcome of [`DriverStatement::exec`]: a statement executed for its
/// effect rather than its rows.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// A column's declared type, as reported by a [`ResultSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Time,
    /// A driver-specific column type, named for diagnostics.
    Other(&'static str),
}

/// A forward cursor over the rows produced by a query.
///
/// A `ResultSet` holds the connection and driver statement that produced it.
/// Dropping it without calling [`ResultSet::close`] abandons those resources
/// until the owning [`crate::statement::PoolStatement`] drops its own
/// reference; callers that used a block-scoped query API never observe this
/// because the wrapper returned to them calls `close` for them.
#[async_trait]
pub trait ResultSet: Send {
    /// Advance to the next row. `false` means exhausted.
    async fn move_next(&mut self) -> Result<bool>;

    fn column_count(&self) -> usize;

    fn column_name(&self, index: usize) -> &str;

    fn column_type(&self, index: usize) -> ColumnType;

    /// Read the value at `index` in the current row.
    fn read_column(&self, index: usize) -> Result<Value>;

    /// Release the connection this result set was borrowing back to the pool.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// A prepared statement bound to one specific connection.
///
/// Bound for the life of that connection: a [`ResultSet`]/[`ExecResult`] it
/// produces is only valid while the owning connection is checked out, and a
/// pool statement must never hold more than one `DriverStatement` per
/// connection.
#[async_trait]
pub trait DriverStatement: Send {
    async fn query(&mut self, args: &[Value]) -> Result<Box<dyn ResultSet>>;

    async fn exec(&mut self, args: &[Value]) -> Result<ExecResult>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// A live session to a backing database.
///
/// Owned by exactly one holder at a time: either the pool's free set or
/// whichever task currently has it checked out.
#[async_trait]
pub trait Connection: Send {
    /// Prepare `query` on this connection.
    async fn build_statement(&mut self, query: &str) -> Result<Box<dyn DriverStatement>>;

    /// A cheap liveness probe, used by the pool before handing a connection
    /// back out and when deciding whether a release should discard it.
    async fn is_valid(&mut self) -> bool;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// A scheme-bound factory producing connections, registered once per process
/// (see [`crate::registry::register`]).
#[async_trait]
pub trait Driver: Send + Sync {
    /// The URL scheme this driver answers to, e.g. `"postgres"`.
    fn scheme(&self) -> &'static str;

    /// Parse pool sizing/timeout/retry options from the URL's query
    /// parameters.
    ///
    /// Implementations should delegate the recognized keys to
    /// [`PoolConfig::from_params`] and are free to additionally interpret
    /// whatever keys remain for their own purposes.
    fn connection_pool_options(&self, info: &ConnInfo) -> Result<PoolConfig>;

    /// Build one new connection for the given parsed URL.
    async fn build_connection(&self, info: &ConnInfo) -> Result<Box<dyn Connection>>;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn core_conversions_round_trip() {
        assert_eq!(i64::from_value(Value::Int(7)).unwrap(), 7);
        assert_eq!(f64::from_value(Value::Float(1.5)).unwrap(), 1.5);
        assert_eq!(String::from_value(Value::Text("hi".into())).unwrap(), "hi");
        assert!(bool::from_value(Value::Bool(true)).unwrap());
    }

    #[test]
    fn null_converts_to_none_for_option() {
        assert_eq!(Option::<i64>::from_value(Value::Null).unwrap(), None);
        assert_eq!(Option::<i64>::from_value(Value::Int(3)).unwrap(), Some(3));
    }

    #[test]
    fn mismatched_core_conversion_fails() {
        let err = i64::from_value(Value::Text("nope".into())).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::TypeMismatch { .. }));
    }

    #[derive(Clone, PartialEq, Debug)]
    struct Point(i32, i32);

    #[test]
    fn downcast_other_recovers_the_concrete_type() {
        let value = Value::Other(Arc::new(Point(1, 2)));
        let point: Point = downcast_other(value, "mock", "Point").unwrap();
        assert_eq!(point, Point(1, 2));
    }

    #[test]
    fn downcast_other_rejects_the_wrong_type() {
        let value = Value::Other(Arc::new(Point(1, 2)));
        let err = downcast_other::<String>(value, "mock", "String").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnsupportedReadType { .. }));
    }
}
