//! A connection pool and driver-abstraction layer for pluggable database
//! backends.
//!
//! `cistern` itself never speaks a wire protocol; it owns connection pooling,
//! per-connection statement caching, and a small trait surface
//! ([`Driver`], [`Connection`], [`DriverStatement`], [`ResultSet`]) that a
//! concrete database crate implements and registers under a URL scheme.
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! cistern::registry::register(Arc::new(my_driver::MyDriver));
//!
//! # async fn app() -> cistern::Result<()> {
//! let db = cistern::open("mydriver://localhost/app").await?;
//!
//! db.exec("CREATE TEMP TABLE foo(id int)", &[]).await?;
//! db.exec("INSERT INTO foo(id) VALUES ($1)", &[cistern::Value::Int(1)]).await?;
//!
//! let mut rows = db.fetch("SELECT id FROM foo", &[]).await?;
//! while rows.move_next().await? {
//!     let _id = rows.read_column(0)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;

mod config;
mod id;

pub mod driver;
pub mod registry;

pub mod pool;
mod statement;

pub mod database;

mod error;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{ConnInfo, ParseError};
pub use database::{Database, SetupHook, open, open_lazy};
pub use driver::{
    ColumnType, Connection, Driver, DriverStatement, ExecResult, FromValue, ResultSet, Value, downcast_other,
};
pub use error::{DriverError, Error, ErrorKind, Result};
pub use id::ConnId;
pub use pool::{BoxFuture, Pool, PoolConfig, PooledConnection};
pub use statement::{CachedResultSet, PoolStatement};
