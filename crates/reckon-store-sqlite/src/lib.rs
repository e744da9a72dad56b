//! SQLite-backed implementation of [`reckon_core::store::RuleStore`].
//!
//! Uses `tokio-rusqlite` to run all database operations on a dedicated
//! background thread, keeping the async executor free.
//!
//! # Usage
//!
//! ```rust,no_run
//! # async fn example() -> reckon_store_sqlite::Result<()> {
//! use reckon_store_sqlite::SqliteStore;
//!
//! let store = SqliteStore::open("reckon.db").await?;
//! # Ok(())
//! # }
//! ```

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;
