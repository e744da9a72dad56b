//! Error type for `reckon-store-sqlite`.

use reckon_core::store::StoreError;
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] reckon_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A column held a value no domain type decodes from.
  #[error("corrupt column {column}: {value:?}")]
  Corrupt {
    column: &'static str,
    value:  String,
  },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl StoreError for Error {
  fn is_transient(&self) -> bool {
    match self {
      Self::Database(tokio_rusqlite::Error::Rusqlite(
        rusqlite::Error::SqliteFailure(err, _),
      )) => matches!(
        err.code,
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
      ),
      _ => false,
    }
  }

  fn domain(&self) -> Option<&reckon_core::Error> {
    match self {
      Self::Core(err) => Some(err),
      _ => None,
    }
  }
}
