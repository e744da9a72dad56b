//! API error type and [`axum::response::IntoResponse`] implementation.
//!
//! Every error is rendered as an [`ErrorBody`] so clients can branch on
//! `error_code` and `retryable` without parsing messages.

use axum::{
  Json,
  http::{HeaderValue, StatusCode, header},
  response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use reckon_core::{EvalError, ProjectionError, ResolveError, store::StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire shape of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
  pub error_code:          String,
  pub message:             String,
  pub remediation:         String,
  pub retryable:           bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry_after_seconds: Option<u64>,
}

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("no activated ruleset covers {as_of}")]
  NoRulesetForDate {
    as_of:              NaiveDate,
    earliest_available: Option<NaiveDate>,
  },

  #[error("{0}")]
  ConcurrentModification(String),

  #[error("administrator credentials required")]
  Forbidden,

  #[error("invalid input: {0}")]
  Validation(String),

  #[error("{0}")]
  InvalidTransition(String),

  #[error("{0}")]
  Conflict(String),

  #[error("{0}")]
  CyclicDependency(String),

  #[error("{0}")]
  HorizonExceeded(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("idempotency key {0:?} was already used for a different request")]
  IdempotencyConflict(String),

  #[error("store unavailable: {0}")]
  Unavailable(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl ApiError {
  /// Classify a backend failure: domain errors keep their meaning,
  /// transient ones become 503s.
  pub fn store<E: StoreError>(err: E) -> Self {
    if let Some(domain) = err.domain() {
      return Self::from_core(domain);
    }
    if err.is_transient() {
      return Self::Unavailable(err.to_string());
    }
    tracing::error!(error = %err, "store failure");
    Self::Internal(err.to_string())
  }

  fn from_core(err: &reckon_core::Error) -> Self {
    use reckon_core::Error as E;
    match err {
      E::ConcurrentModification { .. } => Self::ConcurrentModification(err.to_string()),
      E::RulesetNotFound(id) => Self::NotFound(format!("ruleset {id}")),
      E::RulesetExists(_) | E::VersionConflict { .. } => Self::Conflict(err.to_string()),
      E::InvalidTransition { .. } => Self::InvalidTransition(err.to_string()),
      E::InvalidCurrency(_)
      | E::UnitMismatch { .. }
      | E::WrongUnit { .. }
      | E::InvalidRounding(_)
      | E::InvalidWindow { .. }
      | E::InvalidState(_) => Self::Validation(err.to_string()),
      E::ArithmeticOverflow { .. }
      | E::DuplicateCalculation(_)
      | E::Serialization(_) => Self::Internal(err.to_string()),
    }
  }

  fn parts(&self) -> (StatusCode, &'static str, String, bool, Option<u64>) {
    match self {
      Self::NoRulesetForDate {
        earliest_available, ..
      } => {
        let remediation = match earliest_available {
          Some(date) => format!("use an as_of on or after {date}"),
          None => "publish and activate a ruleset first".to_owned(),
        };
        (StatusCode::NOT_FOUND, "NO_RULESET_FOR_DATE", remediation, false, None)
      }
      Self::ConcurrentModification(_) => (
        StatusCode::CONFLICT,
        "CONCURRENT_MODIFICATION",
        "refetch the ruleset and retry with its current revision".to_owned(),
        true,
        Some(1),
      ),
      Self::Forbidden => (
        StatusCode::FORBIDDEN,
        "FORBIDDEN",
        "authenticate with administrator credentials".to_owned(),
        false,
        None,
      ),
      Self::Validation(_) => (
        StatusCode::UNPROCESSABLE_ENTITY,
        "VALIDATION_FAILED",
        "correct the request inputs".to_owned(),
        false,
        None,
      ),
      Self::InvalidTransition(_) => (
        StatusCode::CONFLICT,
        "INVALID_TRANSITION",
        "check the ruleset's current status".to_owned(),
        false,
        None,
      ),
      Self::Conflict(_) => (
        StatusCode::CONFLICT,
        "CONFLICT",
        "publish under a new ruleset id or record version".to_owned(),
        false,
        None,
      ),
      Self::CyclicDependency(_) => (
        StatusCode::UNPROCESSABLE_ENTITY,
        "CYCLIC_DEPENDENCY",
        "fix the calculation dependencies in the registry".to_owned(),
        false,
        None,
      ),
      Self::HorizonExceeded(_) => (
        StatusCode::UNPROCESSABLE_ENTITY,
        "HORIZON_EXCEEDED",
        "request fewer periods".to_owned(),
        false,
        None,
      ),
      Self::NotFound(_) => (
        StatusCode::NOT_FOUND,
        "NOT_FOUND",
        "check the identifier".to_owned(),
        false,
        None,
      ),
      Self::BadRequest(_) => (
        StatusCode::BAD_REQUEST,
        "BAD_REQUEST",
        "correct the request".to_owned(),
        false,
        None,
      ),
      Self::IdempotencyConflict(_) => (
        StatusCode::UNPROCESSABLE_ENTITY,
        "IDEMPOTENCY_CONFLICT",
        "use a fresh Idempotency-Key for a different request".to_owned(),
        false,
        None,
      ),
      Self::Unavailable(_) => (
        StatusCode::SERVICE_UNAVAILABLE,
        "STORE_UNAVAILABLE",
        "retry after a short delay".to_owned(),
        true,
        Some(1),
      ),
      Self::Internal(_) => (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL",
        "report this error".to_owned(),
        false,
        None,
      ),
    }
  }

  pub fn body(&self) -> ErrorBody {
    let (_, code, remediation, retryable, retry_after_seconds) = self.parts();
    ErrorBody {
      error_code: code.to_owned(),
      message: self.to_string(),
      remediation,
      retryable,
      retry_after_seconds,
    }
  }
}

impl From<reckon_core::Error> for ApiError {
  fn from(err: reckon_core::Error) -> Self { Self::from_core(&err) }
}

impl From<ResolveError> for ApiError {
  fn from(err: ResolveError) -> Self {
    match err {
      ResolveError::NoRulesetForDate {
        as_of,
        earliest_available,
      } => Self::NoRulesetForDate {
        as_of,
        earliest_available,
      },
      ResolveError::UnknownRuleset(id) => Self::NotFound(format!("ruleset {id}")),
      other @ ResolveError::RulesetNotActivated { .. } => {
        Self::InvalidTransition(other.to_string())
      }
    }
  }
}

impl From<EvalError> for ApiError {
  fn from(err: EvalError) -> Self {
    match err {
      EvalError::CyclicDependency { .. } => Self::CyclicDependency(err.to_string()),
      EvalError::MissingRequiredInput { .. }
      | EvalError::UnitMismatch { .. }
      | EvalError::ConstraintViolation { .. } => Self::Validation(err.to_string()),
      other => Self::Internal(other.to_string()),
    }
  }
}

impl From<ProjectionError> for ApiError {
  fn from(err: ProjectionError) -> Self {
    match err {
      ProjectionError::HorizonExceeded { .. } => Self::HorizonExceeded(err.to_string()),
      ProjectionError::Resolve { source, .. } => source.into(),
      ProjectionError::Eval { source, .. } => source.into(),
      ProjectionError::State { source, .. } => source.into(),
      ProjectionError::Cancelled { .. } => Self::Unavailable(err.to_string()),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, ..) = self.parts();
    let body = self.body();
    let mut res = (status, Json(&body)).into_response();
    if let Some(seconds) = body.retry_after_seconds {
      res
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
    }
    res
  }
}
