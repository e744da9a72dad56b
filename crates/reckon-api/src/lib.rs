//! JSON REST API for Reckon.
//!
//! Exposes an axum [`Router`] backed by any [`reckon_core::store::RuleStore`].
//! TLS and transport concerns are the caller's responsibility; only the
//! rollback route checks credentials.
//!
//! # Mounting
//!
//! ```rust,ignore
//! let service = RunService::new(store, evaluator, reconciler, settings);
//! let app = reckon_api::api_router(AppState::new(service, auth));
//! ```

pub mod auth;
pub mod calc;
pub mod error;
pub mod rulesets;
pub mod service;
pub mod trace;

pub use error::{ApiError, ErrorBody};
pub use service::RunService;

use std::sync::Arc;

use axum::{
  Json, Router,
  extract::rejection::JsonRejection,
  routing::{get, post},
};
use reckon_core::store::RuleStore;

use auth::AuthConfig;

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
pub struct AppState<S: RuleStore> {
  pub service: Arc<RunService<S>>,
  pub auth:    Arc<AuthConfig>,
}

impl<S: RuleStore> AppState<S> {
  pub fn new(service: RunService<S>, auth: AuthConfig) -> Self {
    Self {
      service: Arc::new(service),
      auth:    Arc::new(auth),
    }
  }
}

impl<S: RuleStore> Clone for AppState<S> {
  fn clone(&self) -> Self {
    Self {
      service: Arc::clone(&self.service),
      auth:    Arc::clone(&self.auth),
    }
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build a fully-materialised API router.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S>(state: AppState<S>) -> Router<()>
where
  S: RuleStore + 'static,
{
  Router::new()
    // Rulesets
    .route("/rulesets", get(rulesets::list::<S>).post(rulesets::publish::<S>))
    .route("/rulesets/{id}", get(rulesets::get_one::<S>))
    .route("/rulesets/{id}/validate", post(rulesets::validate::<S>))
    .route("/rulesets/{id}/activate", post(rulesets::activate::<S>))
    .route("/rulesets/{id}/rollback", post(rulesets::rollback::<S>))
    // Calculation
    .route("/calc/run", post(calc::run::<S>))
    .route("/calc/project", post(calc::project::<S>))
    .route("/calc/batch", post(calc::batch::<S>))
    // History
    .route("/trace/{scenario_id}", get(trace::scenario::<S>))
    .route("/facts/{id}", get(trace::fact::<S>))
    .with_state(state)
}

/// Unwrap a JSON body, rendering extractor failures as [`ApiError`]s.
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
  payload
    .map(|Json(body)| body)
    .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

#[cfg(test)]
mod tests;
