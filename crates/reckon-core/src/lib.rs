//! Core types, evaluation engine and trait definitions for the Reckon
//! calculation engine.
//!
//! This crate is deliberately free of HTTP and database dependencies. It owns
//! the value model, the versioned rule model, ruleset resolution, the
//! dependency-ordered evaluator, multi-period projection and reconciliation.
//! Storage backends implement [`store::RuleStore`]; the HTTP layer consumes it.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod catalog;
pub mod digest;
pub mod error;
pub mod eval;
pub mod fact;
pub mod id;
pub mod projection;
pub mod reconcile;
pub mod resolve;
pub mod rule;
pub mod settings;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod trace;
pub mod unit;
pub mod value;

pub use error::{Error, EvalError, ProjectionError, ResolveError, Result};
pub use id::{CalcId, EntityId, FactId, RulesetId, ScenarioId};

#[cfg(test)]
mod fixtures;
