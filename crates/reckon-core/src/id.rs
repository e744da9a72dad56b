//! String-backed identifiers.
//!
//! Each identifier is a distinct type so a calculation id can never be passed
//! where an entity id is expected. All of them order lexically, which the
//! engine relies on for deterministic output ordering.

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

macro_rules! string_id {
  ($(#[$meta:meta])* $name:ident) => {
    $(#[$meta])*
    #[derive(
      Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    #[serde(transparent)]
    pub struct $name(String);

    impl $name {
      pub fn new(value: impl Into<String>) -> Self { Self(value.into()) }

      pub fn as_str(&self) -> &str { &self.0 }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
      }
    }

    impl From<&str> for $name {
      fn from(value: &str) -> Self { Self(value.to_owned()) }
    }

    impl From<String> for $name {
      fn from(value: String) -> Self { Self(value) }
    }

    impl Borrow<str> for $name {
      fn borrow(&self) -> &str { &self.0 }
    }
  };
}

string_id!(
  /// Stable identifier of a calculation, e.g. `pit.income_tax`.
  CalcId
);
string_id!(
  /// A person, trust, company or household member within a scenario.
  EntityId
);
string_id!(
  /// Identifies a published ruleset snapshot, e.g. `au-2024-07-01`.
  RulesetId
);
string_id!(
  /// The client scenario a calculation run belongs to.
  ScenarioId
);
string_id!(
  /// Content-derived fact identifier (hex SHA-256).
  FactId
);
