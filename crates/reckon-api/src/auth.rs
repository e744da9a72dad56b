//! HTTP Basic-auth guard for administrative routes.

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, request::Parts};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use reckon_core::store::RuleStore;

use crate::{AppState, error::ApiError};

/// Administrator credentials for this server instance.
#[derive(Clone)]
pub struct AuthConfig {
  pub username:      String,
  /// PHC string produced by argon2, e.g. `$argon2id$v=19$…`
  pub password_hash: String,
}

/// Zero-size marker: present in the handler means the caller is an
/// administrator.
pub struct Admin;

/// Verify Basic credentials against `config`.
pub fn verify_admin(headers: &HeaderMap, config: &AuthConfig) -> Result<(), ApiError> {
  let header_val = headers
    .get(axum::http::header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .ok_or(ApiError::Forbidden)?;

  let encoded = header_val
    .strip_prefix("Basic ")
    .ok_or(ApiError::Forbidden)?;

  let decoded = B64.decode(encoded).map_err(|_| ApiError::Forbidden)?;
  let creds   = std::str::from_utf8(&decoded).map_err(|_| ApiError::Forbidden)?;

  let (username, password) = creds.split_once(':').ok_or(ApiError::Forbidden)?;

  if username != config.username {
    return Err(ApiError::Forbidden);
  }

  // An empty or malformed configured hash locks the admin routes.
  let parsed_hash = PasswordHash::new(&config.password_hash)
    .map_err(|_| ApiError::Forbidden)?;

  Argon2::default()
    .verify_password(password.as_bytes(), &parsed_hash)
    .map_err(|_| ApiError::Forbidden)?;

  Ok(())
}

impl<S> FromRequestParts<AppState<S>> for Admin
where
  S: RuleStore + 'static,
{
  type Rejection = ApiError;

  async fn from_request_parts(
    parts: &mut Parts,
    state: &AppState<S>,
  ) -> Result<Self, Self::Rejection> {
    if let Err(err) = verify_admin(&parts.headers, &state.auth) {
      tracing::warn!(path = %parts.uri.path(), "rejected administrative request");
      return Err(err);
    }
    Ok(Admin)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use argon2::{PasswordHasher, password_hash::SaltString};
  use axum::http::{HeaderValue, header};
  use rand_core::OsRng;

  fn config(password: &str) -> AuthConfig {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
      .hash_password(password.as_bytes(), &salt)
      .unwrap()
      .to_string();
    AuthConfig {
      username:      "admin".to_string(),
      password_hash: hash,
    }
  }

  fn headers(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
    headers
  }

  fn basic(user: &str, pass: &str) -> String {
    format!("Basic {}", B64.encode(format!("{user}:{pass}")))
  }

  #[test]
  fn correct_credentials() {
    let config = config("secret");
    assert!(verify_admin(&headers(&basic("admin", "secret")), &config).is_ok());
  }

  #[test]
  fn wrong_password_or_user() {
    let config = config("secret");
    assert!(matches!(
      verify_admin(&headers(&basic("admin", "wrong")), &config),
      Err(ApiError::Forbidden)
    ));
    assert!(matches!(
      verify_admin(&headers(&basic("root", "secret")), &config),
      Err(ApiError::Forbidden)
    ));
  }

  #[test]
  fn missing_or_garbled_header() {
    let config = config("secret");
    assert!(verify_admin(&HeaderMap::new(), &config).is_err());
    assert!(verify_admin(&headers("Basic !!!not-base64!!!"), &config).is_err());
    assert!(verify_admin(&headers("Bearer abc"), &config).is_err());
  }

  #[test]
  fn unset_hash_locks_admin_routes() {
    let config = AuthConfig {
      username:      "admin".to_string(),
      password_hash: String::new(),
    };
    assert!(verify_admin(&headers(&basic("admin", "")), &config).is_err());
  }
}
