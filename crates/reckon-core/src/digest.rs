//! Content hashing.
//!
//! Hashes are hex-encoded SHA-256 over the canonical JSON encoding of a value.
//! Every hashed type is built from structs, sorted maps and sorted vectors, so
//! `serde_json` output is stable for equal inputs.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::Result;

/// Hash the canonical JSON encoding of `value`.
pub fn canonical_digest<T: Serialize + ?Sized>(value: &T) -> Result<String> {
  let bytes = serde_json::to_vec(value)?;
  Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Hash a sequence of string parts. Each part is length-prefixed so that
/// `["ab", "c"]` and `["a", "bc"]` differ.
pub fn digest_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
  let mut hasher = Sha256::new();
  for part in parts {
    hasher.update((part.len() as u64).to_be_bytes());
    hasher.update(part.as_bytes());
  }
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parts_are_length_prefixed() {
    assert_ne!(digest_parts(["ab", "c"]), digest_parts(["a", "bc"]));
    assert_eq!(digest_parts(["a", "b"]), digest_parts(["a", "b"]));
  }

  #[test]
  fn canonical_digest_is_hex_sha256() {
    let d = canonical_digest(&serde_json::json!({"a": 1})).unwrap();
    assert_eq!(d.len(), 64);
    assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
