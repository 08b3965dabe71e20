//! Content fingerprints for candidate relationships.
//!
//! A [`ContentHash`] is a SHA-256 digest over an edge's semantic content:
//! `source_id`, `target_id`, `relation` and its properties. No temporal
//! field takes part, so the same fact re-extracted a month later hashes to
//! the same value and the store can classify it as unchanged.
//!
//! The encoding is length-prefixed rather than concatenated, so
//! `("ab", "c")` and `("a", "bc")` never collide. Properties are fed in key
//! order (the map is a `BTreeMap`), which makes the digest independent of
//! the order in which an extractor emitted them.

use crate::{Properties, PropertyValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Property keys stored on an edge but excluded from its content hash.
///
/// The extractor's confidence score is recorded as a property, yet a fact
/// whose only difference is a new confidence value is the same fact.
pub const UNHASHED_PROPERTY_KEYS: &[&str] = &["confidence"];

/// Hex-encoded SHA-256 digest (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Is `key` excluded from hashing?
pub fn is_unhashed_key(key: &str) -> bool {
    UNHASHED_PROPERTY_KEYS.contains(&key)
}

/// Compute the content hash of a relationship.
///
/// Deterministic across processes and platforms.
pub fn content_hash(
    source_id: &str,
    target_id: &str,
    relation: &str,
    properties: &Properties,
) -> ContentHash {
    let mut hasher = Sha256::new();
    update_str(&mut hasher, source_id);
    update_str(&mut hasher, target_id);
    update_str(&mut hasher, relation);

    let hashed: Vec<(&String, &PropertyValue)> = properties
        .iter()
        .filter(|(k, _)| !is_unhashed_key(k))
        .collect();
    hasher.update((hashed.len() as u64).to_le_bytes());
    for (key, value) in hashed {
        update_str(&mut hasher, key);
        update_value(&mut hasher, value);
    }

    ContentHash(hex::encode(hasher.finalize()))
}

fn update_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn update_value(hasher: &mut Sha256, value: &PropertyValue) {
    match value {
        PropertyValue::Text(s) => {
            hasher.update([b'T']);
            update_str(hasher, s);
        }
        PropertyValue::Number(n) => {
            hasher.update([b'N']);
            hasher.update(canonical_f64_bits(*n).to_le_bytes());
        }
        PropertyValue::Boolean(b) => {
            hasher.update([b'B', u8::from(*b)]);
        }
    }
}

// -0.0 == 0.0 and every NaN is the same "not a number" to a reader.
fn canonical_f64_bits(n: f64) -> u64 {
    if n.is_nan() {
        f64::NAN.to_bits()
    } else if n == 0.0 {
        0.0_f64.to_bits()
    } else {
        n.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn props(pairs: &[(&str, PropertyValue)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn digest_is_sha256_hex() {
        let hash = content_hash("tesla_inc", "eberhard", "FOUNDED_BY", &Properties::new());
        assert_eq!(hash.as_str().len(), 64);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn property_change_changes_hash() {
        let a = content_hash(
            "tesla_inc",
            "eberhard",
            "FOUNDED_BY",
            &props(&[("year", "2003".into())]),
        );
        let b = content_hash(
            "tesla_inc",
            "eberhard",
            "FOUNDED_BY",
            &props(&[("year", "2004".into())]),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        let a = content_hash("ab", "c", "R", &Properties::new());
        let b = content_hash("a", "bc", "R", &Properties::new());
        assert_ne!(a, b);
    }

    #[test]
    fn direction_matters() {
        let forward = content_hash("alice", "bob", "KNOWS", &Properties::new());
        let backward = content_hash("bob", "alice", "KNOWS", &Properties::new());
        assert_ne!(forward, backward);
    }

    #[test]
    fn value_type_is_part_of_the_hash() {
        let text = content_hash("a", "b", "R", &props(&[("n", "1".into())]));
        let number = content_hash("a", "b", "R", &props(&[("n", 1.0_f64.into())]));
        assert_ne!(text, number);
    }

    #[test]
    fn confidence_is_excluded() {
        let plain = content_hash("a", "b", "R", &props(&[("role", "ceo".into())]));
        let with_confidence = content_hash(
            "a",
            "b",
            "R",
            &props(&[("role", "ceo".into()), ("confidence", 0.4_f64.into())]),
        );
        assert_eq!(plain, with_confidence);
    }

    #[test]
    fn signed_zero_hashes_equal() {
        let pos = content_hash("a", "b", "R", &props(&[("x", 0.0_f64.into())]));
        let neg = content_hash("a", "b", "R", &props(&[("x", (-0.0_f64).into())]));
        assert_eq!(pos, neg);
    }

    proptest! {
        #[test]
        fn insertion_order_does_not_matter(
            entries in proptest::collection::vec(("[a-z]{1,6}", "[a-z0-9 ]{0,8}"), 0..8)
        ) {
            let forward: Properties = entries
                .iter()
                .map(|(k, v)| (k.clone(), PropertyValue::Text(v.clone())))
                .collect();
            let mut reversed = Properties::new();
            for (k, v) in entries.iter().rev() {
                // Later writes win in `collect`, so mirror that when reversing.
                reversed.entry(k.clone()).or_insert_with(|| PropertyValue::Text(v.clone()));
            }
            let forward_hash = content_hash("s", "t", "R", &forward);
            let reversed_hash = content_hash("s", "t", "R", &reversed);
            prop_assert_eq!(forward_hash, reversed_hash);
        }
    }
}
