//! Content fingerprints.

use sha2::{Digest, Sha256};

const FIELD_SEPARATOR: u8 = 0x1f;

/// Hashes an ordered list of fields into a hex sha256 fingerprint.
///
/// Fields are separated by a unit separator byte so that `["ab", "c"]` and
/// `["a", "bc"]` do not collide.
#[must_use]
pub fn fingerprint<S: AsRef<str>>(fields: &[S]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_ref().as_bytes());
        hasher.update([FIELD_SEPARATOR]);
    }
    hex::encode(hasher.finalize())
}

/// Hashes a set of `(id, fingerprint)` pairs independent of input order.
#[must_use]
pub fn hash_sorted_pairs(pairs: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = pairs.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for (id, fp) in sorted {
        hasher.update(id.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(fp.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint(&["a", "b"]), fingerprint(&["a", "b"]));
        assert_eq!(fingerprint(&["a"]).len(), 64);
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
    }

    #[test]
    fn test_hash_sorted_pairs_ignores_order() {
        let a = vec![
            ("1".to_string(), "x".to_string()),
            ("2".to_string(), "y".to_string()),
        ];
        let b = vec![
            ("2".to_string(), "y".to_string()),
            ("1".to_string(), "x".to_string()),
        ];
        assert_eq!(hash_sorted_pairs(&a), hash_sorted_pairs(&b));

        let c = vec![
            ("1".to_string(), "x".to_string()),
            ("2".to_string(), "z".to_string()),
        ];
        assert_ne!(hash_sorted_pairs(&a), hash_sorted_pairs(&c));
    }
}
