//! Configuration fingerprints for cached tokens.

use sha2::{Digest, Sha256};

/// Hash the scope-defining request parameters (region, endpoint, scopes)
/// into a short stable fingerprint. A cached token is only valid while its
/// stored fingerprint equals the current configuration's.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(
            fingerprint(&["us-east-1", "https://sso.example.com"]),
            fingerprint(&["us-east-1", "https://sso.example.com"])
        );
    }

    #[test]
    fn test_fingerprint_differs_by_part() {
        assert_ne!(
            fingerprint(&["us-east-1", "https://sso.example.com"]),
            fingerprint(&["eu-west-1", "https://sso.example.com"])
        );
    }

    #[test]
    fn test_part_boundaries_matter() {
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
    }
}
