//! Hostname to storage-path encoding.
//!
//! Every certificate record lives at a path derived from its hostname:
//! a fixed prefix followed by the lowercase hex encoding of the hostname's
//! UTF-8 bytes. The encoding is reversible, so the path is the only key a
//! record needs and two distinct hostnames can never share a path.

/// Prefix shared by every certificate record path
pub const CERT_PATH_PREFIX: &str = "/certs/";

/// Storage path for a hostname
pub fn path_from_host(hostname: &str) -> String {
    format!("{}{}", CERT_PATH_PREFIX, hex::encode(hostname.as_bytes()))
}

/// Hostname stored at a path
///
/// Returns `None` when the path lacks the prefix or does not carry a valid
/// hex-encoded UTF-8 hostname.
pub fn host_from_path(path: &str) -> Option<String> {
    let encoded = path.strip_prefix(CERT_PATH_PREFIX)?;
    let bytes = hex::decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// Hex encoding of a hostname without the path prefix
///
/// Used to name entries in published bundles.
pub fn encoded_host(hostname: &str) -> String {
    hex::encode(hostname.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_path_from_host() {
        assert_eq!(path_from_host("example.com"), "/certs/6578616d706c652e636f6d");
        assert_eq!(path_from_host(""), "/certs/");
    }

    #[test]
    fn test_host_from_path() {
        assert_eq!(
            host_from_path("/certs/6578616d706c652e636f6d"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn test_host_from_path_rejects_garbage() {
        assert_eq!(host_from_path("/other/6578"), None);
        assert_eq!(host_from_path("/certs/zz"), None);
        assert_eq!(host_from_path("/certs/abc"), None);
        assert_eq!(host_from_path("/cer"), None);
        // 0xff is not valid UTF-8 on its own
        assert_eq!(host_from_path("/certs/ff"), None);
    }

    #[test]
    fn test_encoded_host_matches_path_suffix() {
        let path = path_from_host("a.example.org");
        assert_eq!(
            path.strip_prefix(CERT_PATH_PREFIX),
            Some(encoded_host("a.example.org").as_str())
        );
    }

    proptest! {
        #[test]
        fn prop_path_round_trip(hostname in ".*") {
            prop_assert_eq!(host_from_path(&path_from_host(&hostname)), Some(hostname));
        }

        #[test]
        fn prop_distinct_hosts_never_collide(a in "[a-z0-9.-]{1,40}", b in "[a-z0-9.-]{1,40}") {
            prop_assume!(a != b);
            prop_assert_ne!(path_from_host(&a), path_from_host(&b));
        }
    }
}
