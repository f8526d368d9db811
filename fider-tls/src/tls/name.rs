//! Server name handling for certificate selection
//!
//! All comparisons between a requested SNI name and configured or certified
//! names happen on the normalized form produced by [`normalize_server_name`].

use std::net::IpAddr;

/// Normalize a requested server name: lowercase, dots stripped at both ends.
pub fn normalize_server_name(name: &str) -> String {
    name.trim_matches('.').to_ascii_lowercase()
}

/// Whether a normalized name looks like a bare host (no SNI, `localhost`, an
/// IPv6 literal without dots, ...). Such names get the static certificate.
pub fn is_bare_name(name: &str) -> bool {
    name.is_empty() || !name.contains('.')
}

/// Whether `name` is the base domain itself or one of its subdomains.
///
/// Both arguments must already be normalized.
pub fn is_within_domain(name: &str, base_domain: &str) -> bool {
    if base_domain.is_empty() {
        return false;
    }
    match name.strip_suffix(base_domain) {
        Some("") => true,
        Some(prefix) => prefix.ends_with('.'),
        None => false,
    }
}

/// Match a certificate DNS name (possibly a wildcard) against a host.
///
/// A wildcard is only honoured as the complete left-most label and covers
/// exactly one non-empty label: `*.fider.io` matches `feedback.fider.io`
/// but neither `fider.io` nor `a.b.fider.io`.
pub fn dns_name_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    if pattern.is_empty() || host.is_empty() {
        return false;
    }

    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    let host_labels: Vec<&str> = host.split('.').collect();

    if pattern_labels.len() != host_labels.len() {
        return false;
    }

    pattern_labels
        .iter()
        .zip(host_labels.iter())
        .enumerate()
        .all(|(i, (p, h))| {
            if h.is_empty() {
                return false;
            }
            if i == 0 && *p == "*" {
                // "*.com" style patterns are too broad to honour
                return pattern_labels.len() > 2;
            }
            p == h
        })
}

/// Parse a host that is an IP literal, with or without IPv6 brackets.
pub fn parse_ip_host(host: &str) -> Option<IpAddr> {
    let trimmed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    trimmed.parse().ok()
}

/// Characters that can never appear in a name worth issuing a certificate for.
pub fn has_invalid_issuance_chars(name: &str) -> bool {
    name.chars()
        .any(|c| matches!(c, '+' | '/' | '\\' | ':' | '*') || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases_and_strips_dots() {
        assert_eq!(normalize_server_name("Example.COM."), "example.com");
        assert_eq!(normalize_server_name(".feedback.fider.io"), "feedback.fider.io");
        assert_eq!(normalize_server_name(""), "");
        assert_eq!(normalize_server_name("..."), "");
    }

    #[test]
    fn test_normalization_equivalence() {
        assert_eq!(
            normalize_server_name("Example.COM."),
            normalize_server_name("example.com")
        );
    }

    #[test]
    fn test_bare_names() {
        assert!(is_bare_name(""));
        assert!(is_bare_name("localhost"));
        assert!(!is_bare_name("example.com"));
        // IPv4 literals contain dots and are not bare
        assert!(!is_bare_name("10.0.0.1"));
    }

    #[test]
    fn test_is_within_domain() {
        assert!(is_within_domain("feedback.fider.io", "fider.io"));
        assert!(is_within_domain("fider.io", "fider.io"));
        assert!(is_within_domain("a.b.fider.io", "fider.io"));
        assert!(!is_within_domain("notfider.io", "fider.io"));
        assert!(!is_within_domain("customdomain.com", "fider.io"));
        assert!(!is_within_domain("fider.io", ""));
    }

    #[test]
    fn test_exact_dns_match_is_case_insensitive() {
        assert!(dns_name_matches("feedback.fider.io", "feedback.fider.io"));
        assert!(dns_name_matches("Feedback.Fider.IO", "feedback.fider.io"));
        assert!(dns_name_matches("feedback.fider.io.", "feedback.fider.io"));
        assert!(!dns_name_matches("feedback.fider.io", "other.fider.io"));
    }

    #[test]
    fn test_wildcard_covers_exactly_one_label() {
        assert!(dns_name_matches("*.fider.io", "feedback.fider.io"));
        assert!(!dns_name_matches("*.fider.io", "fider.io"));
        assert!(!dns_name_matches("*.fider.io", "a.b.fider.io"));
        assert!(!dns_name_matches("*.fider.io", ".fider.io"));
    }

    #[test]
    fn test_wildcard_only_in_leftmost_label() {
        assert!(!dns_name_matches("feedback.*.io", "feedback.fider.io"));
        assert!(!dns_name_matches("f*.fider.io", "feedback.fider.io"));
        assert!(!dns_name_matches("*.io", "fider.io"));
    }

    #[test]
    fn test_parse_ip_host() {
        assert_eq!(parse_ip_host("10.0.0.1"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(parse_ip_host("[::1]"), Some("::1".parse().unwrap()));
        assert_eq!(parse_ip_host("example.com"), None);
    }

    #[test]
    fn test_invalid_issuance_chars() {
        assert!(has_invalid_issuance_chars("a+b.com"));
        assert!(has_invalid_issuance_chars("a/b.com"));
        assert!(has_invalid_issuance_chars("a b.com"));
        assert!(has_invalid_issuance_chars("*.example.com"));
        assert!(!has_invalid_issuance_chars("customdomain.com"));
    }
}
