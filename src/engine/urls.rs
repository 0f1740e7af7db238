use sha2::{Digest, Sha256};
use std::net::IpAddr;
use url::{Host, Url};

use crate::error::{ApiError, ErrorCode};

/// Query keys dropped during normalization.
const TRACKING_PREFIXES: &[&str] = &["utm_", "mc_"];
const TRACKING_KEYS: &[&str] = &["fbclid", "gclid", "ref", "source"];

pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn sha256_hex_bytes(value: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value);
    hex::encode(hasher.finalize())
}

/// Canonicalize a URL. This form is used everywhere a URL is keyed, compared,
/// or persisted.
///
/// Rules, in order: resolve against `base`; lowercase scheme/host; strip a
/// leading `www.`; drop the default port; drop the fragment; drop tracking
/// query keys; sort the remaining query pairs by key; collapse a trailing
/// slash on non-root paths.
pub fn normalize(raw: &str, base: Option<&Url>) -> Option<String> {
    let mut url = match base {
        Some(b) => b.join(raw).ok()?,
        None => Url::parse(raw).ok()?,
    };

    url.set_fragment(None);

    // The url crate already lowercases scheme and host and omits default
    // ports; the remaining rules are ours.
    let stripped = url
        .host_str()
        .and_then(|h| h.strip_prefix("www."))
        .map(|h| h.to_string());
    if let Some(host) = stripped {
        url.set_host(Some(&host)).ok()?;
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.retain(|(k, _)| !is_tracking_key(k));
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let query = pairs
            .iter()
            .fold(
                url::form_urlencoded::Serializer::new(String::new()),
                |mut ser, (k, v)| {
                    ser.append_pair(k, v);
                    ser
                },
            )
            .finish();
        url.set_query(Some(&query));
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(&path[..path.len() - 1]);
    }

    Some(url.to_string())
}

/// `SHA256(normalize(url))` — the identity of a Page row.
pub fn url_hash(normalized_url: &str) -> String {
    sha256_hex(normalized_url)
}

fn is_tracking_key(key: &str) -> bool {
    let lk = key.to_ascii_lowercase();
    TRACKING_KEYS.contains(&lk.as_str())
        || TRACKING_PREFIXES.iter().any(|p| lk.starts_with(p))
}

/// SSRF guard. Must run before every outbound fetch and before enqueuing any
/// job whose target is user-supplied.
///
/// Literal IPs are checked directly; hostnames are resolved and every A/AAAA
/// answer is checked, so a public name pointing at a private address is still
/// rejected.
pub async fn validate_ssrf(raw: &str) -> Result<(), ApiError> {
    let url = Url::parse(raw)
        .map_err(|_| ApiError::validation("URL must start with http:// or https://"))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::new(
            ErrorCode::SsrfBlocked,
            format!("Scheme '{}' is not allowed", url.scheme()),
        ));
    }

    let host = match url.host() {
        Some(h) => h,
        None => return Err(ApiError::validation("URL must include a hostname")),
    };

    match host {
        Host::Ipv4(ip) => check_ip(IpAddr::V4(ip)),
        Host::Ipv6(ip) => check_ip(IpAddr::V6(ip)),
        Host::Domain(domain) => {
            let addrs = tokio::net::lookup_host((domain, 80)).await.map_err(|_| {
                ApiError::new(
                    ErrorCode::DnsResolutionFailed,
                    "Could not resolve hostname. Check the URL and try again.",
                )
            })?;
            for addr in addrs {
                check_ip(addr.ip())?;
            }
            Ok(())
        }
    }
}

fn check_ip(ip: IpAddr) -> Result<(), ApiError> {
    if is_blocked_ip(ip) {
        return Err(ApiError::new(
            ErrorCode::SsrfBlocked,
            "URL resolves to a blocked IP range",
        ));
    }
    Ok(())
}

/// Blocked ranges: 10/8, 172.16/12, 192.168/16, 127/8, 169.254/16, ::1,
/// fc00::/7, and IPv4-mapped forms thereof.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || o[0] == 127
                || (o[0] == 169 && o[1] == 254)
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                return true;
            }
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_ip(IpAddr::V4(mapped));
            }
            // fc00::/7 (unique local)
            v6.octets()[0] & 0xfe == 0xfc
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_full_example() {
        let got = normalize("HTTP://Www.Example.COM:80/a/b/?utm_source=x&q=1#frag", None).unwrap();
        assert_eq!(got, "http://example.com/a/b?q=1");
    }

    #[test]
    fn test_normalize_idempotent() {
        let cases = [
            "https://www.example.com/path/?b=2&a=1",
            "http://example.com",
            "https://example.com/a?utm_campaign=x",
            "https://example.com:8443/x/",
        ];
        for raw in cases {
            let once = normalize(raw, None).unwrap();
            let twice = normalize(&once, None).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn test_normalize_query_order_independent() {
        let a = normalize("https://example.com/p?a=1&utm_x=2&b=3", None).unwrap();
        let b = normalize("https://example.com/p?b=3&a=1", None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalize_drops_tracking_keys() {
        let got = normalize(
            "https://example.com/p?fbclid=1&gclid=2&ref=x&source=y&mc_cid=z&keep=1",
            None,
        )
        .unwrap();
        assert_eq!(got, "https://example.com/p?keep=1");
    }

    #[test]
    fn test_normalize_relative_against_base() {
        let base = Url::parse("https://example.com/dir/page").unwrap();
        let got = normalize("../other", Some(&base)).unwrap();
        assert_eq!(got, "https://example.com/other");
    }

    #[test]
    fn test_normalize_keeps_root_slash() {
        assert_eq!(
            normalize("https://example.com/", None).unwrap(),
            "https://example.com/"
        );
    }

    #[test]
    fn test_normalize_default_port_dropped() {
        assert_eq!(
            normalize("https://example.com:443/x", None).unwrap(),
            "https://example.com/x"
        );
        // Non-default port survives.
        assert_eq!(
            normalize("https://example.com:8443/x", None).unwrap(),
            "https://example.com:8443/x"
        );
    }

    #[test]
    fn test_url_hash_depends_on_normalized_form() {
        let a = normalize("https://www.example.com/a/", None).unwrap();
        let b = normalize("https://example.com/a", None).unwrap();
        assert_eq!(url_hash(&a), url_hash(&b));
        assert_eq!(url_hash(&a).len(), 64);
    }

    #[test]
    fn test_blocked_ranges() {
        for ip in [
            "10.0.0.1",
            "10.255.255.255",
            "172.16.0.1",
            "172.31.4.4",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.10.10",
        ] {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip} should block");
        }
        for ip in ["8.8.8.8", "1.1.1.1", "172.15.0.1", "172.32.0.1", "11.0.0.1"] {
            assert!(!is_blocked_ip(ip.parse().unwrap()), "{ip} should pass");
        }
        assert!(is_blocked_ip("::1".parse().unwrap()));
        assert!(is_blocked_ip("fc00::1".parse().unwrap()));
        assert!(is_blocked_ip("fdab::1".parse().unwrap()));
        assert!(!is_blocked_ip("2001:4860:4860::8888".parse().unwrap()));
        // IPv4-mapped private address
        assert!(is_blocked_ip("::ffff:192.168.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_ssrf_literal_ip_blocked() {
        let err = validate_ssrf("http://127.0.0.1/").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SsrfBlocked);

        let err = validate_ssrf("http://10.1.2.3/x").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SsrfBlocked);

        let err = validate_ssrf("http://[::1]/").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SsrfBlocked);
    }

    #[tokio::test]
    async fn test_ssrf_scheme_blocked() {
        let err = validate_ssrf("file:///etc/passwd").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SsrfBlocked);

        let err = validate_ssrf("ftp://example.com/x").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SsrfBlocked);
    }

    #[tokio::test]
    async fn test_ssrf_public_literal_allowed() {
        assert!(validate_ssrf("http://1.1.1.1/").await.is_ok());
    }
}
