//! OriginValidator: deny-by-default `Origin` header check for WebSocket
//! upgrades (§4.2).

/// Validates a client-supplied `Origin` header against a configured
/// allow-list. Deny-by-default: missing, malformed, or unlisted origins are
/// rejected; only an exact scheme+host match against `allowed_origins`
/// passes, with an additional loopback allowance in development mode.
pub struct OriginValidator {
    allowed: Vec<AllowedOrigin>,
    allow_loopback: bool,
}

struct AllowedOrigin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl OriginValidator {
    pub fn new(allowed_origins: &[String], development_mode: bool) -> Self {
        let allowed = allowed_origins
            .iter()
            .filter_map(|raw| parse_origin(raw))
            .collect();
        Self {
            allowed,
            allow_loopback: development_mode,
        }
    }

    /// `true` if `origin` is present, well-formed, free of control
    /// characters, and matches the allow-list (or is loopback in
    /// development mode).
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return false;
        };
        if origin.is_empty() {
            return false;
        }
        if contains_control_chars(origin) {
            return false;
        }

        let Some(parsed) = parse_origin(origin) else {
            return false;
        };

        if self.allow_loopback && is_loopback_host(&parsed.host) {
            return true;
        }

        self.allowed.iter().any(|candidate| {
            candidate.scheme == parsed.scheme
                && candidate.host == parsed.host
                && candidate.port == parsed.port
        })
    }
}

fn contains_control_chars(s: &str) -> bool {
    s.bytes().any(|b| b < 0x20 || b == 0x7f)
}

fn parse_origin(raw: &str) -> Option<AllowedOrigin> {
    let (scheme, rest) = raw.split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return None;
    }
    if rest.is_empty() || rest.contains('/') {
        return None;
    }

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => match port_str.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (rest, None),
        },
        _ => (rest, None),
    };

    if host.is_empty() {
        return None;
    }

    Some(AllowedOrigin {
        scheme,
        host: host.to_ascii_lowercase(),
        port,
    })
}

fn is_loopback_host(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(origins: &[&str], dev: bool) -> OriginValidator {
        OriginValidator::new(&origins.iter().map(|s| s.to_string()).collect::<Vec<_>>(), dev)
    }

    #[test]
    fn rejects_missing_origin() {
        let v = validator(&["http://example.com"], false);
        assert!(!v.is_allowed(None));
    }

    #[test]
    fn rejects_empty_origin() {
        let v = validator(&["http://example.com"], false);
        assert!(!v.is_allowed(Some("")));
    }

    #[test]
    fn accepts_exact_allow_listed_origin() {
        let v = validator(&["http://example.com"], false);
        assert!(v.is_allowed(Some("http://example.com")));
    }

    #[test]
    fn rejects_scheme_mismatch() {
        let v = validator(&["http://example.com"], false);
        assert!(!v.is_allowed(Some("https://example.com")));
    }

    #[test]
    fn rejects_port_mismatch() {
        let v = validator(&["http://example.com:8080"], false);
        assert!(!v.is_allowed(Some("http://example.com:9090")));
    }

    #[test]
    fn rejects_unlisted_subdomain() {
        let v = validator(&["http://example.com"], false);
        assert!(!v.is_allowed(Some("http://evil.example.com")));
    }

    #[test]
    fn rejects_control_characters() {
        let v = validator(&["http://example.com"], false);
        assert!(!v.is_allowed(Some("http://example.com\r\nX-Injected: 1")));
    }

    #[test]
    fn development_mode_allows_loopback_regardless_of_allow_list() {
        let v = validator(&[], true);
        assert!(v.is_allowed(Some("http://localhost:3000")));
        assert!(v.is_allowed(Some("http://127.0.0.1:5173")));
    }

    #[test]
    fn production_mode_rejects_loopback_unless_allow_listed() {
        let v = validator(&[], false);
        assert!(!v.is_allowed(Some("http://localhost:3000")));
    }

    #[test]
    fn rejects_malformed_origin() {
        let v = validator(&["http://example.com"], false);
        assert!(!v.is_allowed(Some("not-a-url")));
        assert!(!v.is_allowed(Some("http://example.com/path")));
    }
}
