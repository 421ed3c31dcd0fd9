use crate::config::CorsConfig;
use http::header::{self, HeaderMap, HeaderValue};

/// CORS policy with two origin sets: exact-match origins that may send
/// credentials, and a (default `*`) set for credential-less requests.
#[derive(Debug, Clone, Default)]
pub struct Cors {
    disable_credentials: bool,
    allow_with_credentials: Vec<String>,
    /// `None` means unset, which allows any origin.
    allow_without_credentials: Option<Vec<String>>,
    extra_allowed_headers: Vec<String>,
}

impl Cors {
    pub fn from_config(cfg: Option<&CorsConfig>) -> Self {
        match cfg {
            Some(cfg) => Cors {
                disable_credentials: cfg.disable_credentials,
                allow_with_credentials: cfg.allow_origins_with_credentials.clone(),
                allow_without_credentials: cfg.allow_origins_without_credentials.clone(),
                extra_allowed_headers: cfg.raw_allowed_headers.clone(),
            },
            None => Cors::default(),
        }
    }

    /// Whether the request should be treated as carrying credentials: any
    /// cookie, an `Authorization` header, or a client TLS certificate.
    pub fn request_has_credentials(headers: &HeaderMap, has_client_cert: bool) -> bool {
        has_client_cert
            || headers.contains_key(header::COOKIE)
            || headers.contains_key(header::AUTHORIZATION)
    }

    /// Whether `origin` may make the request. Credentialed requests match
    /// the with-credentials list exactly; credential-less requests match
    /// the without-credentials list, which allows everything when unset
    /// or when it contains `*`.
    pub fn origin_allowed(&self, origin: &str, with_credentials: bool) -> bool {
        if with_credentials {
            if self.disable_credentials {
                return false;
            }
            return self.allow_with_credentials.iter().any(|o| o == origin);
        }
        match &self.allow_without_credentials {
            None => true,
            Some(list) => list.iter().any(|o| o == "*" || o == origin),
        }
    }

    /// Evaluates a request's Origin header; `None` means no CORS applies
    /// (same-origin or non-browser traffic). `Some(allowed)` says whether
    /// to accept.
    pub fn check(&self, headers: &HeaderMap, has_client_cert: bool) -> Option<bool> {
        let origin = headers.get(header::ORIGIN)?.to_str().ok()?;
        let creds = Self::request_has_credentials(headers, has_client_cert);
        Some(self.origin_allowed(origin, creds))
    }

    /// Response headers for an accepted cross-origin request.
    pub fn response_headers(&self, origin: &str, with_credentials: bool, out: &mut HeaderMap) {
        let allow_origin = if with_credentials || self.allow_without_credentials.is_some() {
            origin
        } else {
            "*"
        };
        if let Ok(value) = HeaderValue::from_str(allow_origin) {
            out.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        if with_credentials {
            out.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
            out.insert(header::VARY, HeaderValue::from_static("Origin"));
        }
    }

    /// Headers advertised on preflight responses.
    pub fn preflight_headers(&self, out: &mut HeaderMap) {
        out.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS"),
        );
        let mut allowed = vec!["Content-Type".to_string(), "Authorization".to_string()];
        allowed.extend(self.extra_allowed_headers.iter().cloned());
        if let Ok(value) = HeaderValue::from_str(&allowed.join(", ")) {
            out.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Cors {
        Cors {
            disable_credentials: false,
            allow_with_credentials: vec!["https://app.example.com".into()],
            allow_without_credentials: Some(vec!["https://cdn.example.com".into()]),
            extra_allowed_headers: vec![],
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn cookie_and_authorization_mean_credentials() {
        assert!(Cors::request_has_credentials(
            &headers(&[("cookie", "session=1")]),
            false
        ));
        assert!(Cors::request_has_credentials(
            &headers(&[("authorization", "Bearer x")]),
            false
        ));
        assert!(Cors::request_has_credentials(&headers(&[]), true));
        assert!(!Cors::request_has_credentials(&headers(&[]), false));
    }

    #[test]
    fn credentialed_requires_exact_origin() {
        let cors = policy();
        assert!(cors.origin_allowed("https://app.example.com", true));
        assert!(!cors.origin_allowed("https://cdn.example.com", true));
        assert!(!cors.origin_allowed("https://evil.example.com", true));
    }

    #[test]
    fn credential_less_matches_its_own_list() {
        let cors = policy();
        assert!(cors.origin_allowed("https://cdn.example.com", false));
        assert!(!cors.origin_allowed("https://app.example.com", false));
    }

    #[test]
    fn star_allows_any_credential_less_origin() {
        let mut cors = policy();
        cors.allow_without_credentials = Some(vec!["*".into()]);
        assert!(cors.origin_allowed("https://anything.example", false));
        // ...but never credentialed requests.
        assert!(!cors.origin_allowed("https://anything.example", true));
    }

    #[test]
    fn unset_list_defaults_to_star() {
        let cors = Cors::default();
        assert!(cors.origin_allowed("https://anything.example", false));
    }

    #[test]
    fn disable_credentials_blocks_all_credentialed() {
        let mut cors = policy();
        cors.disable_credentials = true;
        assert!(!cors.origin_allowed("https://app.example.com", true));
    }

    #[test]
    fn check_combines_origin_and_credentials() {
        let cors = policy();
        // Credentialed (cookie) from the credentialed origin: accepted.
        assert_eq!(
            cors.check(
                &headers(&[("origin", "https://app.example.com"), ("cookie", "s=1")]),
                false
            ),
            Some(true)
        );
        // Credentialed from the credential-less origin: rejected.
        assert_eq!(
            cors.check(
                &headers(&[("origin", "https://cdn.example.com"), ("cookie", "s=1")]),
                false
            ),
            Some(false)
        );
        // No origin header: CORS does not apply.
        assert_eq!(cors.check(&headers(&[("cookie", "s=1")]), false), None);
    }
}
