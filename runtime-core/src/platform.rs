//! Authentication between the runtime and the platform: outbound trace
//! flushes are signed, and inbound requests carrying a valid signature
//! are trusted with access to private endpoints.
//!
//! The scheme is HMAC-SHA256 over `"<RFC1123 date>\0<URL path>"`. The
//! 4-byte big-endian key id is prefixed to the mac and the whole value is
//! base64-encoded into the `X-Encore-Auth` header, with the signing date
//! carried in the `Date` header.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const AUTH_HEADER: &str = "X-Encore-Auth";
pub const DATE_HEADER: &str = "Date";

/// Receivers reject signatures whose date strays further than this from
/// their own clock.
pub const MAX_CLOCK_SKEW: chrono::Duration = chrono::Duration::minutes(15);

/// An application auth key as configured by the platform.
#[derive(Debug, Clone)]
pub struct AuthKey {
    pub kid: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("missing auth header")]
    MissingHeader,
    #[error("malformed auth header")]
    Malformed,
    #[error("unknown key id {0}")]
    UnknownKey(u32),
    #[error("date header outside allowed skew")]
    SkewExceeded,
    #[error("signature mismatch")]
    Mismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("no auth keys configured")]
    NoKeys,
    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
}

/// Formats `t` as an RFC1123 HTTP date (`Mon, 02 Jan 2006 15:04:05 GMT`).
pub fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, "%a, %d %b %Y %H:%M:%S GMT")
        .ok()
        .map(|naive| naive.and_utc())
}

fn mac_bytes(key: &AuthKey, date: &str, path: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(&key.data).expect("hmac accepts any key length");
    mac.update(date.as_bytes());
    mac.update(&[0x00]);
    mac.update(path.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Signs outgoing platform requests and verifies incoming ones.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    keys: Vec<AuthKey>,
}

impl RequestValidator {
    pub fn new(keys: Vec<AuthKey>) -> Self {
        RequestValidator { keys }
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }

    fn signing_key(&self) -> Option<&AuthKey> {
        // The highest key id is the most recently issued key.
        self.keys.iter().max_by_key(|k| k.kid)
    }

    fn key_by_id(&self, kid: u32) -> Option<&AuthKey> {
        self.keys.iter().find(|k| k.kid == kid)
    }

    /// The `X-Encore-Auth` value for `path` signed at `date`: 36 bytes
    /// (4-byte big-endian key id followed by the 32-byte mac), base64.
    pub fn sign(&self, date: &str, path: &str) -> Result<String, SignError> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let key = self.signing_key().ok_or(SignError::NoKeys)?;
        let mut out = Vec::with_capacity(36);
        out.extend_from_slice(&key.kid.to_be_bytes());
        out.extend_from_slice(&mac_bytes(key, date, path));
        Ok(STANDARD.encode(out))
    }

    /// Adds `Date` and `X-Encore-Auth` headers to an outbound request.
    pub fn sign_outgoing_request(&self, req: &mut reqwest::Request) -> Result<(), SignError> {
        let date = http_date(Utc::now());
        let auth = self.sign(&date, req.url().path())?;
        let headers = req.headers_mut();
        headers.insert(DATE_HEADER, date.parse()?);
        headers.insert(AUTH_HEADER, auth.parse()?);
        Ok(())
    }

    /// Verifies a signature produced by [`sign`](Self::sign), including
    /// the clock-skew window around `now`.
    pub fn verify(
        &self,
        date: &str,
        path: &str,
        auth_header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), VerifyError> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let raw = STANDARD.decode(auth_header).map_err(|_| VerifyError::Malformed)?;
        if raw.len() != 36 {
            return Err(VerifyError::Malformed);
        }
        let kid = u32::from_be_bytes(raw[..4].try_into().expect("4 bytes"));
        let key = self.key_by_id(kid).ok_or(VerifyError::UnknownKey(kid))?;

        let signed_at = parse_http_date(date).ok_or(VerifyError::Malformed)?;
        if (now - signed_at).abs() > MAX_CLOCK_SKEW {
            return Err(VerifyError::SkewExceeded);
        }

        let mut mac = HmacSha256::new_from_slice(&key.data).expect("hmac accepts any key length");
        mac.update(date.as_bytes());
        mac.update(&[0x00]);
        mac.update(path.as_bytes());
        mac.verify_slice(&raw[4..]).map_err(|_| VerifyError::Mismatch)
    }

    /// Whether an inbound request carries a valid platform signature; such
    /// requests are routed through the private router.
    pub fn incoming_is_platform(&self, headers: &http::HeaderMap, path: &str) -> bool {
        let auth = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok());
        let date = headers.get(DATE_HEADER).and_then(|v| v.to_str().ok());
        match (auth, date) {
            (Some(auth), Some(date)) => self.verify(date, path, auth, Utc::now()).is_ok(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn validator() -> RequestValidator {
        RequestValidator::new(vec![
            AuthKey {
                kid: 1,
                data: b"old-key".to_vec(),
            },
            AuthKey {
                kid: 42,
                data: b"test-signing-key".to_vec(),
            },
        ])
    }

    #[test]
    fn http_date_format() {
        let t = DateTime::parse_from_rfc3339("2006-01-02T15:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(http_date(t), "Mon, 02 Jan 2006 15:04:05 GMT");
        assert_eq!(parse_http_date("Mon, 02 Jan 2006 15:04:05 GMT"), Some(t));
    }

    #[test]
    fn signature_layout() {
        let v = validator();
        let date = "Mon, 02 Jan 2006 15:04:05 GMT";
        let sig = v.sign(date, "/trace").unwrap();

        let raw = STANDARD.decode(&sig).unwrap();
        assert_eq!(raw.len(), 36);
        // Signed with the newest key, id big-endian.
        assert_eq!(&raw[..4], &42u32.to_be_bytes());

        // The mac covers "<date>\0<path>" under that key.
        let mut mac = HmacSha256::new_from_slice(b"test-signing-key").unwrap();
        mac.update(date.as_bytes());
        mac.update(&[0x00]);
        mac.update(b"/trace");
        assert_eq!(&raw[4..], mac.finalize().into_bytes().as_slice());

        // Signing is deterministic for a fixed date.
        assert_eq!(v.sign(date, "/trace").unwrap(), sig);
    }

    #[test]
    fn verify_round_trip() {
        let v = validator();
        let now = Utc::now();
        let date = http_date(now);
        let sig = v.sign(&date, "/trace").unwrap();
        assert_eq!(v.verify(&date, "/trace", &sig, now), Ok(()));

        // Wrong path fails.
        assert_eq!(
            v.verify(&date, "/other", &sig, now),
            Err(VerifyError::Mismatch)
        );

        // Tampered signature fails.
        let mut raw = STANDARD.decode(&sig).unwrap();
        raw[35] ^= 0xff;
        assert_eq!(
            v.verify(&date, "/trace", &STANDARD.encode(raw), now),
            Err(VerifyError::Mismatch)
        );
    }

    #[test]
    fn skew_beyond_fifteen_minutes_is_rejected() {
        let v = validator();
        let now = Utc::now();
        let date = http_date(now);
        let sig = v.sign(&date, "/trace").unwrap();

        let skewed = now + chrono::Duration::minutes(16);
        assert_eq!(
            v.verify(&date, "/trace", &sig, skewed),
            Err(VerifyError::SkewExceeded)
        );
        let within = now + chrono::Duration::minutes(14);
        assert_eq!(v.verify(&date, "/trace", &sig, within), Ok(()));
    }

    #[test]
    fn unknown_key_id_is_rejected() {
        let v = validator();
        let other = RequestValidator::new(vec![AuthKey {
            kid: 9,
            data: b"other".to_vec(),
        }]);
        let now = Utc::now();
        let date = http_date(now);
        let sig = other.sign(&date, "/trace").unwrap();
        assert_eq!(
            v.verify(&date, "/trace", &sig, now),
            Err(VerifyError::UnknownKey(9))
        );
    }
}
