//! Application secrets, delivered as a `key=base64(value)` comma list in
//! the companion environment variable.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("malformed secret entry {0:?}")]
    Malformed(String),
    #[error("secret value for {0:?} is not valid base64")]
    Base64(String),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Secrets {
    values: HashMap<String, Vec<u8>>,
}

impl Secrets {
    pub fn parse(raw: &str) -> Result<Self, SecretError> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let mut values = HashMap::new();
        for entry in raw.split(',') {
            if entry.is_empty() {
                continue;
            }
            let (key, encoded) = entry
                .split_once('=')
                .ok_or_else(|| SecretError::Malformed(entry.to_string()))?;
            let value = STANDARD
                .decode(encoded)
                .map_err(|_| SecretError::Base64(key.to_string()))?;
            values.insert(key.to_string(), value);
        }
        Ok(Secrets { values })
    }

    pub fn from_env() -> Result<Self, SecretError> {
        match std::env::var(crate::config::APP_SECRETS_ENV) {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Ok(Secrets::default()),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(|v| v.as_slice())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    #[test]
    fn parses_comma_list() {
        let raw = format!(
            "DB_PASS={},API_TOKEN={}",
            STANDARD.encode("hunter2"),
            STANDARD.encode("tok-123")
        );
        let secrets = Secrets::parse(&raw).unwrap();
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets.get_str("DB_PASS"), Some("hunter2"));
        assert_eq!(secrets.get_str("API_TOKEN"), Some("tok-123"));
        assert_eq!(secrets.get("MISSING"), None);
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(Secrets::parse("").unwrap().is_empty());
    }

    #[test]
    fn malformed_entries_fail() {
        assert_eq!(
            Secrets::parse("no-equals-sign"),
            Err(SecretError::Malformed("no-equals-sign".into()))
        );
        assert_eq!(
            Secrets::parse("KEY=!!!"),
            Err(SecretError::Base64("KEY".into()))
        );
    }
}
