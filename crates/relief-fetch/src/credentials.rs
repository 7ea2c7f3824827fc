//! API key lookup for keyed sources.

use crate::{FetchError, Result};
use std::collections::HashMap;

/// Supplies API keys by credential name.
pub trait CredentialProvider: Send + Sync {
    /// Return the key for `provider`, or [`FetchError::MissingCredential`].
    fn get_api_key(&self, provider: &str) -> Result<String>;
}

/// Reads keys from environment variables named after the credential.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn get_api_key(&self, provider: &str) -> Result<String> {
        match std::env::var(provider) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(FetchError::MissingCredential {
                provider: provider.to_string(),
            }),
        }
    }
}

/// Fixed in-memory keys.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<String, String>,
}

impl StaticCredentials {
    /// No keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key.
    pub fn with_key(mut self, provider: impl Into<String>, key: impl Into<String>) -> Self {
        self.keys.insert(provider.into(), key.into());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn get_api_key(&self, provider: &str) -> Result<String> {
        self.keys
            .get(provider)
            .cloned()
            .ok_or_else(|| FetchError::MissingCredential {
                provider: provider.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VAR: &str = "RELIEF_FETCH_TEST_API_KEY";

    #[test]
    #[serial]
    fn test_env_credentials() {
        std::env::remove_var(VAR);
        assert!(matches!(
            EnvCredentials.get_api_key(VAR),
            Err(FetchError::MissingCredential { provider }) if provider == VAR
        ));

        std::env::set_var(VAR, "  ");
        assert!(EnvCredentials.get_api_key(VAR).is_err());

        std::env::set_var(VAR, "abc123\n");
        assert_eq!(EnvCredentials.get_api_key(VAR).unwrap(), "abc123");
        std::env::remove_var(VAR);
    }

    #[test]
    fn test_static_credentials() {
        let creds = StaticCredentials::new().with_key("OPENTOPOGRAPHY_API_KEY", "k");
        assert_eq!(creds.get_api_key("OPENTOPOGRAPHY_API_KEY").unwrap(), "k");
        assert!(creds.get_api_key("OTHER").is_err());
    }
}
