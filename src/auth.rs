//! Credential acquisition for session start and reconnect.
//!
//! The issuer is a seam: the session controller asks it for a short-lived
//! connection credential on every connect attempt and treats failure as
//! fatal to that attempt.

use crate::protocol::{LiveError, Result};

/// A short-lived connection credential.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// Supplies a connection credential on demand.
pub trait CredentialIssuer: Send + Sync {
    fn issue(&self) -> Result<Credential>;
}

/// Reads the credential from an environment variable at each connect.
pub struct EnvCredentialIssuer {
    var: String,
}

impl EnvCredentialIssuer {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialIssuer for EnvCredentialIssuer {
    fn issue(&self) -> Result<Credential> {
        match std::env::var(&self.var) {
            Ok(key) if !key.is_empty() => Ok(Credential::new(key)),
            _ => Err(LiveError::Credential(format!(
                "environment variable {} is not set",
                self.var
            ))),
        }
    }
}

/// A fixed credential, for callers that manage issuance themselves.
pub struct StaticCredentialIssuer(Credential);

impl StaticCredentialIssuer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Credential::new(secret))
    }
}

impl CredentialIssuer for StaticCredentialIssuer {
    fn issue(&self) -> Result<Credential> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_issuer_fails_loudly_when_unset() {
        let issuer = EnvCredentialIssuer::new("VOXLIVE_TEST_MISSING_KEY");
        assert!(matches!(issuer.issue(), Err(LiveError::Credential(_))));
    }

    #[test]
    fn static_issuer_returns_its_credential() {
        let issuer = StaticCredentialIssuer::new("k");
        assert_eq!(issuer.issue().unwrap().secret(), "k");
    }
}
