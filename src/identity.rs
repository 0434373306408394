//! Identity verification collaborator.
//!
//! Exchanges a bearer token for the caller's identity, the Rust analogue
//! of the original's Firebase `verify_id_token` call. Real deployments
//! inject an implementation backed by whichever identity provider issues
//! the platform's tokens; [`MockVerifier`] accepts any non-empty token
//! unconditionally, for local/offline operation and tests.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct Identity {
    pub external_id: String,
    pub email: String,
    pub name: String,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, String>;
}

/// Accepts any non-empty bearer token, deriving a stable identity from the
/// token text itself rather than consulting a real backend.
pub struct MockVerifier;

#[async_trait]
impl IdentityVerifier for MockVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, String> {
        if token.trim().is_empty() {
            return Err("missing bearer token".to_string());
        }
        Ok(Identity {
            external_id: token.to_string(),
            email: format!("{token}@local.invalid"),
            name: token.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_verifier_rejects_empty_token() {
        let err = MockVerifier.verify("").await.unwrap_err();
        assert!(err.contains("missing"));
    }

    #[tokio::test]
    async fn mock_verifier_accepts_any_nonempty_token() {
        let identity = MockVerifier.verify("tok-123").await.unwrap();
        assert_eq!(identity.external_id, "tok-123");
    }
}
