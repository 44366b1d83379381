//! Connection authentication.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::GatewayError;

/// Resolves a bearer token to the owner id it acts as.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<String, GatewayError>;
}

/// Fixed token table loaded from configuration.
pub struct TokenAuthenticator {
    tokens: Vec<(SecretString, String)>,
}

impl TokenAuthenticator {
    pub fn new(tokens: Vec<(SecretString, String)>) -> Self {
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<String, GatewayError> {
        if token.is_empty() {
            return Err(GatewayError::AuthFailed {
                reason: "empty token".to_string(),
            });
        }
        self.tokens
            .iter()
            .find(|(secret, _)| constant_time_eq(secret.expose_secret().as_bytes(), token.as_bytes()))
            .map(|(_, owner)| owner.clone())
            .ok_or_else(|| GatewayError::AuthFailed {
                reason: "unknown token".to_string(),
            })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> TokenAuthenticator {
        TokenAuthenticator::new(vec![
            (SecretString::from("tok-alice"), "alice".to_string()),
            (SecretString::from("tok-bob"), "bob".to_string()),
        ])
    }

    #[tokio::test]
    async fn known_token_maps_to_owner() {
        assert_eq!(auth().authenticate("tok-bob").await.unwrap(), "bob");
    }

    #[tokio::test]
    async fn unknown_or_empty_token_fails() {
        let err = auth().authenticate("tok-carol").await.unwrap_err();
        assert_eq!(err.code(), "auth_failed");
        assert!(!err.is_retryable());
        assert!(auth().authenticate("").await.is_err());
        assert!(auth().authenticate("tok-alic").await.is_err());
    }
}
