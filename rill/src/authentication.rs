//! The authentication seam.
//!
//! When STARTUP is answered with AUTHENTICATE, the connection runs a SASL
//! token exchange driven by the [`Authenticator`] configured on it. The
//! exchange is opaque to the connection: it ships the initial token, answers
//! each challenge with whatever the authenticator produces, and finishes when
//! the server reports success.
//!
//! The trait is deliberately stateless and shared across connection attempts;
//! multi-step schemes that need per-exchange state (nonces, proofs) keep it
//! behind interior mutability, keyed by whatever the scheme itself uses to
//! correlate rounds. A password implementation for the server's stock
//! `PasswordAuthenticator` class is bundled.

use async_trait::async_trait;

/// An authentication error message.
pub type AuthError = String;

/// Client side of the SASL exchange.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// The first token to send, given the authenticator class the server
    /// announced. `None` sends a null token.
    async fn initial_token(
        &self,
        authenticator_name: &str,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// The token answering a server challenge.
    async fn respond_to_challenge(
        &self,
        challenge: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Inspects the token attached to the server's success message.
    /// Accepts unconditionally unless overridden.
    async fn verify_success(&self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Username/password authentication, speaking SASL PLAIN as expected by the
/// server's `PasswordAuthenticator`.
pub struct PasswordAuthenticator {
    username: String,
    password: String,
}

impl PasswordAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PasswordAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The PLAIN token: authzid (empty), authcid and password, NUL-separated.
    fn plain_token(&self) -> Vec<u8> {
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        token
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    async fn initial_token(
        &self,
        _authenticator_name: &str,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Ok(Some(self.plain_token()))
    }

    async fn respond_to_challenge(
        &self,
        _challenge: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("password authentication expects no challenges".to_string())
    }
}
