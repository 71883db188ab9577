//! Login and solver secrets.
//!
//! The flow asks for three logical keys ([`EMAIL`], [`PASSWORD`],
//! [`CAPTCHA_API_KEY`]); the configured backend maps them to wherever the
//! operator keeps them.
//!
//! ```toml
//! [credentials]
//! backend = "pass"
//! path = "web/portal"
//!
//! [credentials.fields]
//! email = "login"
//! captcha_api_key = "2captcha"
//! ```

mod config;
mod env;
mod pass;

pub use config::CredentialConfig;
pub use env::{EnvConfig, EnvCredentialStore};
pub use pass::{PassConfig, PassCredentialStore};

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

pub const EMAIL: &str = "email";
pub const PASSWORD: &str = "password";
pub const CAPTCHA_API_KEY: &str = "captcha_api_key";

/// Read-only source of secrets, keyed by logical name.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when the backend has no value for `key`.
    async fn get(&self, key: &str) -> Result<Option<SecretString>>;

    /// Like [`get`](Self::get), but a missing key is an error.
    async fn require(&self, key: &str) -> Result<SecretString> {
        self.get(key)
            .await?
            .filter(|v| !v.expose_secret().trim().is_empty())
            .with_context(|| format!("credential '{key}' is not set"))
    }
}

/// Account login credentials.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub async fn load(store: &dyn CredentialStore) -> Result<Self> {
        let email = store.require(EMAIL).await?;
        let password = store.require(PASSWORD).await?;
        Ok(Self {
            email: email.expose_secret().trim().to_string(),
            password,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}
