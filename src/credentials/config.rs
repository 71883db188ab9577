//! Credential backend selection, the `[credentials]` table of the config file.

use serde::{Deserialize, Serialize};

use super::env::{EnvConfig, EnvCredentialStore};
use super::pass::{PassConfig, PassCredentialStore};
use super::CredentialStore;

/// Which backend holds the secrets.
///
/// ```toml
/// [credentials]
/// backend = "env"
///
/// [credentials.vars]
/// email = "PORTAL_EMAIL"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CredentialConfig {
    /// Environment variables.
    Env {
        #[serde(flatten)]
        config: EnvConfig,
    },
    /// Password-store (pass) entry.
    Pass {
        #[serde(flatten)]
        config: PassConfig,
    },
}

impl Default for CredentialConfig {
    fn default() -> Self {
        CredentialConfig::Env {
            config: EnvConfig::default(),
        }
    }
}

impl CredentialConfig {
    pub fn build(&self) -> Box<dyn CredentialStore> {
        match self {
            CredentialConfig::Env { config } => Box::new(EnvCredentialStore::new(config.clone())),
            CredentialConfig::Pass { config } => Box::new(PassCredentialStore::new(config.clone())),
        }
    }
}
