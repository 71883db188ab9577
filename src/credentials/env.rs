//! Environment-variable credential backend.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::CredentialStore;

/// Maps logical keys to variable names. Unmapped keys use `TOKENWARDEN_<KEY>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

impl EnvConfig {
    pub fn var_name(&self, key: &str) -> String {
        match self.vars.get(key) {
            Some(name) => name.clone(),
            None => format!("TOKENWARDEN_{}", key.to_ascii_uppercase()),
        }
    }
}

pub struct EnvCredentialStore {
    config: EnvConfig,
}

impl EnvCredentialStore {
    pub fn new(config: EnvConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<SecretString>> {
        match std::env::var(self.config.var_name(key)) {
            Ok(value) => Ok(Some(SecretString::from(value))),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(anyhow::anyhow!(
                "{} is not valid unicode: {e}",
                self.config.var_name(key)
            )),
        }
    }
}
