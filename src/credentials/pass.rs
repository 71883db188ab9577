//! Password-store (pass) credential backend.
//!
//! The first line of the entry is the `password` key; later lines of the
//! form `name: value` provide the rest.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::CredentialStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassConfig {
    /// Entry path, e.g. "web/portal".
    pub path: String,

    /// Logical key to entry field name. Unmapped keys are looked up as-is.
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

pub struct PassCredentialStore {
    config: PassConfig,
}

impl PassCredentialStore {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }

    fn field_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.config.fields.get(key).map(String::as_str).unwrap_or(key)
    }

    async fn read_entry(&self) -> Result<PassEntry> {
        let output = Command::new("pass")
            .arg("show")
            .arg(&self.config.path)
            .output()
            .await
            .context("Failed to run pass command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("pass show {} failed: {}", self.config.path, stderr.trim());
        }

        let content = String::from_utf8(output.stdout).context("Invalid UTF-8 in pass output")?;
        Ok(PassEntry::parse(&content))
    }
}

#[async_trait]
impl CredentialStore for PassCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<SecretString>> {
        let entry = self.read_entry().await?;
        Ok(entry
            .fields
            .get(self.field_name(key))
            .map(|v| SecretString::from(v.clone())))
    }
}

#[derive(Debug, Default)]
struct PassEntry {
    fields: HashMap<String, String>,
}

impl PassEntry {
    fn parse(content: &str) -> Self {
        let mut lines = content.lines();
        let mut fields = HashMap::new();

        if let Some(first) = lines.next() {
            fields.insert("password".to_string(), first.to_string());
        }
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if !key.is_empty() && key != "password" {
                    fields.insert(key.to_string(), value.trim().to_string());
                }
            }
        }

        Self { fields }
    }
}
