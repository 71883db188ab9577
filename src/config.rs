use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};

use crate::browser::UrlPattern;
use crate::credentials::CredentialConfig;
use crate::duration::{deserialize_duration, serialize_duration};
use crate::strategy::{FieldStrategy, SiteKeyStrategy, StrategyChain, TokenScan};

fn default_login_url() -> String {
    "https://app.example.com/login".to_string()
}

fn default_authenticated_pattern() -> UrlPattern {
    UrlPattern::Contains("/home".to_string())
}

fn default_true() -> bool {
    true
}

/// Safety buffer before expiry (10 minutes).
fn default_renewal_margin() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Lifetime assumed for tokens without a readable expiry (5 hours).
fn default_fallback_lifetime() -> Duration {
    Duration::from_secs(5 * 60 * 60)
}

fn serialize_pattern<S: Serializer>(pattern: &UrlPattern, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(pattern)
}

/// Per-step time budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Loading the login page.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub navigation: Duration,

    /// Waiting for the solving service.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub challenge: Duration,

    /// Waiting for the authenticated page after each submit.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub redirect: Duration,

    /// The whole automated login, browser launch to token.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub login: Duration,

    /// How long a human gets in manual mode.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub manual_login: Duration,

    /// Pause after navigation and injection so page scripts can react.
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub settle: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            navigation: Duration::from_secs(60),
            challenge: Duration::from_secs(120),
            redirect: Duration::from_secs(30),
            login: Duration::from_secs(5 * 60),
            manual_login: Duration::from_secs(5 * 60),
            settle: Duration::from_secs(2),
        }
    }
}

/// Challenge-solving service settings. The API key comes from the credential backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub base_url: String,

    /// Challenge type sent to the service.
    pub method: String,

    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub poll_interval: Duration,

    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub request_timeout: Duration,

    /// Refuse to start a login when the balance is below this.
    pub min_balance: Decimal,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            base_url: "https://2captcha.com".to_string(),
            method: "turnstile".to_string(),
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            min_balance: Decimal::new(3, 3),
        }
    }
}

/// Fallback selector chains for the login page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub email: StrategyChain<FieldStrategy>,
    pub password: StrategyChain<FieldStrategy>,
    pub submit: StrategyChain<FieldStrategy>,
    /// Hidden inputs that receive the solved challenge value.
    pub challenge_response_fields: Vec<String>,
    pub site_key: StrategyChain<SiteKeyStrategy>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            email: FieldStrategy::chain([
                r#"input[type="email"]"#,
                r#"input[name="email"]"#,
                r#"input[placeholder*="mail" i]"#,
                "#email",
            ]),
            password: FieldStrategy::chain([
                r#"input[type="password"]"#,
                r#"input[name="password"]"#,
                r#"input[name="senha"]"#,
            ]),
            submit: FieldStrategy::chain([r#"button[type="submit"]"#, r#"input[type="submit"]"#]),
            challenge_response_fields: vec![
                r#"input[name="cf-turnstile-response"]"#.to_string(),
                r#"input[name="g-recaptcha-response"]"#.to_string(),
            ],
            site_key: SiteKeyStrategy::default_chain(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub login_url: String,

    /// Location that means the login went through.
    #[serde(
        default = "default_authenticated_pattern",
        serialize_with = "serialize_pattern"
    )]
    pub authenticated_url_pattern: UrlPattern,

    /// Token cache file. Relative paths resolve from the config file's directory;
    /// unset means the user cache directory.
    pub cache_path: Option<PathBuf>,

    /// Persistent browser profile directory.
    pub profile_dir: Option<PathBuf>,

    /// Explicit Chrome/Chromium binary.
    pub chrome_executable: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(
        default = "default_renewal_margin",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub renewal_margin: Duration,

    #[serde(
        default = "default_fallback_lifetime",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub fallback_lifetime: Duration,

    pub timeouts: TimeoutConfig,
    pub solver: SolverConfig,
    pub credentials: CredentialConfig,
    pub selectors: SelectorConfig,
    pub token_scan: TokenScan,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            authenticated_url_pattern: default_authenticated_pattern(),
            cache_path: None,
            profile_dir: None,
            chrome_executable: None,
            headless: true,
            renewal_margin: default_renewal_margin(),
            fallback_lifetime: default_fallback_lifetime(),
            timeouts: TimeoutConfig::default(),
            solver: SolverConfig::default(),
            credentials: CredentialConfig::default(),
            selectors: SelectorConfig::default(),
            token_scan: TokenScan::default(),
        }
    }
}

/// `tokenwarden.toml` in the working directory if present, otherwise the
/// user config directory.
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("tokenwarden.toml");
    if local_config.exists() {
        return local_config;
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("tokenwarden").join("config.toml");
    }

    local_config
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Make relative paths relative to `config_dir`.
    pub fn resolve_paths(&mut self, config_dir: &Path) {
        for path in [&mut self.cache_path, &mut self.profile_dir].into_iter().flatten() {
            if path.is_relative() {
                *path = config_dir.join(&*path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.renewal_margin, Duration::from_secs(600));
        assert_eq!(config.fallback_lifetime, Duration::from_secs(5 * 3600));
        assert_eq!(config.solver.poll_interval, Duration::from_secs(5));
        assert_eq!(config.solver.min_balance, Decimal::new(3, 3));
        assert_eq!(config.selectors.site_key.entries().len(), 4);
        assert!(config.headless);
        assert!(config.authenticated_url_pattern.matches("https://app.example.com/home"));
    }

    #[test]
    fn parses_partial_file_and_resolves_paths() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("tokenwarden.toml");
        std::fs::write(
            &path,
            r##"
login_url = "https://portal.example.org/entrar"
authenticated_url_pattern = "re:/(home|dashboard)"
cache_path = "state/token.json"
renewal_margin = "15m"
headless = false

[timeouts]
redirect = "45s"

[solver]
min_balance = "0.01"
poll_interval = "2s"

[selectors]
email = ["#login-email"]
"##,
        )?;

        let config = Config::load(&path)?;
        assert_eq!(config.login_url, "https://portal.example.org/entrar");
        assert!(config.authenticated_url_pattern.matches("https://portal.example.org/dashboard"));
        assert_eq!(config.cache_path, Some(dir.path().join("state/token.json")));
        assert_eq!(config.renewal_margin, Duration::from_secs(900));
        assert_eq!(config.fallback_lifetime, Duration::from_secs(5 * 3600));
        assert!(!config.headless);
        assert_eq!(config.timeouts.redirect, Duration::from_secs(45));
        assert_eq!(config.timeouts.challenge, Duration::from_secs(120));
        assert_eq!(config.solver.min_balance, Decimal::new(1, 2));
        assert_eq!(config.solver.poll_interval, Duration::from_secs(2));
        assert_eq!(config.selectors.email.entries().len(), 1);
        assert_eq!(config.selectors.email.entries()[0].name(), "selector #login-email");
        assert_eq!(config.selectors.password.entries().len(), 3);
        Ok(())
    }

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let config = Config::load_or_default(&dir.path().join("absent.toml"))?;
        assert_eq!(config.login_url, default_login_url());
        Ok(())
    }

    #[test]
    fn bad_duration_is_reported() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, r#"renewal_margin = "ten minutes""#)?;
        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("renewal_margin") || format!("{err:#}").contains("duration"));
        Ok(())
    }
}
