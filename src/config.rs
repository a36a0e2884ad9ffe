use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::auth::{self, Token};
use crate::error::PipelensError;

/// Configuration file structure for Pipelens.
///
/// Configuration files are loaded from the current directory or a specified path.
/// Values given on the command line or through the environment override the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Azure DevOps connection
    #[serde(default)]
    pub azure: AzureConfig,

    /// Query parameter bounds
    #[serde(default)]
    pub limits: Limits,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Outbound token bucket
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Upstream HTTP behaviour
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AzureConfig {
    /// Azure DevOps organization name
    pub organization: Option<String>,

    /// Azure DevOps project name
    pub project: Option<String>,

    /// Personal access token with Build (read) scope
    pub token: Option<String>,

    /// Azure DevOps base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// REST API version sent with every request
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

/// Defaults and upper bounds applied to client query parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Limits {
    pub default_days: usize,
    pub max_days: usize,
    pub default_top: usize,
    pub max_top: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Seconds a fetched build list stays fresh
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimitConfig {
    /// Maximum burst of outbound requests
    #[serde(default = "default_rate_limit_capacity")]
    pub capacity: u32,

    /// Tokens added back per second
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: f64,

    /// Longest a caller may wait for a token before failing
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Retries after the first attempt for throttled, unavailable or timed-out calls
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay; doubles on each further retry
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            organization: None,
            project: None,
            token: None,
            base_url: default_base_url(),
            api_version: default_api_version(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            default_days: 7,
            max_days: 365,
            default_top: 200,
            max_top: 1000,
            default_page_size: 50,
            max_page_size: 1000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_limit_capacity(),
            refill_per_second: default_refill_per_second(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_base_url() -> String {
    "https://dev.azure.com".to_string()
}

fn default_api_version() -> String {
    "7.1".to_string()
}

fn default_cache_ttl_seconds() -> u64 {
    60
}

fn default_rate_limit_capacity() -> u32 {
    60
}

fn default_refill_per_second() -> f64 {
    1.0
}

fn default_max_wait_ms() -> u64 {
    250
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

/// Fully resolved, validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub organization: String,
    pub project: String,
    pub token: Token,
    pub base_url: Url,
    pub api_version: String,
    pub limits: Limits,
    pub cache_ttl: Duration,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_second: f64,
    pub rate_limit_max_wait: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./pipelens.toml
    /// 3. ./pipelens.json
    /// 4. ./pipelens.yaml
    /// 5. ./pipelens.yml
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let candidates = ["pipelens.toml", "pipelens.json", "pipelens.yaml", "pipelens.yml"];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }

    /// Resolves the configuration into validated settings.
    ///
    /// The access token is checked here, once, so a bad credential stops the
    /// process before any request is served.
    ///
    /// # Errors
    ///
    /// Returns `PipelensError::Config` if organization, project or token are
    /// missing or malformed, or if a numeric bound is unusable.
    pub fn settings(&self) -> std::result::Result<Settings, PipelensError> {
        let organization = required(self.azure.organization.as_deref(), "organization (AZDO_ORG)")?;
        let project = required(self.azure.project.as_deref(), "project (AZDO_PROJECT)")?;
        let token = self.azure.token.as_deref().map(Token::from);
        let token = auth::validate(token.as_ref())?.clone();

        let base_url = Url::parse(&self.azure.base_url).map_err(|e| {
            PipelensError::Config(format!("Invalid base URL '{}': {e}", self.azure.base_url))
        })?;

        let limits = &self.limits;
        if limits.max_days == 0 || limits.max_top == 0 || limits.max_page_size == 0 {
            return Err(PipelensError::Config(
                "limits.max-days, max-top and max-page-size must be at least 1".into(),
            ));
        }
        if self.rate_limit.capacity == 0 || self.rate_limit.refill_per_second <= 0.0 {
            return Err(PipelensError::Config(
                "rate-limit.capacity and refill-per-second must be positive".into(),
            ));
        }

        Ok(Settings {
            organization,
            project,
            token,
            base_url,
            api_version: self.azure.api_version.clone(),
            limits: limits.clone(),
            cache_ttl: Duration::from_secs(self.cache.ttl_seconds),
            rate_limit_capacity: self.rate_limit.capacity,
            rate_limit_refill_per_second: self.rate_limit.refill_per_second,
            rate_limit_max_wait: Duration::from_millis(self.rate_limit.max_wait_ms),
            request_timeout: Duration::from_secs(self.http.timeout_seconds),
            max_retries: self.http.max_retries,
            retry_base_delay: Duration::from_millis(self.http.retry_base_delay_ms),
        })
    }
}

fn required(value: Option<&str>, name: &str) -> std::result::Result<String, PipelensError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| PipelensError::Config(format!("Missing Azure DevOps {name}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub(crate) const TEST_TOKEN: &str = "abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrst";

    pub(crate) fn test_config(base_url: &str) -> Config {
        Config {
            azure: AzureConfig {
                organization: Some("contoso".into()),
                project: Some("web".into()),
                token: Some(TEST_TOKEN.into()),
                base_url: base_url.into(),
                ..AzureConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.azure.base_url, "https://dev.azure.com");
        assert_eq!(config.azure.api_version, "7.1");
        assert_eq!(config.limits.max_days, 365);
        assert_eq!(config.limits.max_top, 1000);
        assert_eq!(config.cache.ttl_seconds, 60);
        assert_eq!(config.http.max_retries, 3);
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_load_toml_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[azure]
organization = "contoso"
project = "web"
base-url = "https://azure.example.com"

[limits]
max-days = 90

[cache]
ttl-seconds = 300

[rate-limit]
capacity = 10
refill-per-second = 0.5
"#;
        write!(temp_file, "{}", toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.azure.organization.as_deref(), Some("contoso"));
        assert_eq!(config.azure.base_url, "https://azure.example.com");
        assert_eq!(config.limits.max_days, 90);
        assert_eq!(config.limits.max_top, 1000);
        assert_eq!(config.cache.ttl_seconds, 300);
        assert_eq!(config.rate_limit.capacity, 10);
        assert_eq!(config.rate_limit.max_wait_ms, 250);
    }

    #[test]
    fn test_load_json_config() {
        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        let json_content = r#"{
  "azure": {
    "organization": "fabrikam",
    "project": "api"
  },
  "server": {
    "port": 9000
  }
}"#;
        write!(temp_file, "{}", json_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.azure.organization.as_deref(), Some("fabrikam"));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_load_yaml_config() {
        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "http:\n  max-retries: 5\n  timeout-seconds: 10\n").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.http.max_retries, 5);
        assert_eq!(config.http.timeout_seconds, 10);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        assert!(Config::load(Some(Path::new("nonexistent.toml"))).is_err());
    }

    #[test]
    fn test_settings_resolves_durations() {
        let settings = test_config("https://dev.azure.com").settings().unwrap();
        assert_eq!(settings.organization, "contoso");
        assert_eq!(settings.cache_ttl, Duration::from_secs(60));
        assert_eq!(settings.rate_limit_max_wait, Duration::from_millis(250));
        assert_eq!(settings.retry_base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_settings_requires_organization_and_project() {
        let mut config = test_config("https://dev.azure.com");
        config.azure.organization = None;
        assert!(matches!(
            config.settings(),
            Err(PipelensError::Config(msg)) if msg.contains("AZDO_ORG")
        ));

        let mut config = test_config("https://dev.azure.com");
        config.azure.project = Some("  ".into());
        assert!(matches!(
            config.settings(),
            Err(PipelensError::Config(msg)) if msg.contains("AZDO_PROJECT")
        ));
    }

    #[test]
    fn test_settings_rejects_malformed_token() {
        let mut config = test_config("https://dev.azure.com");
        config.azure.token = Some("dummy-token".into());
        assert!(matches!(config.settings(), Err(PipelensError::Config(_))));

        config.azure.token = None;
        assert!(matches!(config.settings(), Err(PipelensError::Config(_))));
    }

    #[test]
    fn test_settings_rejects_zero_bounds() {
        let mut config = test_config("https://dev.azure.com");
        config.limits.max_page_size = 0;
        assert!(config.settings().is_err());

        let mut config = test_config("https://dev.azure.com");
        config.rate_limit.refill_per_second = 0.0;
        assert!(config.settings().is_err());
    }
}
