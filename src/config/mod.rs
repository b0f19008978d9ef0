use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub outcomes: OutcomesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
    /// Secret used to derive the key that encrypts private keys and access
    /// tokens at rest. Values are stored in plain text when unset.
    pub encryption_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token: default_admin_token(),
            encryption_key: None,
        }
    }
}

fn default_admin_token() -> String {
    // Generate a random token if not provided
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubConfig {
    /// Base URL of the REST API
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
    /// Base URL used when composing links to source files
    #[serde(default = "default_github_web_url")]
    pub web_url: String,
    /// Public name of the GitHub App, used for the install redirect
    pub app_name: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Lifetime of cached commit/compare/file-check responses (default: 300)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Page size requested when listing installation repositories (default: 100)
    #[serde(default = "default_repositories_page_size")]
    pub repositories_page_size: u32,
    /// Validity window of the app JWT in seconds (default: 600, GitHub's maximum)
    #[serde(default = "default_jwt_ttl_secs")]
    pub jwt_ttl_secs: i64,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_api_url(),
            web_url: default_github_web_url(),
            app_name: None,
            user_agent: default_user_agent(),
            cache_ttl_secs: default_cache_ttl_secs(),
            repositories_page_size: default_repositories_page_size(),
            jwt_ttl_secs: default_jwt_ttl_secs(),
        }
    }
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_github_web_url() -> String {
    "https://github.com".to_string()
}

fn default_user_agent() -> String {
    format!("ghapp-bridge/{}", env!("CARGO_PKG_VERSION"))
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_repositories_page_size() -> u32 {
    100
}

fn default_jwt_ttl_secs() -> i64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutcomesConfig {
    /// Base URL of the aggregation service
    #[serde(default = "default_outcomes_url")]
    pub url: String,
    #[serde(default = "default_outcomes_dataset")]
    pub dataset: String,
    #[serde(default = "default_outcomes_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OutcomesConfig {
    fn default() -> Self {
        Self {
            url: default_outcomes_url(),
            dataset: default_outcomes_dataset(),
            timeout_secs: default_outcomes_timeout_secs(),
        }
    }
}

fn default_outcomes_url() -> String {
    "http://127.0.0.1:1218".to_string()
}

fn default_outcomes_dataset() -> String {
    "outcomes".to_string()
}

fn default_outcomes_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            github: GitHubConfig::default(),
            outcomes: OutcomesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&content)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert_eq!(config.github.cache_ttl_secs, 300);
        assert_eq!(config.github.repositories_page_size, 100);
        assert_eq!(config.outcomes.dataset, "outcomes");
        assert_eq!(config.logging.level, "info");
        assert!(config.auth.encryption_key.is_none());
    }

    #[test]
    fn test_partial_sections_keep_field_defaults() {
        let config = Config::from_toml(
            r#"
            [github]
            api_url = "https://ghe.example.com/api/v3"
            app_name = "Error Tracker"

            [auth]
            admin_token = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.github.api_url, "https://ghe.example.com/api/v3");
        assert_eq!(config.github.app_name.as_deref(), Some("Error Tracker"));
        assert_eq!(config.github.jwt_ttl_secs, 600);
        assert_eq!(config.auth.admin_token, "secret");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/ghapp-bridge.toml")).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
    }
}
