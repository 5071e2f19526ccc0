//! Provider configuration.
//!
//! Configuration merges from fixed locations, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. `/etc/stratoform/config.toml`
//! 3. `~/.stratoform/config.toml`
//! 4. `./stratoform.toml`
//! 5. the file named by `STRATOFORM_CONFIG`
//! 6. `STRATOFORM_*` environment variables
//!
//! Later sources override earlier ones field by field, so a user config
//! can pin credentials while a project config pins the region.
//!
//! # Example
//!
//! ```toml
//! region = "eu-west-2"
//! access_key = "AKSTRATO000EXAMPLE"
//! secret_key = "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY"
//!
//! [retry]
//! deadline = "5m"
//! min_interval = "1s"
//! backoff = "linear"
//!
//! [timeouts]
//! create = "15m"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::client::HttpApi;
use crate::driver::StepTimeouts;
use crate::error::{Error, ErrorContext, Result};
use crate::retry::{BackoffStrategy, JitterStrategy, RetryPolicy};

/// Known regions and their API endpoints.
static REGION_ENDPOINTS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("eu-west-2", "https://api.eu-west-2.stratocloud.io"),
        ("us-east-2", "https://api.us-east-2.stratocloud.io"),
        ("us-west-1", "https://api.us-west-1.stratocloud.io"),
        ("ap-northeast-1", "https://api.ap-northeast-1.stratocloud.io"),
    ])
});

const DEFAULT_REGION: &str = "eu-west-2";

/// Serializable retry settings, converted to a [`RetryPolicy`] at use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Wall-clock retry deadline per remote call.
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
    /// Minimum interval between attempts.
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,
    /// Maximum interval between attempts.
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            deadline: policy.deadline,
            min_interval: policy.min_interval,
            max_interval: policy.max_interval,
            backoff: policy.backoff,
            jitter: policy.jitter,
        }
    }
}

impl RetrySettings {
    /// Builds the retry policy these settings describe.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .deadline(self.deadline)
            .min_interval(self.min_interval)
            .max_interval(self.max_interval)
            .backoff(self.backoff)
            .jitter(self.jitter)
            .build()
    }
}

/// Provider-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Region served by the provider.
    pub region: String,
    /// Explicit API endpoint, overriding the region table.
    pub endpoint: Option<String>,
    /// API access key.
    pub access_key: Option<String>,
    /// API secret key.
    pub secret_key: Option<String>,
    /// HTTP request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Per-step lifecycle timeouts.
    pub timeouts: StepTimeouts,
    /// Retry settings shared by all remote calls.
    pub retry: RetrySettings,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            request_timeout: Duration::from_secs(30),
            timeouts: StepTimeouts::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl ProviderConfig {
    /// Loads configuration from all sources.
    ///
    /// An explicit path replaces the standard file locations but the
    /// environment overrides still apply on top.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = ProviderConfig::default();

        for path in Self::config_paths(explicit_path) {
            if path.exists() {
                debug!(path = %path.display(), "merging config file");
                config = config.merge_from_file(&path)?;
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// The configuration file locations, lowest precedence first.
    fn config_paths(explicit_path: Option<&Path>) -> Vec<PathBuf> {
        if let Some(path) = explicit_path {
            return vec![path.to_path_buf()];
        }

        let mut paths = vec![PathBuf::from("/etc/stratoform/config.toml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".stratoform/config.toml"));
        }
        paths.push(PathBuf::from("stratoform.toml"));
        if let Ok(env_config) = std::env::var("STRATOFORM_CONFIG") {
            paths.push(PathBuf::from(env_config));
        }
        paths
    }

    /// Merges configuration from a TOML file.
    fn merge_from_file(&self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let file_config: ProviderConfig = toml::from_str(&content)?;
        Ok(self.merge(file_config))
    }

    /// Merges another config into this one; `other` wins for every field
    /// it sets to a non-default value.
    fn merge(&self, other: ProviderConfig) -> ProviderConfig {
        ProviderConfig {
            region: if other.region == DEFAULT_REGION {
                self.region.clone()
            } else {
                other.region
            },
            endpoint: other.endpoint.or_else(|| self.endpoint.clone()),
            access_key: other.access_key.or_else(|| self.access_key.clone()),
            secret_key: other.secret_key.or_else(|| self.secret_key.clone()),
            request_timeout: if other.request_timeout == Duration::from_secs(30) {
                self.request_timeout
            } else {
                other.request_timeout
            },
            timeouts: if other.timeouts == StepTimeouts::default() {
                self.timeouts
            } else {
                other.timeouts
            },
            retry: if other.retry == RetrySettings::default() {
                self.retry.clone()
            } else {
                other.retry
            },
        }
    }

    /// Applies `STRATOFORM_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(region) = std::env::var("STRATOFORM_REGION") {
            self.region = region;
        }
        if let Ok(endpoint) = std::env::var("STRATOFORM_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Ok(access_key) = std::env::var("STRATOFORM_ACCESS_KEY") {
            self.access_key = Some(access_key);
        }
        if let Ok(secret_key) = std::env::var("STRATOFORM_SECRET_KEY") {
            self.secret_key = Some(secret_key);
        }
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.access_key.is_some() != self.secret_key.is_some() {
            return Err(Error::InvalidConfig {
                key: "access_key".to_string(),
                message: "access_key and secret_key must be set together".to_string(),
            });
        }
        if self.endpoint.is_none() && !REGION_ENDPOINTS.contains_key(self.region.as_str()) {
            return Err(Error::InvalidConfig {
                key: "region".to_string(),
                message: format!("unknown region '{}' and no explicit endpoint", self.region),
            });
        }
        if self.retry.min_interval > self.retry.max_interval {
            return Err(Error::InvalidConfig {
                key: "retry.min_interval".to_string(),
                message: format!(
                    "min_interval {:?} exceeds max_interval {:?}",
                    self.retry.min_interval, self.retry.max_interval
                ),
            });
        }
        Ok(())
    }

    /// Resolves the API endpoint from the explicit setting or the region.
    pub fn resolve_endpoint(&self) -> Result<Url> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(Url::parse(endpoint)?);
        }
        let endpoint = REGION_ENDPOINTS
            .get(self.region.as_str())
            .ok_or_else(|| Error::InvalidConfig {
                key: "region".to_string(),
                message: format!("unknown region '{}' and no explicit endpoint", self.region),
            })?;
        Ok(Url::parse(endpoint)?)
    }

    /// Builds the HTTP API client this config describes.
    pub fn build_api(&self) -> Result<HttpApi> {
        let mut api = HttpApi::with_timeout(self.resolve_endpoint()?, self.request_timeout)?;
        if let (Some(access_key), Some(secret_key)) = (&self.access_key, &self.secret_key) {
            api = api.with_credentials(access_key, secret_key);
        }
        Ok(api)
    }
}
