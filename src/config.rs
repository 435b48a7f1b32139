use std::time::Duration;

use tracing::Level;

use crate::errors::{Error, Result};
use crate::poller::PollingPolicy;

pub const DEFAULT_RUNWAY_BASE_URL: &str = "https://api.runwayml.com";
pub const DEFAULT_RUNWAY_VERSION: &str = "2024-11-06";
pub const DEFAULT_METERING_BASE_URL: &str = "https://api.revenium.ai";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_METERING_TIMEOUT: Duration = Duration::from_secs(10);
const METERING_KEY_PREFIX: &str = "hak_";

/// Validated settings shared by the provider client and the metering
/// dispatcher. Construct with [`ConfigBuilder`].
#[derive(Debug, Clone)]
pub struct Config {
    pub runway_api_key: String,
    pub runway_base_url: String,
    /// Sent as `X-Runway-Version`.
    pub runway_version: String,
    pub metering_api_key: String,
    /// Normalized: no trailing slash or legacy `/meter/v2` suffix.
    pub metering_base_url: String,
    /// Merged into usage records that do not name an organization.
    pub organization_id: Option<String>,
    /// Merged into usage records that do not name a product.
    pub product_id: Option<String>,
    /// Suggested verbosity for the host's subscriber. Nothing here installs one.
    pub log_level: Level,
    pub polling: PollingPolicy,
    pub request_timeout: Duration,
    pub metering_timeout: Duration,
}

/// Builder for constructing a [`Config`].
///
/// # Example
///
/// ```no_run
/// use runway_metering::ConfigBuilder;
/// use std::time::Duration;
///
/// # fn example() -> runway_metering::Result<()> {
/// let config = ConfigBuilder::new()
///     .runway_api_key("key_live_abc")
///     .metering_api_key("hak_live_abc")
///     .organization_id("org-acme")
///     .request_timeout(Duration::from_secs(45))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    runway_api_key: Option<String>,
    runway_base_url: String,
    runway_version: String,
    metering_api_key: Option<String>,
    metering_base_url: String,
    organization_id: Option<String>,
    product_id: Option<String>,
    log_level: Level,
    polling: PollingPolicy,
    request_timeout: Duration,
    metering_timeout: Duration,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            runway_api_key: None,
            runway_base_url: DEFAULT_RUNWAY_BASE_URL.to_string(),
            runway_version: DEFAULT_RUNWAY_VERSION.to_string(),
            metering_api_key: None,
            metering_base_url: DEFAULT_METERING_BASE_URL.to_string(),
            organization_id: None,
            product_id: None,
            log_level: Level::INFO,
            polling: PollingPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            metering_timeout: DEFAULT_METERING_TIMEOUT,
        }
    }

    pub fn runway_api_key(mut self, key: impl Into<String>) -> Self {
        self.runway_api_key = Some(key.into());
        self
    }

    /// Override the provider base URL (defaults to `https://api.runwayml.com`).
    pub fn runway_base_url(mut self, url: impl Into<String>) -> Self {
        self.runway_base_url = url.into();
        self
    }

    pub fn runway_version(mut self, version: impl Into<String>) -> Self {
        self.runway_version = version.into();
        self
    }

    /// Metering API key. Must start with `hak_`.
    pub fn metering_api_key(mut self, key: impl Into<String>) -> Self {
        self.metering_api_key = Some(key.into());
        self
    }

    /// Override the metering base URL (defaults to `https://api.revenium.ai`).
    /// Legacy forms ending in `/meter/v2`, `/meter` or `/v2` are accepted.
    pub fn metering_base_url(mut self, url: impl Into<String>) -> Self {
        self.metering_base_url = url.into();
        self
    }

    pub fn organization_id(mut self, id: impl Into<String>) -> Self {
        self.organization_id = Some(id.into());
        self
    }

    pub fn product_id(mut self, id: impl Into<String>) -> Self {
        self.product_id = Some(id.into());
        self
    }

    pub fn log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    pub fn polling(mut self, policy: PollingPolicy) -> Self {
        self.polling = policy;
        self
    }

    /// Per-request timeout for provider calls (defaults to 30 seconds).
    pub fn request_timeout(mut self, d: Duration) -> Self {
        self.request_timeout = d;
        self
    }

    /// Per-request timeout for metering calls (defaults to 10 seconds).
    pub fn metering_timeout(mut self, d: Duration) -> Self {
        self.metering_timeout = d;
        self
    }

    /// Validate and build the [`Config`].
    ///
    /// Returns [`Error::Configuration`] if a key is missing, the metering key
    /// is malformed, or the polling policy cannot make progress.
    pub fn build(self) -> Result<Config> {
        let metering_api_key = non_empty(self.metering_api_key)
            .ok_or_else(|| Error::Configuration("metering API key is required".into()))?;
        if !metering_api_key.starts_with(METERING_KEY_PREFIX) {
            return Err(Error::Configuration(format!(
                "invalid metering API key format: expected `{METERING_KEY_PREFIX}` prefix"
            )));
        }

        let runway_api_key = non_empty(self.runway_api_key)
            .ok_or_else(|| Error::Configuration("Runway API key is required".into()))?;

        if self.polling.max_attempts == 0 {
            return Err(Error::Configuration(
                "polling max_attempts must be at least 1".into(),
            ));
        }

        tracing::debug!("configuration validation passed");

        Ok(Config {
            runway_api_key,
            runway_base_url: self.runway_base_url.trim_end_matches('/').to_string(),
            runway_version: self.runway_version,
            metering_api_key,
            metering_base_url: normalize_metering_base_url(&self.metering_base_url),
            organization_id: non_empty(self.organization_id),
            product_id: non_empty(self.product_id),
            log_level: self.log_level,
            polling: self.polling,
            request_timeout: self.request_timeout,
            metering_timeout: self.metering_timeout,
        })
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Reduce a metering base URL to its bare origin form.
///
/// Strips one trailing slash and any legacy `/meter/v2`, `/meter` or `/v2`
/// suffix. An empty input yields the default URL.
pub fn normalize_metering_base_url(url: &str) -> String {
    let url = url.strip_suffix('/').unwrap_or(url);
    if url.is_empty() {
        return DEFAULT_METERING_BASE_URL.to_string();
    }
    for suffix in ["/meter/v2", "/meter", "/v2"] {
        if let Some(stripped) = url.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    url.to_string()
}

/// Parse a level name such as `"debug"` or `"WARNING"`. Unknown names map to
/// INFO.
pub fn parse_log_level(level: &str) -> Level {
    match level.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => Level::DEBUG,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}
