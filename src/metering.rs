use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

use crate::client::user_agent;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::models::GenerationResult;
use crate::usage::{UsageDefaults, UsageMetadata, UsageRecord};

const METERING_PATH: &str = "/meter/v2/ai/video";
const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const POOL_MAX_IDLE_PER_HOST: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Result of a single delivery attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Delivered,
    /// 4xx or local failure; retrying would not help.
    Rejected(Error),
    /// Network failure or 5xx.
    Retryable(Error),
}

/// Delivers [`UsageRecord`]s to the accounting endpoint.
///
/// Holds one pooled HTTP client for its whole lifetime; clone the
/// surrounding `Arc` rather than building a new dispatcher per call.
#[derive(Debug)]
pub struct MeteringClient {
    url: String,
    http: reqwest::Client,
    defaults: UsageDefaults,
}

impl MeteringClient {
    /// Build the dispatcher and its connection pool from a validated
    /// [`Config`].
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(&config.metering_api_key).map_err(|_| {
            Error::Configuration("metering API key contains invalid characters".into())
        })?;
        key.set_sensitive(true);
        headers.insert(API_KEY_HEADER, key);
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(user_agent())
            .timeout(config.metering_timeout)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::Configuration(format!("failed to build metering HTTP client: {e}"))
            })?;

        Ok(Self {
            url: format!("{}{}", config.metering_base_url, METERING_PATH),
            http,
            defaults: UsageDefaults {
                organization_id: config.organization_id.clone(),
                product_id: config.product_id.clone(),
            },
        })
    }

    /// Build the usage record for a call that resolved at `responded_at`.
    pub fn build_record(
        &self,
        result: &GenerationResult,
        usage: Option<&UsageMetadata>,
        responded_at: DateTime<Utc>,
    ) -> UsageRecord {
        UsageRecord::build(result, usage, &self.defaults, responded_at)
    }

    /// Deliver `record`, retrying network failures and 5xx responses.
    ///
    /// Makes at most three attempts, sleeping 100ms then 200ms between them.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] as soon as the endpoint answers 4xx.
    /// - [`Error::Metering`] wrapping the last failure once attempts run out.
    pub async fn send_usage(&self, record: &UsageRecord) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err: Option<Error> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self.send_once(record).await {
                AttemptOutcome::Delivered => {
                    tracing::debug!(
                        transaction_id = record.transaction_id(),
                        attempt,
                        "usage record delivered"
                    );
                    return Ok(());
                }
                AttemptOutcome::Rejected(err) => return Err(err),
                AttemptOutcome::Retryable(err) => {
                    tracing::warn!(
                        transaction_id = record.transaction_id(),
                        attempt,
                        error = %err,
                        "metering attempt failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(Error::Metering {
            message: format!("metering failed after {MAX_ATTEMPTS} attempts"),
            status_code: None,
            source: last_err.map(Box::new),
        })
    }

    /// One POST, classified for the retry loop.
    pub async fn send_once(&self, record: &UsageRecord) -> AttemptOutcome {
        tracing::debug!(
            url = %self.url,
            transaction_id = record.transaction_id(),
            "sending usage record"
        );

        // Serialized by hand so the charset-qualified default content type
        // is not replaced by `RequestBuilder::json`.
        let body = match serde_json::to_vec(record) {
            Ok(body) => body,
            Err(e) => {
                return AttemptOutcome::Rejected(Error::Internal(format!(
                    "failed to encode usage record: {e}"
                )))
            }
        };

        let response = match self.http.post(&self.url).body(body).send().await {
            Ok(r) => r,
            Err(e) => return AttemptOutcome::Retryable(Error::network("metering request failed", e)),
        };

        let status = response.status();
        if status.is_success() {
            return AttemptOutcome::Delivered;
        }

        let status_code = status.as_u16();
        let body = response.text().await.unwrap_or_default();

        if status.is_client_error() {
            return AttemptOutcome::Rejected(Error::Validation {
                status_code,
                message: format!("metering API returned {status_code}: {body}"),
            });
        }

        let err = Error::Metering {
            message: format!("metering API returned {status_code}: {body}"),
            status_code: Some(status_code),
            source: None,
        };
        if err.is_retryable() {
            AttemptOutcome::Retryable(err)
        } else {
            AttemptOutcome::Rejected(err)
        }
    }
}
