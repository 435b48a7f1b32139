//! Usage-record assembly for the accounting endpoint.
//!
//! A [`UsageRecord`] is a flat JSON object. Sources are merged in a fixed
//! order and a key, once written, is never overwritten:
//!
//! 1. fixed computed fields (model, timings, stop reason, billing duration)
//! 2. the result's metadata map
//! 3. caller-supplied [`UsageMetadata`] identification fields
//! 4. configured default organization / product ids
//! 5. the caller's custom map

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::{GenerationResult, Metadata, TaskStatus};

/// Billed media length when the result metadata does not carry one.
pub const DEFAULT_BILLING_DURATION_SECS: f64 = 5.0;

/// Metadata keys checked, in order, for the billed media length.
const DURATION_KEYS: [&str; 3] = ["duration", "durationSeconds", "requestedDuration"];

/// Caller-supplied identification and tracing fields attached to a usage
/// record. Empty strings and `None` are skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    pub organization_id: Option<String>,
    pub product_id: Option<String>,
    pub task_type: Option<String>,
    pub agent: Option<String>,
    pub subscription_id: Option<String>,
    pub trace_id: Option<String>,
    pub parent_transaction_id: Option<String>,
    pub trace_type: Option<String>,
    pub trace_name: Option<String>,
    /// e.g. "production", "staging".
    pub environment: Option<String>,
    pub region: Option<String>,
    pub retry_number: Option<u32>,
    pub credential_alias: Option<String>,
    /// Who is being billed: id, email, credentials block, ...
    pub subscriber: Option<Metadata>,
    pub task_id: Option<String>,
    /// 0.0 to 1.0.
    pub response_quality_score: Option<f64>,
    /// Arbitrary extra keys, merged at the top level with lowest precedence.
    #[serde(default)]
    pub custom: Metadata,
}

impl UsageMetadata {
    /// Non-empty identification fields as `(payload key, value)` pairs.
    fn fields(&self) -> Vec<(&'static str, Value)> {
        let strings = [
            ("organizationId", &self.organization_id),
            ("productId", &self.product_id),
            ("taskType", &self.task_type),
            ("agent", &self.agent),
            ("subscriptionId", &self.subscription_id),
            ("traceId", &self.trace_id),
            ("parentTransactionId", &self.parent_transaction_id),
            ("traceType", &self.trace_type),
            ("traceName", &self.trace_name),
            ("environment", &self.environment),
            ("region", &self.region),
            ("credentialAlias", &self.credential_alias),
            ("taskId", &self.task_id),
        ];

        let mut fields: Vec<(&'static str, Value)> = strings
            .into_iter()
            .filter_map(|(key, value)| {
                value
                    .as_deref()
                    .filter(|v| !v.is_empty())
                    .map(|v| (key, Value::from(v)))
            })
            .collect();

        if let Some(n) = self.retry_number {
            fields.push(("retryNumber", Value::from(n)));
        }
        if let Some(score) = self.response_quality_score {
            fields.push(("responseQualityScore", Value::from(score)));
        }
        if let Some(subscriber) = self.subscriber.as_ref().filter(|s| !s.is_empty()) {
            fields.push(("subscriber", Value::Object(subscriber.clone())));
        }
        fields
    }
}

/// Fallback identification taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct UsageDefaults {
    pub organization_id: Option<String>,
    pub product_id: Option<String>,
}

/// One normalized usage payload for `POST /meter/v2/ai/video`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct UsageRecord(Metadata);

impl UsageRecord {
    /// Assemble the record for `result`, treating `responded_at` as the
    /// moment the task resolved.
    pub fn build(
        result: &GenerationResult,
        usage: Option<&UsageMetadata>,
        defaults: &UsageDefaults,
        responded_at: DateTime<Utc>,
    ) -> Self {
        let elapsed =
            chrono::Duration::from_std(result.elapsed).unwrap_or(chrono::Duration::zero());
        let requested_at = responded_at - elapsed;

        let stop_reason = match (result.status, &result.error) {
            (TaskStatus::Canceled, _) => TaskStatus::Canceled.stop_reason(),
            (_, Some(_)) => "ERROR",
            (status, None) => status.stop_reason(),
        };

        let mut fields = Metadata::new();
        fields.insert("operationType".into(), json!("VIDEO"));
        fields.insert("provider".into(), json!("runway"));
        fields.insert("modelSource".into(), json!("RUNWAY"));
        fields.insert("model".into(), json!(result.model));
        fields.insert("transactionId".into(), json!(result.id));
        fields.insert("requestTime".into(), json!(rfc3339(requested_at)));
        fields.insert("responseTime".into(), json!(rfc3339(responded_at)));
        fields.insert(
            "requestDuration".into(),
            json!(result.elapsed.as_millis() as u64),
        );
        fields.insert(
            "durationSeconds".into(),
            json!(billing_duration(&result.metadata)),
        );
        fields.insert("stopReason".into(), json!(stop_reason));
        fields.insert("costType".into(), json!("AI"));
        fields.insert("isStreamed".into(), json!(false));
        fields.insert("middlewareSource".into(), json!(middleware_source()));
        if let Some(reason) = &result.error {
            fields.insert("errorReason".into(), json!(reason));
        }
        if let Some(code) = &result.failure_code {
            fields.insert("failureCode".into(), json!(code));
        }

        let mut record = Self(fields);

        for (key, value) in &result.metadata {
            record.insert_absent(key, value.clone());
        }

        if let Some(usage) = usage {
            for (key, value) in usage.fields() {
                record.insert_absent(key, value);
            }
        }

        if let Some(org) = &defaults.organization_id {
            record.insert_absent("organizationId", json!(org));
        }
        if let Some(product) = &defaults.product_id {
            record.insert_absent("productId", json!(product));
        }

        if let Some(usage) = usage {
            for (key, value) in &usage.custom {
                record.insert_absent(key, value.clone());
            }
        }

        record
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The billed media length in seconds. Always present.
    pub fn billing_duration(&self) -> f64 {
        self.0
            .get("durationSeconds")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_BILLING_DURATION_SECS)
    }

    pub fn transaction_id(&self) -> &str {
        self.0
            .get("transactionId")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn as_map(&self) -> &Metadata {
        &self.0
    }

    fn insert_absent(&mut self, key: &str, value: Value) {
        if !self.0.contains_key(key) {
            self.0.insert(key.to_string(), value);
        }
    }
}

/// First numeric duration found in `metadata`, else the default.
fn billing_duration(metadata: &Metadata) -> f64 {
    DURATION_KEYS
        .iter()
        .find_map(|key| metadata.get(*key).and_then(Value::as_f64))
        .unwrap_or(DEFAULT_BILLING_DURATION_SECS)
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `crate-name@version`, identifying this library to the accounting service.
pub fn middleware_source() -> String {
    format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
