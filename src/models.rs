use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Free-form JSON object used for result metadata, subscriber blocks and
/// custom usage fields.
pub type Metadata = Map<String, Value>;

/// Lifecycle state of a provider task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    /// Queued behind the account's concurrency limit.
    Throttled,
    Running,
    Succeeded,
    Failed,
    Canceled,
    /// Any status string this crate does not recognize. Treated as in-flight.
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    /// Terminal = won't change anymore (SUCCEEDED, FAILED, or CANCELED).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// The accounting `stopReason` for a task that ended in this state.
    pub fn stop_reason(self) -> &'static str {
        match self {
            TaskStatus::Failed => "ERROR",
            TaskStatus::Canceled => "CANCELLED",
            _ => "END",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Throttled => "THROTTLED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which provider endpoint a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ImageToVideo,
    VideoToVideo,
    VideoUpscale,
}

impl Operation {
    /// Path of the task-creation endpoint, relative to the provider base URL.
    pub fn endpoint(self) -> &'static str {
        match self {
            Operation::ImageToVideo => "/v1/image_to_video",
            Operation::VideoToVideo => "/v1/video_to_video",
            Operation::VideoUpscale => "/v1/video_upscale",
        }
    }

    /// Model used when the caller leaves `model` unset.
    pub fn default_model(self) -> &'static str {
        match self {
            Operation::ImageToVideo | Operation::VideoToVideo => "gen3a_turbo",
            Operation::VideoUpscale => "upscale",
        }
    }
}

/// Media length the provider bills when a request does not specify one.
pub const DEFAULT_VIDEO_DURATION_SECS: u32 = 5;

/// A request body for one of the task-creation endpoints.
pub trait GenerationRequest: Serialize + Send + Sync {
    const OPERATION: Operation;

    fn model(&self) -> Option<&str>;

    fn set_model(&mut self, model: String);

    /// Seconds of video requested, for operations that take a duration.
    fn requested_duration(&self) -> Option<u32> {
        None
    }
}

/// POST /v1/image_to_video body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageToVideoRequest {
    /// Image URL or data URI.
    pub prompt_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Seconds; the provider accepts 5 or 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    /// e.g. "1280:768".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<bool>,
}

impl GenerationRequest for ImageToVideoRequest {
    const OPERATION: Operation = Operation::ImageToVideo;

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    fn set_model(&mut self, model: String) {
        self.model = Some(model);
    }

    fn requested_duration(&self) -> Option<u32> {
        Some(
            self.duration
                .filter(|d| *d > 0)
                .unwrap_or(DEFAULT_VIDEO_DURATION_SECS),
        )
    }
}

/// POST /v1/video_to_video body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoToVideoRequest {
    /// Video URL or data URI.
    pub prompt_video: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<bool>,
}

impl GenerationRequest for VideoToVideoRequest {
    const OPERATION: Operation = Operation::VideoToVideo;

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    fn set_model(&mut self, model: String) {
        self.model = Some(model);
    }

    fn requested_duration(&self) -> Option<u32> {
        Some(
            self.duration
                .filter(|d| *d > 0)
                .unwrap_or(DEFAULT_VIDEO_DURATION_SECS),
        )
    }
}

/// POST /v1/video_upscale body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoUpscaleRequest {
    pub prompt_video: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl GenerationRequest for VideoUpscaleRequest {
    const OPERATION: Operation = Operation::VideoUpscale;

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    fn set_model(&mut self, model: String) {
        self.model = Some(model);
    }
}

/// Task-creation response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskResponse {
    pub id: String,
    /// Some creation endpoints return only the id.
    #[serde(default = "pending")]
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<String>,
}

fn pending() -> TaskStatus {
    TaskStatus::Pending
}

/// GET /v1/tasks/{id} response.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub id: String,
    pub status: TaskStatus,
    /// 0.0 to 1.0 while running.
    #[serde(default)]
    pub progress: Option<f64>,
    /// Output URLs once SUCCEEDED.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub output: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(d)?.unwrap_or_default())
}

impl TaskStatusResponse {
    /// Provider-supplied explanation for a FAILED task.
    pub fn failure_reason(&self) -> Option<&str> {
        self.error.as_deref().or(self.failure_message.as_deref())
    }
}

/// Returned by every generation call once the task resolves.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub id: String,
    /// Last observed status; non-terminal only when the wait timed out.
    pub status: TaskStatus,
    pub output_urls: Vec<String>,
    /// Wall-clock time from submission to resolution. Not the media length.
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    pub metadata: Metadata,
}

impl GenerationResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded && self.error.is_none()
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Provider error body: `{"error": {"type", "message", "code"}}`.
#[derive(Deserialize)]
pub(crate) struct ProviderErrorResponse {
    pub error: ProviderErrorBody,
}

#[derive(Deserialize)]
pub(crate) struct ProviderErrorBody {
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_parses_known_and_unknown_values() {
        let s: TaskStatus = serde_json::from_value(json!("SUCCEEDED")).unwrap();
        assert_eq!(s, TaskStatus::Succeeded);
        assert!(s.is_terminal());

        let s: TaskStatus = serde_json::from_value(json!("ASSEMBLING")).unwrap();
        assert_eq!(s, TaskStatus::Unknown);
        assert!(!s.is_terminal());
    }

    #[test]
    fn stop_reason_follows_terminal_status() {
        assert_eq!(TaskStatus::Succeeded.stop_reason(), "END");
        assert_eq!(TaskStatus::Failed.stop_reason(), "ERROR");
        assert_eq!(TaskStatus::Canceled.stop_reason(), "CANCELLED");
    }

    #[test]
    fn request_omits_unset_fields() {
        let req = ImageToVideoRequest {
            prompt_image: "https://example.com/cat.png".into(),
            duration: Some(10),
            ..Default::default()
        };
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(
            body,
            json!({ "promptImage": "https://example.com/cat.png", "duration": 10 })
        );
        assert_eq!(req.requested_duration(), Some(10));
    }

    #[test]
    fn requested_duration_defaults_for_generation_but_not_upscale() {
        assert_eq!(VideoToVideoRequest::default().requested_duration(), Some(5));
        assert_eq!(VideoUpscaleRequest::default().requested_duration(), None);
    }

    #[test]
    fn status_response_tolerates_sparse_bodies() {
        let resp: TaskStatusResponse = serde_json::from_value(json!({
            "id": "task_1",
            "status": "FAILED",
            "failureCode": "SAFETY.INPUT",
            "failureMessage": "prompt rejected",
            "output": null
        }))
        .unwrap();
        assert!(resp.output.is_empty());
        assert_eq!(resp.failure_reason(), Some("prompt rejected"));
        assert_eq!(resp.failure_code.as_deref(), Some("SAFETY.INPUT"));
    }
}
