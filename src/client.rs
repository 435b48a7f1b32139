use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::models::{
    GenerationRequest, ImageToVideoRequest, ProviderErrorResponse, TaskResponse,
    TaskStatusResponse, VideoToVideoRequest, VideoUpscaleRequest,
};
use crate::poller::TaskStatusSource;

const VERSION_HEADER: HeaderName = HeaderName::from_static("x-runway-version");

pub(crate) fn user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Thin client for the Runway task API.
///
/// Every call is a single HTTP round trip; retry policy belongs to the
/// caller (the completion poller tolerates failed lookups on its own).
///
/// # Example
///
/// ```no_run
/// use runway_metering::{ConfigBuilder, ImageToVideoRequest, RunwayClient};
///
/// # async fn example() -> runway_metering::Result<()> {
/// let config = ConfigBuilder::new()
///     .runway_api_key("key_live_abc")
///     .metering_api_key("hak_live_abc")
///     .build()?;
/// let client = RunwayClient::new(&config)?;
///
/// let task = client
///     .create_image_to_video(&ImageToVideoRequest {
///         prompt_image: "https://example.com/still.png".into(),
///         ..Default::default()
///     })
///     .await?;
/// let status = client.get_task_status(&task.id).await?;
/// println!("{} is {}", status.id, status.status);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RunwayClient {
    base_url: String,
    http: reqwest::Client,
}

impl RunwayClient {
    /// Build a client from a validated [`Config`].
    ///
    /// Returns [`Error::Configuration`] if the API key or version cannot be
    /// encoded as a header value.
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.runway_api_key))
            .map_err(|_| Error::Configuration("Runway API key contains invalid characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            VERSION_HEADER,
            HeaderValue::from_str(&config.runway_version).map_err(|_| {
                Error::Configuration("Runway version contains invalid characters".into())
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(user_agent())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.runway_base_url.clone(),
            http,
        })
    }

    /// Create an image-to-video generation task.
    pub async fn create_image_to_video(&self, req: &ImageToVideoRequest) -> Result<TaskResponse> {
        self.create_task(req).await
    }

    /// Create a video-to-video generation task.
    pub async fn create_video_to_video(&self, req: &VideoToVideoRequest) -> Result<TaskResponse> {
        self.create_task(req).await
    }

    /// Create a video upscaling task.
    pub async fn create_video_upscale(&self, req: &VideoUpscaleRequest) -> Result<TaskResponse> {
        self.create_task(req).await
    }

    /// POST a request to its operation's creation endpoint.
    pub async fn create_task<R: GenerationRequest>(&self, req: &R) -> Result<TaskResponse> {
        let task: TaskResponse = self
            .request(Method::POST, R::OPERATION.endpoint(), Some(req))
            .await?;
        tracing::debug!(task_id = %task.id, status = %task.status, "created task");
        Ok(task)
    }

    /// Fetch the current state of a task by its identifier.
    pub async fn get_task_status(&self, task_id: &str) -> Result<TaskStatusResponse> {
        self.request::<TaskStatusResponse, ()>(Method::GET, &format!("/v1/tasks/{task_id}"), None)
            .await
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    /// Execute one request and decode the JSON response.
    ///
    /// 401/403 map to [`Error::Authentication`]; every other non-2xx status
    /// maps to [`Error::Provider`] with the message from the provider's error
    /// body when it has one.
    async fn request<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);

        let mut req = self.http.request(method, &url);
        if let Some(b) = body {
            req = req.json(b);
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::network("provider request failed", e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::network("failed to read provider response", e))?;

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|e| Error::Provider {
                status_code: status.as_u16(),
                message: format!("failed to decode response: {e}"),
                code: None,
                error_type: None,
            });
        }

        let status_code = status.as_u16();
        let (message, code, error_type) = match serde_json::from_str::<ProviderErrorResponse>(&text)
        {
            Ok(parsed) if !parsed.error.message.is_empty() => (
                parsed.error.message,
                parsed.error.code,
                parsed.error.error_type,
            ),
            _ => (text, None, None),
        };

        Err(match status_code {
            401 | 403 => Error::Authentication { message },
            _ => Error::Provider {
                status_code,
                message,
                code,
                error_type,
            },
        })
    }
}

#[async_trait]
impl TaskStatusSource for RunwayClient {
    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse> {
        self.get_task_status(task_id).await
    }
}
