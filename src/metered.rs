use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::RunwayClient;
use crate::config::Config;
use crate::errors::{Error, Result, TaskErrorKind};
use crate::metering::MeteringClient;
use crate::models::{
    GenerationRequest, GenerationResult, ImageToVideoRequest, Metadata, TaskStatusResponse,
    VideoToVideoRequest, VideoUpscaleRequest,
};
use crate::poller::{self, PollingPolicy};
use crate::usage::UsageMetadata;

/// Callback invoked with every usage-delivery failure.
pub type DispatchErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Runway client that meters every resolved generation.
///
/// Each call creates a task, waits for it on the caller's task, returns the
/// [`GenerationResult`], and hands the usage record to a background dispatch
/// task. Call [`flush`](Self::flush) or [`shutdown`](Self::shutdown) before
/// the runtime exits, or in-flight usage records are lost.
///
/// # Example
///
/// ```no_run
/// use runway_metering::{ConfigBuilder, ImageToVideoRequest, MeteredRunway, UsageMetadata};
///
/// # async fn example() -> runway_metering::Result<()> {
/// let config = ConfigBuilder::new()
///     .runway_api_key("key_live_abc")
///     .metering_api_key("hak_live_abc")
///     .build()?;
/// let runway = MeteredRunway::new(&config)?;
///
/// let result = runway
///     .image_to_video(
///         ImageToVideoRequest {
///             prompt_image: "https://example.com/still.png".into(),
///             duration: Some(5),
///             ..Default::default()
///         },
///         Some(UsageMetadata {
///             organization_id: Some("org-acme".into()),
///             ..Default::default()
///         }),
///     )
///     .await?;
/// println!("{} -> {:?}", result.id, result.output_urls);
///
/// runway.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct MeteredRunway {
    provider: RunwayClient,
    metering: Arc<MeteringClient>,
    polling: PollingPolicy,
    dispatches: TaskTracker,
    flush_lock: Mutex<()>,
    shut_down: AtomicBool,
    on_dispatch_error: Option<DispatchErrorHook>,
}

impl MeteredRunway {
    /// Build the provider client and metering dispatcher from `config`.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            provider: RunwayClient::new(config)?,
            metering: Arc::new(MeteringClient::new(config)?),
            polling: config.polling,
            dispatches: TaskTracker::new(),
            flush_lock: Mutex::new(()),
            shut_down: AtomicBool::new(false),
            on_dispatch_error: None,
        })
    }

    /// Register a callback for usage records that could not be delivered.
    /// Failures are logged either way.
    pub fn on_dispatch_error(mut self, hook: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_dispatch_error = Some(Arc::new(hook));
        self
    }

    pub fn provider(&self) -> &RunwayClient {
        &self.provider
    }

    pub fn metering(&self) -> &MeteringClient {
        &self.metering
    }

    /// Generate a video from an image. Defaults the model to `gen3a_turbo`.
    pub async fn image_to_video(
        &self,
        req: ImageToVideoRequest,
        usage: Option<UsageMetadata>,
    ) -> Result<GenerationResult> {
        self.generate(req, usage, &CancellationToken::new()).await
    }

    /// Restyle a video. Defaults the model to `gen3a_turbo`.
    pub async fn video_to_video(
        &self,
        req: VideoToVideoRequest,
        usage: Option<UsageMetadata>,
    ) -> Result<GenerationResult> {
        self.generate(req, usage, &CancellationToken::new()).await
    }

    /// Upscale a video. Defaults the model to `upscale`.
    pub async fn upscale_video(
        &self,
        req: VideoUpscaleRequest,
        usage: Option<UsageMetadata>,
    ) -> Result<GenerationResult> {
        self.generate(req, usage, &CancellationToken::new()).await
    }

    /// Create a task, wait for it, and meter the outcome.
    ///
    /// Returns `Ok` for every task that reached a known status, including
    /// FAILED and CANCELED tasks and waits that timed out after at least one
    /// successful lookup; inspect [`GenerationResult::error`]. Those outcomes
    /// are metered.
    ///
    /// Firing `cancel` stops the wait without metering. A dispatch already
    /// spawned by an earlier call is unaffected.
    ///
    /// # Errors
    ///
    /// - Any task-creation error. Nothing is metered.
    /// - [`Error::Task`] when the wait was cancelled or never observed a status.
    /// - [`Error::Configuration`] after [`shutdown`](Self::shutdown).
    pub async fn generate<R: GenerationRequest>(
        &self,
        mut req: R,
        usage: Option<UsageMetadata>,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        // Held until the dispatch is spawned so flush and shutdown also wait
        // for calls that are still polling.
        let _in_flight = self.dispatches.token();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Configuration("client has been shut down".into()));
        }

        let started = Instant::now();

        if req.model().map_or(true, str::is_empty) {
            req.set_model(R::OPERATION.default_model().to_string());
        }
        let model = req.model().unwrap_or_default().to_string();

        tracing::debug!(operation = ?R::OPERATION, model = %model, "creating task");
        let task = self.provider.create_task(&req).await?;

        tracing::info!(task_id = %task.id, "waiting for task to complete");
        let (status, error) = match poller::await_completion(
            &self.provider,
            &task.id,
            &self.polling,
            cancel,
        )
        .await
        {
            Ok(status) => {
                let error = status.error.clone();
                (status, error)
            }
            Err(Error::Task {
                kind,
                message,
                last_status: Some(last),
            }) if kind != TaskErrorKind::Aborted => {
                let error = resolution_error(kind, &last, message);
                (*last, Some(error))
            }
            Err(err) => return Err(err),
        };
        let responded_at = Utc::now();

        let mut metadata = Metadata::new();
        if let Some(seconds) = req.requested_duration() {
            metadata.insert("requestedDuration".into(), json!(seconds));
        }

        let result = GenerationResult {
            id: task.id,
            status: status.status,
            output_urls: status.output,
            elapsed: started.elapsed(),
            model,
            error,
            failure_code: status.failure_code,
            metadata,
        };

        self.dispatch(result.clone(), usage, responded_at);
        Ok(result)
    }

    /// Number of usage dispatches still running, plus calls that have not
    /// yet resolved.
    pub fn pending_dispatches(&self) -> usize {
        self.dispatches.len()
    }

    /// Wait for every outstanding usage dispatch to finish, including the
    /// dispatches of calls still in progress. The client stays usable
    /// afterwards.
    pub async fn flush(&self) {
        let _guard = self.flush_lock.lock().await;
        self.dispatches.close();
        self.dispatches.wait().await;
        if !self.shut_down.load(Ordering::SeqCst) {
            self.dispatches.reopen();
        }
    }

    /// Refuse further calls and wait for outstanding dispatches.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.flush().await;
        tracing::debug!("metered client shut down");
    }

    /// Spawn the background delivery for one resolved call.
    fn dispatch(
        &self,
        result: GenerationResult,
        usage: Option<UsageMetadata>,
        responded_at: DateTime<Utc>,
    ) {
        let metering = Arc::clone(&self.metering);
        let hook = self.on_dispatch_error.clone();

        self.dispatches.spawn(async move {
            let task_id = result.id.clone();
            let delivery = async {
                let record = metering.build_record(&result, usage.as_ref(), responded_at);
                metering.send_usage(&record).await
            };

            let err = match AssertUnwindSafe(delivery).catch_unwind().await {
                Ok(Ok(())) => {
                    tracing::info!(task_id = %task_id, "usage record sent");
                    return;
                }
                Ok(Err(err)) => err,
                Err(panic) => Error::Internal(format!(
                    "metering dispatch panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            tracing::error!(task_id = %task_id, error = %err, "failed to send usage record");
            if let Some(hook) = hook {
                if std::panic::catch_unwind(AssertUnwindSafe(|| hook(&err))).is_err() {
                    tracing::error!(task_id = %task_id, "dispatch error hook panicked");
                }
            }
        });
    }
}

impl std::fmt::Debug for MeteredRunway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredRunway")
            .field("provider", &self.provider)
            .field("polling", &self.polling)
            .field("pending_dispatches", &self.dispatches.len())
            .finish_non_exhaustive()
    }
}

/// Error text stored on a result whose wait ended unsuccessfully.
fn resolution_error(kind: TaskErrorKind, last: &TaskStatusResponse, message: String) -> String {
    match kind {
        TaskErrorKind::Failed => last
            .failure_reason()
            .map(str::to_string)
            .unwrap_or(message),
        _ => message,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
