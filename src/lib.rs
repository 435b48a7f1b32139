//! # Runway client with usage metering
//!
//! Creates [Runway](https://runwayml.com) video-generation tasks, waits for
//! them to finish, and reports each resolved call to the Revenium metering
//! API in the background, without making the caller wait on accounting.
//!
//! ## Quick start
//!
//! ```no_run
//! use runway_metering::{ConfigBuilder, ImageToVideoRequest, MeteredRunway};
//!
//! #[tokio::main]
//! async fn main() -> runway_metering::Result<()> {
//!     let config = ConfigBuilder::new()
//!         .runway_api_key("key_live_abc")
//!         .metering_api_key("hak_live_abc")
//!         .build()?;
//!     let runway = MeteredRunway::new(&config)?;
//!
//!     let result = runway
//!         .image_to_video(
//!             ImageToVideoRequest {
//!                 prompt_image: "https://example.com/still.png".into(),
//!                 prompt_text: Some("slow dolly zoom".into()),
//!                 ..Default::default()
//!             },
//!             None,
//!         )
//!         .await?;
//!
//!     println!("{} finished in {:.1}s", result.id, result.elapsed.as_secs_f64());
//!     for url in &result.output_urls {
//!         println!("  {url}");
//!     }
//!
//!     // Usage records are delivered in the background; wait for them.
//!     runway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Cancellation
//!
//! ```no_run
//! use runway_metering::{MeteredRunway, VideoUpscaleRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(runway: &MeteredRunway) -> runway_metering::Result<()> {
//! let cancel = CancellationToken::new();
//! let req = VideoUpscaleRequest {
//!     prompt_video: "https://example.com/clip.mp4".into(),
//!     model: None,
//! };
//! let result = runway.generate(req, None, &cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Logging goes through [`tracing`]; install whatever subscriber the host
//! application uses. [`Config::log_level`] carries the configured level.

mod client;
mod config;
mod errors;
mod metered;
mod metering;
mod models;
mod poller;
mod usage;

pub use client::RunwayClient;
pub use config::{
    normalize_metering_base_url, parse_log_level, Config, ConfigBuilder,
    DEFAULT_METERING_BASE_URL, DEFAULT_RUNWAY_BASE_URL, DEFAULT_RUNWAY_VERSION,
};
pub use errors::{Error, ErrorKind, Result, TaskErrorKind};
pub use metered::{DispatchErrorHook, MeteredRunway};
pub use metering::{AttemptOutcome, MeteringClient};
pub use models::{
    GenerationRequest, GenerationResult, ImageToVideoRequest, Metadata, Operation, TaskResponse,
    TaskStatus, TaskStatusResponse, VideoToVideoRequest, VideoUpscaleRequest,
    DEFAULT_VIDEO_DURATION_SECS,
};
pub use poller::{await_completion, PollingPolicy, TaskStatusSource};
pub use usage::{
    middleware_source, UsageDefaults, UsageMetadata, UsageRecord, DEFAULT_BILLING_DURATION_SECS,
};
