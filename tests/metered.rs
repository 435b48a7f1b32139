mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use runway_metering::{
    ConfigBuilder, ErrorKind, ImageToVideoRequest, MeteredRunway, TaskErrorKind, TaskStatus,
    UsageMetadata, VideoToVideoRequest, VideoUpscaleRequest,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    provider: MockServer,
    metering: MockServer,
}

impl Harness {
    async fn start() -> Self {
        Self {
            provider: MockServer::start().await,
            metering: MockServer::start().await,
        }
    }

    fn client(&self) -> MeteredRunway {
        MeteredRunway::new(&common::config(&self.provider.uri(), &self.metering.uri())).unwrap()
    }

    async fn accept_creation(&self, endpoint: &str, id: &str) {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": id, "status": "PENDING" })),
            )
            .mount(&self.provider)
            .await;
    }

    /// Serve `statuses` in order for task `id`, repeating the last one.
    async fn statuses(&self, id: &str, statuses: &[Value]) {
        let (last, leading) = statuses.split_last().unwrap();
        for status in leading {
            Mock::given(method("GET"))
                .and(path(format!("/v1/tasks/{id}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(status.clone()))
                .up_to_n_times(1)
                .mount(&self.provider)
                .await;
        }
        Mock::given(method("GET"))
            .and(path(format!("/v1/tasks/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(last.clone()))
            .mount(&self.provider)
            .await;
    }

    async fn meter_with(&self, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path("/meter/v2/ai/video"))
            .respond_with(response)
            .mount(&self.metering)
            .await;
    }

    async fn metered_bodies(&self) -> Vec<Value> {
        self.metering
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect()
    }

    async fn status_lookups(&self) -> usize {
        self.provider
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method.as_str() == "GET")
            .count()
    }
}

fn image_request() -> ImageToVideoRequest {
    ImageToVideoRequest {
        prompt_image: "https://example.com/still.png".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn successful_generation_is_metered_once() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_ok").await;
    h.statuses(
        "task_ok",
        &[
            common::task_status("task_ok", "RUNNING"),
            json!({
                "id": "task_ok",
                "status": "SUCCEEDED",
                "output": ["https://cdn.example.com/ok.mp4"]
            }),
        ],
    )
    .await;
    h.meter_with(ResponseTemplate::new(200)).await;

    let runway = h.client();
    let usage = UsageMetadata {
        trace_id: Some("trace-9".into()),
        ..Default::default()
    };
    let result = runway.image_to_video(image_request(), Some(usage)).await.unwrap();

    assert_eq!(result.status, TaskStatus::Succeeded);
    assert_eq!(result.model, "gen3a_turbo");
    assert_eq!(result.output_urls, vec!["https://cdn.example.com/ok.mp4".to_string()]);
    assert!(result.is_success());
    assert_eq!(h.status_lookups().await, 2);

    runway.flush().await;
    let bodies = h.metered_bodies().await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["transactionId"], json!("task_ok"));
    assert_eq!(bodies[0]["model"], json!("gen3a_turbo"));
    assert_eq!(bodies[0]["durationSeconds"], json!(5.0));
    assert_eq!(bodies[0]["traceId"], json!("trace-9"));
    assert_eq!(bodies[0]["stopReason"], json!("END"));
}

#[tokio::test]
async fn default_model_is_sent_to_provider() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/video_upscale"))
        .and(body_partial_json(json!({ "model": "upscale" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "task_up" })))
        .expect(1)
        .mount(&h.provider)
        .await;
    h.statuses("task_up", &[common::task_status("task_up", "SUCCEEDED")])
        .await;
    h.meter_with(ResponseTemplate::new(200)).await;

    let runway = h.client();
    let result = runway
        .upscale_video(
            VideoUpscaleRequest {
                prompt_video: "https://example.com/clip.mp4".into(),
                model: None,
            },
            None,
        )
        .await
        .unwrap();
    runway.flush().await;

    assert_eq!(result.model, "upscale");
    assert!(result.metadata.get("requestedDuration").is_none());
    assert_eq!(h.metered_bodies().await[0]["durationSeconds"], json!(5.0));
}

#[tokio::test]
async fn requested_duration_drives_billing() {
    let h = Harness::start().await;
    h.accept_creation("/v1/video_to_video", "task_v2v").await;
    h.statuses("task_v2v", &[common::task_status("task_v2v", "SUCCEEDED")])
        .await;
    h.meter_with(ResponseTemplate::new(200)).await;

    let runway = h.client();
    runway
        .video_to_video(
            VideoToVideoRequest {
                prompt_video: "https://example.com/clip.mp4".into(),
                model: Some("gen4_aleph".into()),
                duration: Some(10),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    runway.flush().await;

    let body = &h.metered_bodies().await[0];
    assert_eq!(body["durationSeconds"], json!(10.0));
    assert_eq!(body["model"], json!("gen4_aleph"));
}

#[tokio::test]
async fn creation_failure_is_not_metered() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "promptImage is required" }
        })))
        .mount(&h.provider)
        .await;
    h.meter_with(ResponseTemplate::new(200)).await;

    let runway = h.client();
    let err = runway
        .image_to_video(ImageToVideoRequest::default(), None)
        .await
        .unwrap_err();
    runway.flush().await;

    assert_eq!(err.kind(), ErrorKind::Provider);
    assert_eq!(h.status_lookups().await, 0);
    assert!(h.metered_bodies().await.is_empty());
}

#[tokio::test]
async fn failed_task_still_returns_result_and_meters_error() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_bad").await;
    h.statuses(
        "task_bad",
        &[json!({
            "id": "task_bad",
            "status": "FAILED",
            "failureMessage": "input image rejected",
            "failureCode": "SAFETY.INPUT.IMAGE"
        })],
    )
    .await;
    h.meter_with(ResponseTemplate::new(200)).await;

    let runway = h.client();
    let result = runway.image_to_video(image_request(), None).await.unwrap();
    runway.flush().await;

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("input image rejected"));
    assert_eq!(result.failure_code.as_deref(), Some("SAFETY.INPUT.IMAGE"));
    assert!(!result.is_success());

    let body = &h.metered_bodies().await[0];
    assert_eq!(body["stopReason"], json!("ERROR"));
    assert_eq!(body["errorReason"], json!("input image rejected"));
    assert_eq!(body["failureCode"], json!("SAFETY.INPUT.IMAGE"));
}

#[tokio::test]
async fn canceled_task_is_metered_as_cancelled() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_cxl").await;
    h.statuses("task_cxl", &[common::task_status("task_cxl", "CANCELED")])
        .await;
    h.meter_with(ResponseTemplate::new(200)).await;

    let runway = h.client();
    let result = runway.image_to_video(image_request(), None).await.unwrap();
    runway.flush().await;

    assert_eq!(result.status, TaskStatus::Canceled);
    assert_eq!(result.error.as_deref(), Some("task was canceled"));
    let body = &h.metered_bodies().await[0];
    assert_eq!(body["stopReason"], json!("CANCELLED"));
    assert_eq!(body["errorReason"], json!("task was canceled"));
}

#[tokio::test]
async fn exhausted_wait_with_known_status_is_metered() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_slow").await;
    h.statuses("task_slow", &[common::task_status("task_slow", "RUNNING")])
        .await;
    h.meter_with(ResponseTemplate::new(200)).await;

    let runway = h.client();
    let result = runway.image_to_video(image_request(), None).await.unwrap();
    runway.flush().await;

    assert_eq!(result.status, TaskStatus::Running);
    assert_eq!(
        result.error.as_deref(),
        Some("max polling attempts (10) exceeded")
    );
    assert_eq!(h.status_lookups().await, 10);
    assert_eq!(h.metered_bodies().await.len(), 1);
}

#[tokio::test]
async fn wait_without_any_status_is_an_error_and_not_metered() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_lost").await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.provider)
        .await;
    h.meter_with(ResponseTemplate::new(200)).await;

    let runway = h.client();
    let err = runway.image_to_video(image_request(), None).await.unwrap_err();
    runway.flush().await;

    assert_eq!(err.kind(), ErrorKind::Task);
    assert!(err.last_status().is_none());
    assert!(h.metered_bodies().await.is_empty());
}

#[tokio::test]
async fn cancelled_caller_gets_error_without_lookups_or_metering() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_c").await;
    h.statuses("task_c", &[common::task_status("task_c", "RUNNING")])
        .await;
    h.meter_with(ResponseTemplate::new(200)).await;

    let runway = h.client();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = runway
        .generate(image_request(), None, &cancel)
        .await
        .unwrap_err();
    runway.flush().await;

    match err {
        runway_metering::Error::Task { kind, .. } => assert_eq!(kind, TaskErrorKind::Aborted),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.status_lookups().await, 0);
    assert!(h.metered_bodies().await.is_empty());
}

#[tokio::test]
async fn generate_returns_before_dispatch_completes() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_fast").await;
    h.statuses("task_fast", &[common::task_status("task_fast", "SUCCEEDED")])
        .await;
    h.meter_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .await;

    let runway = h.client();
    let started = Instant::now();
    runway.image_to_video(image_request(), None).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(800));
    assert_eq!(runway.pending_dispatches(), 1);

    runway.flush().await;
    assert_eq!(runway.pending_dispatches(), 0);
    assert_eq!(h.metered_bodies().await.len(), 1);
}

#[tokio::test]
async fn flush_waits_for_every_outstanding_dispatch() {
    const CALLS: usize = 5;

    let h = Harness::start().await;
    for i in 0..CALLS {
        let id = format!("task_{i}");
        Mock::given(method("POST"))
            .and(path("/v1/image_to_video"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": id, "status": "PENDING" })),
            )
            .up_to_n_times(1)
            .mount(&h.provider)
            .await;
        h.statuses(&id, &[common::task_status(&id, "SUCCEEDED")]).await;
    }
    h.meter_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .await;

    let runway = h.client();
    for _ in 0..CALLS {
        runway.image_to_video(image_request(), None).await.unwrap();
    }

    runway.flush().await;

    assert_eq!(runway.pending_dispatches(), 0);
    let mut ids: Vec<String> = h
        .metered_bodies()
        .await
        .iter()
        .map(|b| b["transactionId"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, (0..CALLS).map(|i| format!("task_{i}")).collect::<Vec<_>>());

    // Still usable after a flush.
    let extra = "task_extra";
    h.accept_creation("/v1/video_to_video", extra).await;
    h.statuses(extra, &[common::task_status(extra, "SUCCEEDED")]).await;
    runway
        .video_to_video(VideoToVideoRequest::default(), None)
        .await
        .unwrap();
    runway.flush().await;
    assert_eq!(h.metered_bodies().await.len(), CALLS + 1);
}

#[tokio::test]
async fn dispatch_failures_reach_the_hook_not_the_caller() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_rej").await;
    h.statuses("task_rej", &[common::task_status("task_rej", "SUCCEEDED")])
        .await;
    h.meter_with(ResponseTemplate::new(422).set_body_string("unknown model"))
        .await;

    let failures = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failures);
    let runway = h.client().on_dispatch_error(move |err| {
        assert_eq!(err.kind(), ErrorKind::Validation);
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let result = runway.image_to_video(image_request(), None).await;
    runway.flush().await;

    assert!(result.is_ok());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(h.metered_bodies().await.len(), 1);
}

#[tokio::test]
async fn panicking_hook_does_not_escape_dispatch() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_p").await;
    h.statuses("task_p", &[common::task_status("task_p", "SUCCEEDED")])
        .await;
    h.meter_with(ResponseTemplate::new(400)).await;

    let runway = h.client().on_dispatch_error(|_| panic!("hook exploded"));
    runway.image_to_video(image_request(), None).await.unwrap();
    runway.flush().await;

    assert_eq!(runway.pending_dispatches(), 0);
}

#[tokio::test]
async fn shutdown_refuses_new_calls() {
    let h = Harness::start().await;
    let runway = h.client();
    runway.shutdown().await;

    let err = runway
        .image_to_video(image_request(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(h.provider.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_waits_for_calls_still_polling() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_late").await;
    h.statuses(
        "task_late",
        &[
            common::task_status("task_late", "RUNNING"),
            common::task_status("task_late", "RUNNING"),
            common::task_status("task_late", "SUCCEEDED"),
        ],
    )
    .await;
    h.meter_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .await;

    let runway = h.client();
    let (result, delivered_at_shutdown) = tokio::join!(
        runway.image_to_video(image_request(), None),
        async {
            tokio::time::sleep(Duration::from_millis(2)).await;
            runway.shutdown().await;
            h.metered_bodies().await.len()
        }
    );

    assert!(result.is_ok());
    assert_eq!(delivered_at_shutdown, 1);
    assert_eq!(runway.pending_dispatches(), 0);
}

#[tokio::test]
async fn response_time_is_taken_when_the_task_resolves() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_ts").await;
    h.statuses("task_ts", &[common::task_status("task_ts", "SUCCEEDED")])
        .await;
    h.meter_with(ResponseTemplate::new(200)).await;

    let runway = h.client();
    runway.image_to_video(image_request(), None).await.unwrap();
    let returned_at = Utc::now();
    // Block the runtime thread so the dispatch task cannot start yet.
    std::thread::sleep(Duration::from_millis(1100));
    runway.flush().await;

    let body = &h.metered_bodies().await[0];
    let response_time =
        DateTime::parse_from_rfc3339(body["responseTime"].as_str().unwrap())
            .unwrap()
            .with_timezone(&Utc);
    assert!(response_time <= returned_at, "{response_time} > {returned_at}");
}

#[tokio::test]
async fn configured_organization_fills_usage_records() {
    let h = Harness::start().await;
    h.accept_creation("/v1/image_to_video", "task_org").await;
    h.statuses("task_org", &[common::task_status("task_org", "SUCCEEDED")])
        .await;
    h.meter_with(ResponseTemplate::new(200)).await;

    let config = ConfigBuilder::new()
        .runway_api_key("key_test")
        .runway_base_url(h.provider.uri())
        .metering_api_key("hak_test")
        .metering_base_url(format!("{}/meter/v2", h.metering.uri()))
        .organization_id("org-configured")
        .polling(common::fast_polling(5))
        .build()
        .unwrap();
    let runway = MeteredRunway::new(&config).unwrap();

    runway.image_to_video(image_request(), None).await.unwrap();
    runway.flush().await;

    assert_eq!(
        h.metered_bodies().await[0]["organizationId"],
        json!("org-configured")
    );
}
