#![allow(dead_code)]

use std::time::Duration;

use runway_metering::{Config, ConfigBuilder, PollingPolicy};
use serde_json::{json, Value};

/// Polling fast enough for tests against a local mock server.
pub fn fast_polling(max_attempts: u32) -> PollingPolicy {
    PollingPolicy {
        max_attempts,
        initial_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(20),
        timeout: Duration::from_secs(10),
    }
}

pub fn config(runway_url: &str, metering_url: &str) -> Config {
    ConfigBuilder::new()
        .runway_api_key("key_test")
        .runway_base_url(runway_url)
        .metering_api_key("hak_test")
        .metering_base_url(metering_url)
        .polling(fast_polling(10))
        .metering_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

pub fn task_status(id: &str, status: &str) -> Value {
    json!({ "id": id, "status": status, "output": [] })
}
