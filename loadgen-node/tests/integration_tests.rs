//! Integration tests for the loadgen node
//!
//! These drive whole runs through the public API:
//! - Harness preparation failures (token, profile, dataset)
//! - Ramped runs against a scripted transport
//! - Real HTTP through the reqwest transport and the stub origin

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use loadgen_node::metrics::{ProfileMetrics, HTTP_REQ_FAILED};
use loadgen_node::report::{EXIT_PASSED, EXIT_THRESHOLDS_FAILED};
use loadgen_node::retry::RetryPolicy;
use loadgen_node::stub_origin::{StubConfig, StubOrigin};
use loadgen_node::threshold::ThresholdStatus;
use loadgen_node::transport::{
    Headers, HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError,
    CORRELATION_HEADER,
};
use loadgen_node::{Harness, LoadgenConfig, LoadgenError, ProfileRegistry, RetryingExecutor};

const ROWS_CSV: &str = "STOREID,ITEMID,EXPIRY_DATE,QUANTITY,BARCODE\n\
                        101,1,2026-10-20,2,5000000000001\n\
                        102,2,2026-10-21,3,5000000000002\n\
                        103,3,2026-10-22,4,5000000000003\n";

/// Transport answering from a cycling status script and keeping every request
struct Scripted {
    statuses: Vec<u16>,
    sent: Mutex<Vec<HttpRequest>>,
}

impl Scripted {
    fn new(statuses: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            statuses: statuses.to_vec(),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut sent = self.sent.lock().unwrap();
        let status = self.statuses[sent.len() % self.statuses.len()];
        sent.push(request.clone());
        Ok(HttpResponse::new(status, "{}"))
    }
}

fn write_catalog(dir: &Path, url: &str, start_vus: u32, target: u32, csv: &str) -> ProfileRegistry {
    std::fs::write(dir.join("rows.csv"), csv).unwrap();
    let catalog = format!(
        r#"
[[profile]]
key = "local"
name = "Local"
token_env = "TOKEN_LOCAL"
dataset = "rows.csv"
required_columns = ["STOREID"]

[profile.think]
min_ms = 0
max_ms = 0

[profile.ramp]
start_vus = {start_vus}
graceful_ramp_down = "1s"
stages = [{{ target = {target}, duration = "10s" }}]

[[profile.operation]]
key = "prompted"
url = "{url}"

[profile.operation.payload]
kind = "date_checker"
"#
    );
    ProfileRegistry::from_toml_str(&catalog, dir).unwrap()
}

fn test_config() -> LoadgenConfig {
    let mut config = LoadgenConfig::default();
    config.run.profile = "local".to_string();
    config.run.tick_ms = 50;
    config.run.iterations_per_vu = Some(1);
    config.retry.base_ms = 10;
    config.retry.jitter = false;
    config
}

fn token(name: &str) -> Option<String> {
    (name == "TOKEN_LOCAL").then(|| "abc123".to_string())
}

#[cfg(test)]
mod harness_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_each_vu_posts_its_own_row() {
        let dir = TempDir::new().unwrap();
        let registry = write_catalog(dir.path(), "http://origin/items", 3, 3, ROWS_CSV);
        let transport = Scripted::new(&[200]);

        let summary = Harness::new(test_config(), registry, transport.clone())
            .with_env(token)
            .run(CancellationToken::new())
            .await
            .unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        let mut stores: Vec<String> = sent
            .iter()
            .map(|r| r.body["storeID"].as_str().unwrap_or_default().to_string())
            .collect();
        stores.sort();
        assert_eq!(stores, vec!["101", "102", "103"]);

        for request in &sent {
            assert_eq!(request.method, "POST");
            assert_eq!(request.headers.get("authorization"), Some("Bearer abc123"));
            assert_eq!(request.headers.get("content-type"), Some("application/json"));
        }

        assert_eq!(summary.totals.requests, 3);
        assert_eq!(summary.totals.failures, 0);
        assert_eq!(summary.totals.iterations, 3);
        assert_eq!(summary.totals.vus_max, 3);
        let sent: usize = sent.iter().map(|r| r.body.to_string().len()).sum();
        assert_eq!(summary.totals.bytes_sent, sent as u64);
        assert_eq!(summary.totals.bytes_received, 3 * "{}".len() as u64);
        assert!(summary.passed);
        assert_eq!(summary.exit_code(), EXIT_PASSED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_server_errors_fail_error_rate() {
        let dir = TempDir::new().unwrap();
        let registry = write_catalog(dir.path(), "http://origin/items", 1, 1, ROWS_CSV);
        let transport = Scripted::new(&[500]);

        let summary = Harness::new(test_config(), registry, transport.clone())
            .with_env(token)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transport.sent().len(), 4);
        assert_eq!(summary.totals.requests, 1);
        assert_eq!(summary.totals.failures, 1);
        assert_eq!(summary.totals.retries, 3);
        assert!(!summary.passed);
        assert_eq!(summary.exit_code(), EXIT_THRESHOLDS_FAILED);

        let failed = summary
            .thresholds
            .iter()
            .find(|t| t.metric == HTTP_REQ_FAILED)
            .unwrap();
        assert_eq!(failed.status, ThresholdStatus::Failed);
        assert_eq!(failed.observed, Some(1.0));

        let names = ProfileMetrics::new("Local");
        assert!(summary.metrics.contains_key(&names.error_rate));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_is_rejected_before_any_request() {
        let dir = TempDir::new().unwrap();
        let registry = write_catalog(dir.path(), "http://origin/items", 1, 1, ROWS_CSV);
        let transport = Scripted::new(&[200]);

        let err = Harness::new(test_config(), registry, transport.clone())
            .with_env(|_| Some("   ".to_string()))
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            LoadgenError::MissingToken { env_key, .. } => assert_eq!(env_key, "TOKEN_LOCAL"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_configuration());
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_unknown_profile_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let registry = write_catalog(dir.path(), "http://origin/items", 1, 1, ROWS_CSV);
        let mut config = test_config();
        config.run.profile = "nowhere".to_string();

        let err = Harness::new(config, registry, Scripted::new(&[200]))
            .with_env(token)
            .prepare()
            .err()
            .unwrap();

        assert!(matches!(err, LoadgenError::UnknownProfile(ref key) if key == "nowhere"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_dataset_without_usable_rows_is_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = write_catalog(
            dir.path(),
            "http://origin/items",
            1,
            1,
            "STOREID,ITEMID\n,7\n  ,8\n",
        );
        let transport = Scripted::new(&[200]);

        let err = Harness::new(test_config(), registry, transport.clone())
            .with_env(token)
            .prepare()
            .err()
            .unwrap();

        assert!(matches!(err, LoadgenError::EmptyDataset { .. }));
        assert!(err.is_configuration());
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = write_catalog(dir.path(), "http://origin/items", 1, 1, ROWS_CSV);
        let mut config = test_config();
        config.run.operation = "markdown".to_string();

        let err = Harness::new(config, registry, Scripted::new(&[200]))
            .with_env(token)
            .prepare()
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_stop_ends_run_early() {
        let dir = TempDir::new().unwrap();
        let registry = write_catalog(dir.path(), "http://origin/items", 2, 2, ROWS_CSV);
        let mut config = test_config();
        config.run.iterations_per_vu = None;
        config.think.min_ms = Some(100);
        config.think.max_ms = Some(100);

        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let summary = Harness::new(config, registry, Scripted::new(&[200]))
            .with_env(token)
            .run(stop)
            .await
            .unwrap();

        assert!(summary.stopped_early);
        assert!(summary.totals.requests > 0);
        assert!(summary.elapsed_ms < 10_000);
    }
}

#[cfg(test)]
mod http_tests {
    use super::*;

    fn request(url: String) -> HttpRequest {
        let mut headers = Headers::new();
        headers.insert("Authorization", "Bearer abc123");
        headers.insert("Content-Type", "application/json");
        HttpRequest {
            name: "markdown".to_string(),
            method: "POST".to_string(),
            url,
            headers,
            body: serde_json::json!({ "storeID": "101" }),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_reqwest_retries_against_stub_origin() {
        let stub = StubOrigin::bind(StubConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            statuses: vec![503, 200],
            ..StubConfig::default()
        })
        .await
        .unwrap()
        .spawn()
        .unwrap();

        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(5).unwrap());
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(5),
            jitter: false,
        };
        let execution = RetryingExecutor::new(transport)
            .execute(&request(stub.url("/api/markdown")), &policy, &CancellationToken::new())
            .await;

        assert_eq!(execution.attempts, 2);
        assert_eq!(execution.response.as_ref().map(|r| r.status), Some(200));
        assert_eq!(stub.request_count(), 2);

        let recorded = stub.requests();
        assert_eq!(recorded[0].method, "POST");
        assert_eq!(recorded[0].path, "/api/markdown");
        assert_eq!(recorded[0].header("authorization"), Some("Bearer abc123"));
        let first_id = recorded[0].header(CORRELATION_HEADER).unwrap();
        let second_id = recorded[1].header(CORRELATION_HEADER).unwrap();
        assert_ne!(first_id, second_id);

        let body: Value = serde_json::from_str(&recorded[1].body).unwrap();
        assert_eq!(body["storeID"], "101");

        stub.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_run_against_stub_origin() {
        let stub = StubOrigin::bind(StubConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            statuses: vec![200, 201],
            ..StubConfig::default()
        })
        .await
        .unwrap()
        .spawn()
        .unwrap();

        let dir = TempDir::new().unwrap();
        let registry = write_catalog(dir.path(), &stub.url("/items"), 2, 2, ROWS_CSV);
        let transport = Arc::new(ReqwestTransport::new(5).unwrap());

        let summary = Harness::new(test_config(), registry, transport)
            .with_env(token)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stub.request_count(), 2);
        assert_eq!(summary.totals.requests, 2);
        assert_eq!(summary.totals.failures, 0);
        assert!(stub
            .requests()
            .iter()
            .all(|r| r.header("authorization") == Some("Bearer abc123")));

        stub.shutdown().await;
    }

    #[tokio::test]
    async fn test_stub_origin_refuses_after_shutdown() {
        let stub = StubOrigin::bind(StubConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..StubConfig::default()
        })
        .await
        .unwrap()
        .spawn()
        .unwrap();
        let url = stub.url("/");
        stub.shutdown().await;

        let transport = ReqwestTransport::new(0).unwrap();
        let result = tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_secs(5), transport.send(&request(url))).await
        );
        assert!(result.is_err());
    }
}
