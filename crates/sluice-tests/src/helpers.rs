//! Test helper functions and utilities.

use serde_json::Value;
use sluice_api::{AppState, build_app};
use sluice_bus::InMemoryEventBus;
use sluice_core::clock::SystemClock;
use sluice_core::pipeline::PipelineDefinition;
use sluice_runner::HandlerRegistry;
use sluice_scheduler::{Scheduler, SchedulerConfig, Stores};
use sluice_store::{InMemoryPipelineStore, InMemoryRunStore, InMemoryTriggerStore};
use reqwest::{Client, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// A running API server backed by in-memory stores.
pub struct TestServer {
    pub addr: SocketAddr,
    pub scheduler: Arc<Scheduler>,
    pub bus: Arc<InMemoryEventBus>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub fn client(&self) -> ApiTestClient {
        ApiTestClient::new(self.addr)
    }

    pub fn ws_url(&self, scope: &str) -> String {
        format!("ws://{}/api/v1/ws?scope={}", self.addr, scope)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start an API server on an ephemeral port with in-memory stores.
pub async fn start_test_server() -> anyhow::Result<TestServer> {
    start_test_server_with(Stores {
        pipelines: Arc::new(InMemoryPipelineStore::new()),
        runs: Arc::new(InMemoryRunStore::new()),
        triggers: Arc::new(InMemoryTriggerStore::new()),
    })
    .await
}

/// Start an API server against the given stores.
pub async fn start_test_server_with(stores: Stores) -> anyhow::Result<TestServer> {
    crate::init_test_logging();

    let bus = Arc::new(InMemoryEventBus::new());
    let config = SchedulerConfig {
        tick_interval: Duration::from_millis(50),
        ..SchedulerConfig::default()
    };
    let scheduler = Arc::new(Scheduler::new(
        stores,
        bus.clone(),
        HandlerRegistry::with_builtins(),
        Arc::new(SystemClock),
        config,
    ));
    scheduler.start().await?;

    let app = build_app(AppState::new(scheduler.clone()).with_bus(bus.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Ok(TestServer {
        addr,
        scheduler,
        bus,
        handle,
    })
}

/// Create an HTTP client for testing.
pub fn test_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to create test client")
}

/// API test client with base URL.
pub struct ApiTestClient {
    client: Client,
    base_url: String,
}

impl ApiTestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            client: test_client(),
            base_url: format!("http://{}", addr),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.get(self.url(path)).send().await
    }

    pub async fn post<T: serde::Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> reqwest::Result<reqwest::Response> {
        self.client.post(self.url(path)).json(body).send().await
    }

    /// POST without a body.
    pub async fn post_empty(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.post(self.url(path)).send().await
    }

    /// Register a pipeline, failing unless the server answers 201.
    pub async fn register(&self, definition: &PipelineDefinition) -> anyhow::Result<Value> {
        let resp = self.post("/api/v1/pipelines", definition).await?;
        anyhow::ensure!(
            resp.status() == StatusCode::CREATED,
            "register returned {}",
            resp.status()
        );
        Ok(resp.json().await?)
    }

    /// Start a manual run and return its id.
    pub async fn trigger(&self, pipeline_id: &str) -> anyhow::Result<String> {
        let resp = self
            .post_empty(&format!("/api/v1/pipelines/{pipeline_id}/runs"))
            .await?;
        anyhow::ensure!(
            resp.status() == StatusCode::ACCEPTED,
            "trigger returned {}",
            resp.status()
        );
        let body: Value = resp.json().await?;
        body["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("trigger response has no id"))
    }

    pub async fn run(&self, run_id: &str) -> anyhow::Result<Value> {
        let resp = self.get(&format!("/api/v1/runs/{run_id}")).await?;
        anyhow::ensure!(resp.status().is_success(), "get run returned {}", resp.status());
        Ok(resp.json().await?)
    }

    /// Poll a run until it reaches a terminal status.
    pub async fn wait_for_terminal(&self, run_id: &str, timeout: Duration) -> anyhow::Result<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.run(run_id).await?;
            let status = run["status"].as_str().unwrap_or_default();
            if matches!(status, "succeeded" | "failed" | "cancelled") {
                return Ok(run);
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "run {run_id} still {status} after {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Check health endpoint.
    pub async fn health(&self) -> anyhow::Result<bool> {
        let resp = self.get("/health").await?;
        Ok(resp.status().is_success())
    }
}

/// Wait for a condition with timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Assert that a future completes within a timeout.
pub async fn assert_completes_within<F, T>(future: F, timeout: Duration) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .expect("Operation timed out")
}
