//! Shared helpers for integration tests.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};

use tscache::{
    CacheRequest, HttpReply, Snapshot, TimeseriesIdentity, Transport,
};

pub const BACKEND_URL: &str = "http://backend/api/timeseries";

/// Opt-in tracing for debugging test failures (`RUST_LOG=debug`).
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

/// Scripted backend: pops one reply per call and records every body sent.
pub struct ScriptedBackend {
    replies: Mutex<Vec<HttpReply>>,
    pub bodies: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<HttpReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies),
            bodies: Mutex::new(Vec::new()),
        })
    }

    pub fn push_reply(&self, reply: HttpReply) {
        self.replies.lock().unwrap().push(reply);
    }

    pub fn calls(&self) -> usize {
        self.bodies.lock().unwrap().len()
    }

    pub fn last_body(&self) -> String {
        self.bodies.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ScriptedBackend {
    async fn post_form(&self, _url: &str, body: &str) -> anyhow::Result<HttpReply> {
        self.bodies.lock().unwrap().push(body.to_owned());
        let mut replies = self.replies.lock().unwrap();
        anyhow::ensure!(!replies.is_empty(), "unexpected fetch: {body}");
        Ok(replies.remove(0))
    }
}

/// A 200 reply whose table carries `(avg, revision)` pairs, matching the
/// sorted column order `avg,revision` that slices request.
pub fn avg_reply(revisions: &[u64]) -> HttpReply {
    let data: Vec<Value> = revisions
        .iter()
        .map(|revision| json!([*revision as f64 / 10.0, revision]))
        .collect();
    HttpReply {
        status: 200,
        body: json!({
            "data": data,
            "columns": ["avg", "revision"],
            "units": "ms",
            "improvement_direction": 1,
        }),
    }
}

pub fn error_reply(status: u16, message: &str) -> HttpReply {
    HttpReply {
        status,
        body: json!({"error": message, "status": status}),
    }
}

/// Transport that holds every fetch until permits are released, so tests
/// can observe requests while their slices are still in flight.
pub struct GatedBackend {
    inner: Arc<ScriptedBackend>,
    gate: Semaphore,
}

impl GatedBackend {
    pub fn new(inner: Arc<ScriptedBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Semaphore::new(0),
        })
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

#[async_trait]
impl Transport for GatedBackend {
    async fn post_form(&self, url: &str, body: &str) -> anyhow::Result<HttpReply> {
        let _permit = self.gate.acquire().await.context("gate closed")?;
        self.inner.post_form(url, body).await
    }
}

pub fn request(
    bot: &str,
    columns: &[&str],
    min: Option<u64>,
    max: Option<u64>,
) -> CacheRequest {
    CacheRequest {
        identity: TimeseriesIdentity::new("suite", "metric", bot, "", "").unwrap(),
        statistic: "avg".to_owned(),
        columns: columns.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
        min_revision: min,
        max_revision: max,
    }
}

/// Drain the stream to completion and return every snapshot in order.
pub async fn collect(mut rx: mpsc::Receiver<Snapshot>) -> Vec<Snapshot> {
    let mut snapshots = Vec::new();
    while let Some(snapshot) = rx.recv().await {
        snapshots.push(snapshot);
    }
    snapshots
}

/// Poll until `check` passes; background write-backs are fire-and-forget.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached before deadline");
}
