//! Remote fetch seam.
//!
//! The cache never talks HTTP directly; it posts form bodies through this
//! trait and receives decoded JSON back. Tests substitute scripted
//! transports.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

/// Status code plus decoded JSON body of one backend reply.
#[derive(Clone, Debug)]
pub struct HttpReply {
    pub status: u16,
    pub body: Value,
}

impl HttpReply {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a form-encoded body and decode the JSON reply.
    async fn post_form(&self, url: &str, body: &str) -> anyhow::Result<HttpReply>;
}

/// Production transport over a shared reqwest client.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_form(&self, url: &str, body: &str) -> anyhow::Result<HttpReply> {
        let response = self
            .client
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body.to_owned())
            .send()
            .await
            .with_context(|| format!("post {url}"))?;
        let status = response.status().as_u16();
        // Error replies are JSON too; anything undecodable becomes null.
        let body = response.json().await.unwrap_or(Value::Null);
        Ok(HttpReply { status, body })
    }
}
