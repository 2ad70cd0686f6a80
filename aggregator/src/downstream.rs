use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;

use crate::kind::ResourceKind;

#[async_trait]
/// A downstream lookup service that accepts a batch of keys and returns a JSON object body.
pub trait Downstream: Send + Sync {
    /// Issue one batch lookup. `keys` is the comma-joined, already de-duplicated key list.
    async fn fetch(&self, kind: ResourceKind, keys: &str) -> anyhow::Result<Bytes>;
}

/// reqwest-backed [`Downstream`] talking to `{base_url}/{kind}?q=...`.
pub struct HttpDownstream {
    base_url: String,
    http: reqwest::Client,
}

impl HttpDownstream {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("build downstream http client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn fetch(&self, kind: ResourceKind, keys: &str) -> anyhow::Result<Bytes> {
        let url = format!("{}{}", self.base_url, kind.downstream_path());
        let resp = self
            .http
            .get(url)
            .query(&[(kind.downstream_query_param(), keys)])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("downstream {kind} failed (status {status})");
        }

        Ok(resp.bytes().await?)
    }
}
