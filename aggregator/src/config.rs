//! Aggregator configuration loaded from YAML.
//!
//! Every field has a default, so an empty document (or no document at all) yields a working
//! configuration pointed at `SERVICES_HOST`.

use std::net::SocketAddr;

use anyhow::Context as _;
use serde::Deserialize;

use crate::{kind::ResourceKind, template::render_env_template};

const DEFAULT_SERVICES_HOST: &str = "http://localhost:8080";

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_services_host() -> String {
    std::env::var("SERVICES_HOST").unwrap_or_else(|_| DEFAULT_SERVICES_HOST.to_string())
}

fn default_max_inflight_requests() -> usize {
    1024
}

fn default_max_batch_size() -> usize {
    5
}

fn default_max_wait_ms() -> u64 {
    5_000
}

fn default_retry_count() -> usize {
    5
}

fn default_dispatch_timeout_ms() -> u64 {
    10_000
}

fn default_dispatch_parallelism() -> usize {
    500
}

fn default_max_queue_depth() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
/// Top-level aggregator configuration.
pub struct AggregatorConfig {
    #[serde(default = "default_listen_addr")]
    /// Address the HTTP entry point listens on.
    pub listen_addr: SocketAddr,

    #[serde(default = "default_services_host")]
    /// Base URL of the downstream lookup services (e.g. `http://localhost:8080`).
    pub services_host: String,

    #[serde(default = "default_max_inflight_requests")]
    /// Maximum number of `/aggregation` requests being served at once. Excess requests get 429.
    pub max_inflight_requests: usize,

    #[serde(default)]
    pub pipelines: PipelinesConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
/// Per-kind pipeline settings.
pub struct PipelinesConfig {
    #[serde(default)]
    pub pricing: PipelineConfig,
    #[serde(default)]
    pub track: PipelineConfig,
    #[serde(default)]
    pub shipments: PipelineConfig,
}

impl PipelinesConfig {
    pub fn for_kind(&self, kind: ResourceKind) -> &PipelineConfig {
        match kind {
            ResourceKind::Pricing => &self.pricing,
            ResourceKind::Track => &self.track,
            ResourceKind::Shipments => &self.shipments,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_batch_size")]
    /// Maximum number of keys per downstream call.
    pub max_batch_size: usize,

    #[serde(default = "default_max_wait_ms")]
    /// Maximum time (in milliseconds) a key waits for its window to fill.
    pub max_wait_ms: u64,

    #[serde(default = "default_retry_count")]
    /// Retries after a failed downstream call.
    pub retry_count: usize,

    #[serde(default = "default_dispatch_timeout_ms")]
    /// Hard limit (in milliseconds) for one window's downstream call, retries included.
    pub dispatch_timeout_ms: u64,

    #[serde(default = "default_dispatch_parallelism")]
    /// Maximum number of windows in flight at once.
    pub dispatch_parallelism: usize,

    #[serde(default = "default_max_queue_depth")]
    /// Coalescing channel capacity.
    pub max_queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_wait_ms: default_max_wait_ms(),
            retry_count: default_retry_count(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            dispatch_parallelism: default_dispatch_parallelism(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            services_host: default_services_host(),
            max_inflight_requests: default_max_inflight_requests(),
            pipelines: PipelinesConfig::default(),
        }
    }
}

impl AggregatorConfig {
    /// Parse a YAML config from bytes.
    pub fn from_yaml_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let cfg: Self = serde_yaml::from_slice(bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read a YAML config file, substituting `${VAR}` placeholders from the environment.
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read config {path}"))?;
        let rendered = render_env_template(&raw).with_context(|| format!("render config {path}"))?;
        Self::from_yaml_bytes(rendered.as_bytes()).with_context(|| format!("parse config {path}"))
    }

    /// Defaults only, with `services_host` from `SERVICES_HOST`.
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = Self::default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.services_host)
            .with_context(|| format!("invalid services_host: {}", self.services_host))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("services_host must be an http(s) URL: {}", self.services_host);
        }
        if self.max_inflight_requests == 0 {
            anyhow::bail!("max_inflight_requests must be at least 1");
        }

        for kind in ResourceKind::ALL {
            let p = self.pipelines.for_kind(kind);
            if p.max_batch_size == 0 {
                anyhow::bail!("pipelines.{kind}.max_batch_size must be at least 1");
            }
            if p.dispatch_parallelism == 0 {
                anyhow::bail!("pipelines.{kind}.dispatch_parallelism must be at least 1");
            }
            if p.max_queue_depth == 0 {
                anyhow::bail!("pipelines.{kind}.max_queue_depth must be at least 1");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_optional_fields() {
        let yaml = br#"
services_host: "http://pricing.internal:9000"
"#;
        let cfg = AggregatorConfig::from_yaml_bytes(yaml).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.services_host, "http://pricing.internal:9000");
        assert_eq!(cfg.max_inflight_requests, 1024);

        for kind in ResourceKind::ALL {
            let p = cfg.pipelines.for_kind(kind);
            assert_eq!(p.max_batch_size, 5);
            assert_eq!(p.max_wait_ms, 5_000);
            assert_eq!(p.retry_count, 5);
            assert_eq!(p.dispatch_timeout_ms, 10_000);
            assert_eq!(p.dispatch_parallelism, 500);
            assert_eq!(p.max_queue_depth, 10_000);
        }
    }

    #[test]
    fn per_kind_overrides_leave_other_kinds_alone() {
        let yaml = br#"
listen_addr: "127.0.0.1:9090"
services_host: "http://localhost:8080"
pipelines:
  track:
    max_batch_size: 20
    max_wait_ms: 250
"#;
        let cfg = AggregatorConfig::from_yaml_bytes(yaml).unwrap();
        assert_eq!(cfg.pipelines.track.max_batch_size, 20);
        assert_eq!(cfg.pipelines.track.max_wait_ms, 250);
        assert_eq!(cfg.pipelines.track.retry_count, 5);
        assert_eq!(cfg.pipelines.pricing.max_batch_size, 5);
        assert_eq!(cfg.pipelines.shipments.max_wait_ms, 5_000);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let yaml = br#"
services_host: "http://localhost:8080"
pipelines:
  pricing: { max_batch_size: 0 }
"#;
        let err = AggregatorConfig::from_yaml_bytes(yaml).unwrap_err();
        assert!(err.to_string().contains("pipelines.pricing.max_batch_size"));
    }

    #[test]
    fn non_http_services_host_is_rejected() {
        let yaml = br#"
services_host: "ftp://localhost"
"#;
        assert!(AggregatorConfig::from_yaml_bytes(yaml).is_err());

        let yaml = br#"
services_host: "not a url"
"#;
        assert!(AggregatorConfig::from_yaml_bytes(yaml).is_err());
    }

    #[tokio::test]
    async fn load_renders_placeholders() {
        let path = std::env::temp_dir().join(format!("aggregator-{}.yaml", uuid::Uuid::new_v4()));
        tokio::fs::write(
            &path,
            b"services_host: \"${AGGREGATOR_TEST_UNSET_HOST:-http://downstream:8080}\"\n",
        )
        .await
        .unwrap();

        let cfg = AggregatorConfig::load(path.to_str().unwrap()).await.unwrap();
        assert_eq!(cfg.services_host, "http://downstream:8080");

        let _ = tokio::fs::remove_file(path).await;
    }
}
