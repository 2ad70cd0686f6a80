//! Submission API for the three lookup kinds.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::{
    batching::{BatchingConfig, Pipeline},
    collector::Lookup,
    config::PipelinesConfig,
    downstream::Downstream,
    kind::ResourceKind,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Keys requested per kind. `None` means the kind wasn't asked for at all.
pub struct AggregationRequest {
    pub pricing: Option<Vec<String>>,
    pub track: Option<Vec<String>>,
    pub shipments: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationResponse {
    pub pricing: Lookup<f64>,
    pub track: Lookup<String>,
    pub shipments: Lookup<Vec<String>>,
}

#[derive(Clone)]
pub struct AggregationService {
    pricing: Pipeline<f64>,
    track: Pipeline<String>,
    shipments: Pipeline<Vec<String>>,
}

impl AggregationService {
    /// Start one pipeline per kind against `downstream`. Requires a Tokio runtime.
    pub fn start(downstream: Arc<dyn Downstream>, cfg: &PipelinesConfig) -> Self {
        let batching = |kind| BatchingConfig::from(cfg.for_kind(kind));
        Self {
            pricing: Pipeline::start(
                ResourceKind::Pricing,
                Arc::clone(&downstream),
                batching(ResourceKind::Pricing),
            ),
            track: Pipeline::start(
                ResourceKind::Track,
                Arc::clone(&downstream),
                batching(ResourceKind::Track),
            ),
            shipments: Pipeline::start(
                ResourceKind::Shipments,
                downstream,
                batching(ResourceKind::Shipments),
            ),
        }
    }

    pub fn submit_pricing(&self, keys: Option<&[String]>) -> BoxFuture<'static, Lookup<f64>> {
        self.pricing.submit(keys.unwrap_or_default())
    }

    pub fn submit_track(&self, keys: Option<&[String]>) -> BoxFuture<'static, Lookup<String>> {
        self.track.submit(keys.unwrap_or_default())
    }

    pub fn submit_shipments(
        &self,
        keys: Option<&[String]>,
    ) -> BoxFuture<'static, Lookup<Vec<String>>> {
        self.shipments.submit(keys.unwrap_or_default())
    }

    /// Look up all three kinds concurrently.
    pub async fn aggregate(&self, req: &AggregationRequest) -> AggregationResponse {
        let (pricing, track, shipments) = tokio::join!(
            self.submit_pricing(req.pricing.as_deref()),
            self.submit_track(req.track.as_deref()),
            self.submit_shipments(req.shipments.as_deref()),
        );
        AggregationResponse {
            pricing,
            track,
            shipments,
        }
    }
}
