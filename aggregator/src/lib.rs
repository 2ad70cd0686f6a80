//! `lookup-aggregator` coalesces many small keyed lookups into fewer batch calls.
//!
//! Callers submit lists of keys per resource kind (pricing, track, shipments). Keys from all
//! concurrent callers are grouped into windows bounded by size and wait time, each window becomes
//! one downstream request, and the per-key results are routed back to the caller that asked.
//!
//! Core modules:
//! - [`collector`]: per-call result aggregation
//! - [`batching`]: coalescing channel, windowing, dispatch with retry/timeout, scatter
//! - [`service`]: submission API for the three kinds
//! - [`downstream`]: downstream batch lookup client
//! - [`server`]: axum server wiring
//! - [`config`]: YAML config with `${VAR}` substitution

pub mod batching;
pub mod collector;
pub mod config;
pub mod downstream;
pub mod error;
pub mod kind;
pub mod server;
pub mod service;
pub mod template;
