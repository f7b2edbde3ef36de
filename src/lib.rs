//! chronocache — a caching reverse proxy for idempotent time-series query
//! APIs. Successful GET responses from the upstream query service are kept
//! in a TTL-bounded in-memory cache, so repeat queries — including ones
//! whose time ranges are skewed by less than one cache lifetime — are
//! served from memory instead of being re-executed upstream.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod telemetry;
