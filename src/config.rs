use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use http::Uri;

/// Runtime configuration, parsed once at startup.
///
/// Every flag can also be supplied through a `CHRONOCACHE_*` environment
/// variable; the flag wins when both are present.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "chronocache",
    about = "Caching reverse proxy for time-series query APIs",
    version
)]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "CHRONOCACHE_LISTEN_ADDR", default_value = "0.0.0.0:9091")]
    pub listen_addr: String,

    /// Base URL of the upstream query service.
    #[arg(
        long,
        env = "CHRONOCACHE_UPSTREAM_URL",
        default_value = "http://localhost:9090"
    )]
    pub upstream_url: String,

    /// Lifetime of a cache entry, in seconds.
    #[arg(long, env = "CHRONOCACHE_TTL_SECS", default_value_t = 300)]
    pub cache_ttl_secs: u64,

    /// Path prefix under which requests are proxied upstream.
    #[arg(long, env = "CHRONOCACHE_ROUTE_PREFIX", default_value = "/api/")]
    pub route_prefix: String,

    /// How long to wait for in-flight requests on shutdown, in seconds.
    #[arg(long, env = "CHRONOCACHE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Validates the upstream URL and returns it as an absolute URI.
    pub fn upstream_uri(&self) -> anyhow::Result<Uri> {
        let uri: Uri = self
            .upstream_url
            .parse()
            .with_context(|| format!("invalid upstream URL '{}'", self.upstream_url))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            anyhow::bail!(
                "upstream URL '{}' must be absolute (scheme and host)",
                self.upstream_url
            );
        }
        Ok(uri)
    }
}
