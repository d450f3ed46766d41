use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;
use tracing::warn;

static REQUEST_TIMEOUT: Lazy<Duration> = Lazy::new(|| secs_from_env("HTTP_TIMEOUT_SECS", 15));
static CONNECT_TIMEOUT: Lazy<Duration> =
    Lazy::new(|| secs_from_env("HTTP_CONNECT_TIMEOUT_SECS", 5));

fn secs_from_env(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// Pooled client shared by the marketplace API, image downloads and upload
/// targets. Every exchange is bounded by the request timeout.
pub fn build_client() -> Client {
    Client::builder()
        .timeout(*REQUEST_TIMEOUT)
        .connect_timeout(*CONNECT_TIMEOUT)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .gzip(true)
        .build()
        .unwrap_or_else(|err| {
            warn!(target = "mcflip.gameflip", error = %err, "http_client_fallback");
            Client::new()
        })
}
