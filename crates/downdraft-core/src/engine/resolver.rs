//! Redirect resolution
//!
//! Follows 3xx chains by hand with an explicit hop budget. The engine's
//! HTTP client is built with redirects disabled, so every hop passes through
//! here (or through the transfer worker's restart path) and counts against
//! the budget.

use crate::error::EngineError;
use reqwest::Client;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

/// Redirect hop budget per attempt, shared with the transfer worker.
pub const MAX_REDIRECT_HOPS: u32 = 5;

/// Per-hop bound on metadata probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Follow the redirect chain from `url` and return the final location.
///
/// Each hop is a HEAD probe bounded by [`PROBE_TIMEOUT`]. A relative
/// `Location` header resolves against the current hop. Exhausting the budget
/// fails with `TooManyRedirects`; a transport failure or timeout fails with
/// `Network` and is the caller's to fall back from.
pub async fn resolve(client: &Client, url: &Url, max_hops: u32) -> Result<Url, EngineError> {
    let mut current = url.clone();
    let mut hops_left = max_hops;

    loop {
        let response = timeout(PROBE_TIMEOUT, client.head(current.as_str()).send())
            .await
            .map_err(|_| EngineError::Network(format!("probe of {current} timed out")))??;

        let status = response.status();
        if !status.is_redirection() {
            return Ok(current);
        }

        let Some(location) = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
        else {
            // A 3xx without a Location header ends the chain.
            return Ok(current);
        };

        if hops_left == 0 {
            return Err(EngineError::TooManyRedirects);
        }
        hops_left -= 1;

        let next = current
            .join(location)
            .map_err(|_| EngineError::InvalidUrl(location.to_string()))?;
        debug!("redirect {} -> {}", current, next);
        current = next;
    }
}
