//! Free-port discovery for a freshly launched ComfyUI server.
//!
//! Ports are probed with a plain HTTP `GET`: only a responder that
//! answers with a success status counts as a live server. A refused
//! connection or a non-2xx answer leaves the port up for grabs.
//!
//! The check is not atomic with the launch that follows it: another
//! process can bind the port in between. This is accepted for a single
//! local worker.

use std::future::Future;
use std::time::Duration;

/// Default number of ports probed before giving up.
pub const DEFAULT_PORT_SCAN_LIMIT: u16 = 100;

/// Timeout for a single port probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from port allocation.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// Every probed port had a live HTTP responder.
    #[error("no free port after scanning {scanned} ports from {start}")]
    Exhausted { start: u16, scanned: u32 },
}

/// Find the first port at or above `start` with no live HTTP server on
/// `host`, probing at most `limit` ports.
pub async fn find_available_port(
    http: &reqwest::Client,
    host: &str,
    start: u16,
    limit: u16,
) -> Result<u16, PortError> {
    let port = scan_ports(start, limit, move |port| async move {
        is_occupied(http, host, port).await
    })
    .await?;

    tracing::info!(host, port, start, "Selected port for ComfyUI");
    Ok(port)
}

/// Walk ports upward from `start` until `is_occupied` reports a free one.
///
/// Stops with [`PortError::Exhausted`] after `limit` ports or at the end
/// of the port range.
pub async fn scan_ports<F, Fut>(start: u16, limit: u16, mut is_occupied: F) -> Result<u16, PortError>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut port = start;

    for scanned in 1..=u32::from(limit) {
        if !is_occupied(port).await {
            return Ok(port);
        }
        tracing::debug!(port, "Port answered 200, trying next");

        port = match port.checked_add(1) {
            Some(next) => next,
            None => return Err(PortError::Exhausted { start, scanned }),
        };
    }

    Err(PortError::Exhausted {
        start,
        scanned: u32::from(limit),
    })
}

/// A port is occupied only if `GET http://{host}:{port}` succeeds with a
/// success status.
async fn is_occupied(http: &reqwest::Client, host: &str, port: u16) -> bool {
    match http
        .get(format!("http://{host}:{port}"))
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            tracing::trace!(port, error = %e, "No responder on port");
            false
        }
    }
}
