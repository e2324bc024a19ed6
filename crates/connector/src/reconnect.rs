//! Reopening the event stream with exponential backoff.
//!
//! A job client drops its connection when the stream fails; the next
//! operation that needs events calls [`reconnect_loop`], which keeps
//! trying until it connects, runs out of attempts, or is cancelled.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Backoff policy for reconnecting.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Pause after the first failure.
    pub initial_delay: Duration,
    /// Ceiling for the pause.
    pub max_delay: Duration,
    /// Growth factor applied after every failure.
    pub multiplier: f64,
    /// Attempt budget, `None` for unlimited.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

/// Why [`reconnect_loop`] returned without a connection.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    #[error("reconnect cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Pause that follows `current`, capped at `max_delay`.
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    current.mul_f64(config.multiplier).min(config.max_delay)
}

/// Open a connection, retrying failed attempts with growing pauses.
///
/// The first attempt is immediate. Cancellation is honoured both while
/// connecting and while pausing.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Result<ComfyUIConnection, ReconnectError> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tracing::debug!(ws_url = client.ws_url(), attempt, "Opening ComfyUI event stream");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            result = client.connect() => result,
        };

        let last_error = match result {
            Ok(conn) => {
                if attempt > 1 {
                    tracing::info!(ws_url = client.ws_url(), attempt, "Event stream reopened");
                }
                return Ok(conn);
            }
            Err(e) => e.to_string(),
        };

        if config.max_attempts.is_some_and(|max| attempt >= max) {
            tracing::error!(ws_url = client.ws_url(), attempt, error = %last_error, "Giving up on event stream");
            return Err(ReconnectError::Exhausted {
                attempts: attempt,
                last_error,
            });
        }

        tracing::warn!(
            ws_url = client.ws_url(),
            attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %last_error,
            "Event stream connect failed",
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = next_delay(delay, config);
    }
}
