//! Timeout defaults and helpers.

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{ProtocolError, Result};

/// Inactivity grace period and key-exchange deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often an idle connection sends a heartbeat
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// Default request deadline
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a graceful close waits for queued frames to drain
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Await `fut`, mapping an elapsed deadline to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
