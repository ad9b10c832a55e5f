//! Async timeout wrappers and shared duration constants.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default timeout for a single protocol operation (one handshake step,
/// one send).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between keep-alive frames on an idle connection.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on graceful shutdown, covering every connection's disconnect.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` with a deadline, converting expiry into a protocol error.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Custom(format!(
            "operation timed out after {}ms",
            duration.as_millis()
        ))),
    }
}
