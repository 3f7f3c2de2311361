//! Timeout defaults and async timeout wrappers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default idle window of a TCP request channel.
pub const DEFAULT_IDLE_TCP: Duration = Duration::from_secs(5);

/// Default wait for a UDP reply datagram.
pub const DEFAULT_IDLE_UDP: Duration = Duration::from_secs(5);

/// Default TCP connect timeout.
pub const DEFAULT_CONNECTION_TIMEOUT_TCP: Duration = Duration::from_secs(3);

/// Runs `fut` with a deadline. A zero `duration` means no deadline.
pub async fn with_timeout<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    if duration.is_zero() {
        return Ok(fut.await);
    }
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| ProtocolError::Timeout)
}

/// Like [`with_timeout`] for fallible futures, flattening the result.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_timeout(fut, duration).await?
}
