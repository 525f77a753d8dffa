//! Timeout helpers shared by the connection and request paths.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default timeout for connection attempts and awaited responses
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Heartbeat interval used until a logon response dictates one
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(9);

/// Upper bound for waiting on a response to a tracked request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `fut` with a deadline, mapping expiry to `ProtocolError::Timeout`.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_slow_future() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn passes_through_inner_result() {
        let result = with_timeout_error(async { Ok(7u8) }, DEFAULT_TIMEOUT).await;
        assert_eq!(result.ok(), Some(7));
    }
}
