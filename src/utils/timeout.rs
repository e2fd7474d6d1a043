//! Timeout helpers shared by the server and the clients.
//!
//! The server bounds every accepted connection with one deadline; the clients
//! bound the connect and the exchange that follows separately.

use crate::error::{Result, VotifierError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Deadline for all I/O on one accepted connection
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect timeout used by the clients
pub const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for the exchange after a client has connected
pub const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a graceful shutdown waits for in-flight connections
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a fallible future, failing with `VotifierError::Timeout` once `duration` elapses.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| VotifierError::Timeout)?
}

/// Run a fallible future against an absolute deadline.
pub async fn with_deadline<F, T>(fut: F, deadline: Instant) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| VotifierError::Timeout)?
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        };
        let result = with_timeout_error(slow, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(VotifierError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_shared_across_operations() {
        let deadline = Instant::now() + Duration::from_secs(5);

        let first = with_deadline(
            async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(1)
            },
            deadline,
        )
        .await;
        assert_eq!(first.unwrap(), 1);

        // 3s of the 5s budget is gone, another 3s must not fit
        let second = with_deadline(
            async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(2)
            },
            deadline,
        )
        .await;
        assert!(matches!(second, Err(VotifierError::Timeout)));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: Result<()> =
            with_timeout_error(async { Err(VotifierError::ConnectionClosed) }, SERVER_TIMEOUT)
                .await;
        assert!(matches!(result, Err(VotifierError::ConnectionClosed)));
    }
}
