use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(2500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("consumer did not accept output within {0:?}")]
    Timeout(Duration),
    #[error("consumer channel closed")]
    Closed,
}

/// Hands `item` to a bounded consumer, giving up once `deadline` elapses.
pub async fn deliver_with_timeout<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    deadline: Duration,
) -> Result<(), DeliveryError> {
    tx.send_timeout(item, deadline)
        .await
        .map_err(|err| match err {
            SendTimeoutError::Timeout(_) => DeliveryError::Timeout(deadline),
            SendTimeoutError::Closed(_) => DeliveryError::Closed,
        })
}
