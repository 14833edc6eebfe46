use thiserror::Error;

use event_store::EventStoreError;

/// Errors produced by the outbox relay.
///
/// Broker rejections are not errors here: they are bookkept on the outbox
/// row (backoff, attempts, stuck flag) and retried, never surfaced to the
/// drain loop's caller.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The outbox store failed.
    #[error("Outbox store error: {0}")]
    Store(#[from] EventStoreError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
