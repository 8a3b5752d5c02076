use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to encode or decode envelope")]
    Codec(#[from] serde_json::Error),
    #[error("in-memory bus has no subscribers")]
    NoSubscribers,
    #[error("receiver lagged behind by {0} envelopes")]
    Lagged(u64),
}
