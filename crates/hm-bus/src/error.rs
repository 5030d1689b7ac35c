use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("request on {0} timed out")]
    Timeout(String),

    #[error("bus closed")]
    Closed,

    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("failed to decode message on {subject}: {source}")]
    Decode {
        subject: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}
