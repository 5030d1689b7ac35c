use hm_bus::BusError;
use hm_kv::StoreError;
use thiserror::Error;

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("bulk api rejected credentials")]
    Unauthorized,

    #[error("bulk api returned status {0}")]
    Status(u16),

    #[error("undecodable bulk api page: {0}")]
    Decode(String),

    #[error("bulk api request failed: {0}")]
    Network(String),

    #[error("bulk api request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid bulk api url {0}")]
    InvalidUrl(String),
}

impl From<BusError> for FetchError {
    fn from(e: BusError) -> Self {
        FetchError::Credentials(e.to_string())
    }
}
