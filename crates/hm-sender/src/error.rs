use hm_kv::StoreError;
use thiserror::Error;

pub type SenderResult<T> = Result<T, SenderError>;

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
