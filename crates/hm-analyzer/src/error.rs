use hm_kv::StoreError;
use thiserror::Error;

pub type AnalyzerResult<T> = Result<T, AnalyzerError>;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
