use hm_bus::BusError;
use hm_kv::StoreError;
use thiserror::Error;

pub type ListenerResult<T> = Result<T, ListenerError>;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}
