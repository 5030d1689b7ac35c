//! hm-sender: drains the pending message queue onto the bus.

pub mod error;
pub mod sender;

pub use error::{SenderError, SenderResult};
pub use sender::{SendOutcome, SendReport, Sender};
