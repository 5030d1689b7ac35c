pub mod clock;
pub mod config;
pub mod models;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::HmConfig;
pub use models::*;
