//! hm-bus: message transport for the health manager.
//!
//! [`MessageBus`] is the seam every component talks through; [`LocalBus`]
//! is the in-process implementation used by the daemon's single-node mode
//! and by tests.

pub mod bus;
pub mod error;
pub mod local;

pub use bus::{Message, MessageBus, publish_json};
pub use error::{BusError, BusResult};
pub use local::LocalBus;
