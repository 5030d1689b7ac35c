//! hm-listener: event-driven writers of actual state.
//!
//! [`Ingestor`] turns heartbeat snapshots into per-instance store records.
//! [`Evacuator`] reacts to instances leaving an evacuating host by queueing
//! their replacement right away.

pub mod error;
pub mod evacuator;
pub mod ingestor;

pub use error::{ListenerError, ListenerResult};
pub use evacuator::{EvacuationOutcome, Evacuator};
pub use ingestor::{IngestReport, Ingestor};
