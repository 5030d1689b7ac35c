//! hmd: the health manager daemon.
//!
//! The binary in `main.rs` parses the command line and loads `hm.toml`;
//! everything it runs is assembled by [`Daemon`] so integration tests can
//! drive the same wiring in-process.

pub mod daemon;

pub use daemon::{Daemon, Exit, LOCK_LOST_EXIT_CODE, Role, open_store};
