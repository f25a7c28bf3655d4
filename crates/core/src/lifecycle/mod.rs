//! Process lifecycle: logging setup and signal-driven shutdown.

pub mod logging;
pub mod signal;
