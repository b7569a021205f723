//! Daemon support utilities.

pub mod bootstrap;
pub mod retry;
