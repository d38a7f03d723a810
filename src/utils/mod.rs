//! Startup and retry helpers shared by the broker and binaries.

pub mod bootstrap;
pub mod retry;
