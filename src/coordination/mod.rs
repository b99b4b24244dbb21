//! Coordination primitives shared by the provider's long-running tasks

pub mod shutdown;

pub use shutdown::{ShutdownController, ShutdownToken};
