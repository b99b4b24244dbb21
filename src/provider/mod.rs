//! Deal provider: admission, run loop, handlers and recovery

pub mod command;
pub mod config;
pub mod handler;
#[allow(clippy::module_inception)]
pub mod provider;
pub mod recovery;
pub mod run_loop;
pub mod state;
pub mod traits;

pub use command::DealRejectionInfo;
pub use config::ProviderConfig;
pub use handler::{DealHandler, DealHandlerRegistry, PipelineGuard, RetryDelivery, RetryGate};
pub use provider::{Provider, ProviderDeps};
pub use recovery::RecoveryReport;
pub use run_loop::{RunLoop, RunLoopHandle};
pub use state::{Reservation, ReservationView};
pub use traits::*;
