pub mod dry_run;
pub mod fs_committer;
pub mod http_transport;
pub mod memory_store;
pub mod postgres;
pub mod resources;

pub use dry_run::{DryRunPublisher, LogAnnouncer};
pub use fs_committer::{CommitterConfig, FsCommitter};
pub use http_transport::HttpTransport;
pub use memory_store::MemoryDealStore;
pub use postgres::PostgresDealStore;
pub use resources::{MemoryCapacityManager, MemoryFundsManager};
