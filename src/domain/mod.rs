pub mod checkpoint;
pub mod deal;
pub mod retry;

pub use checkpoint::*;
pub use deal::*;
pub use retry::*;
