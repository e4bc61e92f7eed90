pub mod randomness;
pub mod tickets;
pub mod timing;

pub use randomness::*;
pub use tickets::*;
pub use timing::*;
