//! Shared data models for the diagnostic session engine

mod device;
mod diagnosis;
mod fault;
mod protocol;
mod reading;
mod session;
mod vehicle;

pub use device::*;
pub use diagnosis::*;
pub use fault::*;
pub use protocol::*;
pub use reading::*;
pub use session::*;
pub use vehicle::*;
