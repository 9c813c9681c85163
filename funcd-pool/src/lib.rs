//! The container slot pool: warm container lifecycle per slot key,
//! node-wide resource accounting, FIFO waiters, idle eviction and clean
//! drain. This is the single point of serialization on the invocation
//! data path.

pub mod docker;
pub mod driver;
pub mod mock;
pub mod pool;
pub mod protocol;
pub mod resource;

pub use driver::{ContainerDriver, ContainerHandle, ContainerRequest, ContainerResponse, ContainerSpec};
pub use pool::{SlotHandle, SlotPool, SlotPoolConfig};
pub use resource::ResourceTracker;
