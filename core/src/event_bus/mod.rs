pub mod bus;
pub mod envelope;
pub mod topic;

pub use bus::{BusStats, EventBus, Handler};
