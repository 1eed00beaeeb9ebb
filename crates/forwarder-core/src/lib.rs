pub mod clock;
pub mod edr;
pub mod event;
pub mod id;
pub mod log;
pub mod types;

pub use event::{Event, SubscriptionToken};
pub use id::RequestIdGenerator;
pub use types::*;
