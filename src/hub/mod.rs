/// Live fan-out of newly ingested records
#[allow(clippy::module_inception)]
pub mod hub;
pub mod subscriber;

pub use hub::{spawn, Hub, HubHandle, SubscriberId, Subscription};
pub use subscriber::{ChannelSubscriber, Subscriber};
