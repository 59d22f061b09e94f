pub mod bus;
pub mod local_bus;
pub mod multiplexer;
#[cfg(feature = "nats")]
pub mod nats_bus;
pub mod registry;
pub mod session;

pub use bus::{BroadcastBus, BusError, Subscription, SUBSCRIPTION_QUEUE_CAPACITY};
pub use local_bus::{LocalBus, LocalBusConfig};
pub use multiplexer::StreamMultiplexer;
#[cfg(feature = "nats")]
pub use nats_bus::NatsBus;
pub use registry::{ConnectionContext, ConnectionRegistry, SubscriptionHandle};
pub use session::{ChannelSession, NewChannel, SessionConfig};
