pub mod stream;
pub mod subscriptions;
pub mod types;

pub use stream::{EventStream, StreamError, connect};
pub use subscriptions::{SubscriptionHandle, SubscriptionRegistry};
pub use types::{ControlFrame, GenerationEvent, parse_event};
