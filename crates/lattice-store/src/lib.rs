pub mod channels;
pub mod error;
pub mod router;
pub mod store;

pub use channels::ChannelRegistry;
pub use error::StoreError;
pub use router::{ContextUpdate, SubscriberFailure, SubscriptionRouter, UpdateHandler};
pub use store::{ContextStore, Subscription};
