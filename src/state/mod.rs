pub mod subscriptions;

pub use subscriptions::SubscriptionRegistry;
