//! Provider driver implementations.
//!
//! Each provider implements [`TopicDriver`](crate::TopicDriver) and
//! [`SubscriptionDriver`](crate::SubscriptionDriver) and usually a URL opener
//! registered on the default [`UrlMux`](crate::UrlMux).

pub mod memory;

pub use memory::{MemoryBroker, MemoryUrlOpener};
