//! Publish, consume and inspect on top of the managed session

pub mod checker;
pub mod consumer;
pub mod publisher;
pub mod target;

pub use checker::Checker;
pub use consumer::{handler_fn, MessageHandler, ReconnectingConsumer};
pub use publisher::{PublishOptions, RetryingPublisher};
pub use target::Target;
