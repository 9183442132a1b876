pub use consumer::{ConsumerHandle, ConsumerStream};
pub use coordinator::Partition;
pub use filter::{AcceptAll, MessageFilter, PredicateFilter};

mod consumer;
mod coordinator;
mod filter;
mod registry;
