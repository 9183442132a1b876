pub use hashing::hash_to_partition;
pub use topic_partition::{ClientId, PartitionId, TopicMeta};
pub use types::{Message, MessageWithOffset, Offset};

mod hashing;
mod topic_partition;
mod types;
