use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// Identity of one partition of a topic.
///
/// Used as the key of every partition-scoped table: the node's partition
/// registry, the client connection caches and the publish routing batches.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PartitionId {
    pub topic: String,
    pub partition: i32,
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl PartitionId {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

fn default_replicas() -> i32 {
    1
}

/// Static description of a topic. The partition count fixes the hashing
/// range for the lifetime of the topic.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TopicMeta {
    pub topic: String,
    pub partitions: i32,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

impl TopicMeta {
    pub fn new(topic: impl Into<String>, partitions: i32, replicas: i32) -> Self {
        Self {
            topic: topic.into(),
            partitions,
            replicas,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.topic.is_empty() {
            return Err(AppError::InvalidValue("topic name is empty".into()));
        }
        if self.partitions <= 0 {
            return Err(AppError::InvalidValue(format!(
                "topic {} partition count {} must be positive",
                self.topic, self.partitions
            )));
        }
        if self.replicas <= 0 {
            return Err(AppError::InvalidValue(format!(
                "topic {} replica count {} must be positive",
                self.topic, self.replicas
            )));
        }
        Ok(())
    }

    pub fn partition_id(&self, partition: i32) -> PartitionId {
        PartitionId::new(self.topic.clone(), partition)
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = PartitionId> + '_ {
        (0..self.partitions).map(|partition| self.partition_id(partition))
    }

    pub fn contains(&self, partition_id: &PartitionId) -> bool {
        partition_id.topic == self.topic
            && partition_id.partition >= 0
            && partition_id.partition < self.partitions
    }
}

/// Identifies one subscription: a consumer inside a consumer group.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClientId {
    pub consumer_group: String,
    pub consumer_id: String,
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.consumer_group, self.consumer_id)
    }
}

impl ClientId {
    pub fn new(consumer_group: impl Into<String>, consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            consumer_id: consumer_id.into(),
        }
    }

    /// A client id with a fresh random consumer id.
    pub fn random(consumer_group: impl Into<String>) -> Self {
        Self::new(consumer_group, uuid::Uuid::new_v4().to_string())
    }
}
