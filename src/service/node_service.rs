use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use opentelemetry::metrics::Histogram;
use opentelemetry::{global, KeyValue};
use tracing::{debug, info, instrument};

use crate::message::{ClientId, Message, Offset, PartitionId, TopicMeta};
use crate::partition::{ConsumerHandle, ConsumerStream, MessageFilter, Partition};
use crate::{AppError, AppResult};

/// The node's table of topics and their partitions.
///
/// Creating a topic creates one [`Partition`] per partition index; deleting
/// it stops them. All request handlers share one `NodeService`.
#[derive(Debug)]
pub struct NodeService {
    topics: DashMap<String, TopicMeta>,
    partitions: DashMap<PartitionId, Arc<Partition>>,
    publish_latency: Histogram<f64>,
}

impl Default for NodeService {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeService {
    pub fn new() -> Self {
        let publish_latency = global::meter(env!("CARGO_PKG_NAME"))
            .f64_histogram("lanemq.publish.latency")
            .with_description("milliseconds to append one publish request")
            .init();
        NodeService {
            topics: DashMap::new(),
            partitions: DashMap::new(),
            publish_latency,
        }
    }

    /// Creates the topic and its partitions. Must run inside a tokio runtime.
    #[instrument(skip(self), fields(topic = %meta.topic))]
    pub fn create_topic(&self, meta: TopicMeta) -> AppResult<()> {
        meta.validate()?;
        match self.topics.entry(meta.topic.clone()) {
            Entry::Occupied(_) => Err(AppError::TopicAlreadyExists(meta.topic)),
            Entry::Vacant(vacant) => {
                for partition_id in meta.partition_ids() {
                    let partition = Partition::new_in_memory(partition_id.clone());
                    self.partitions.insert(partition_id, Arc::new(partition));
                }
                info!(
                    partitions = meta.partitions,
                    replicas = meta.replicas,
                    "topic created"
                );
                vacant.insert(meta);
                Ok(())
            }
        }
    }

    pub fn get_topic(&self, topic: &str) -> AppResult<TopicMeta> {
        self.topics
            .get(topic)
            .map(|meta| meta.value().clone())
            .ok_or_else(|| AppError::TopicNotFound(topic.to_string()))
    }

    pub fn topics(&self) -> Vec<TopicMeta> {
        self.topics.iter().map(|meta| meta.value().clone()).collect()
    }

    /// Removes the topic and stops its partitions, terminating their
    /// consumers with `PartitionStopped`.
    #[instrument(skip(self))]
    pub fn delete_topic(&self, topic: &str) -> AppResult<()> {
        let (_, meta) = self
            .topics
            .remove(topic)
            .ok_or_else(|| AppError::TopicNotFound(topic.to_string()))?;
        for partition_id in meta.partition_ids() {
            if let Some((_, partition)) = self.partitions.remove(&partition_id) {
                partition.stop();
            }
        }
        info!("topic deleted");
        Ok(())
    }

    pub fn partition(&self, partition_id: &PartitionId) -> AppResult<Arc<Partition>> {
        self.partitions
            .get(partition_id)
            .map(|partition| partition.value().clone())
            .ok_or_else(|| AppError::PartitionNotFound(partition_id.clone()))
    }

    /// Appends the messages to the partition in order and returns their
    /// offsets. A failure stops the batch; messages appended before it stay.
    pub async fn publish(
        &self,
        partition_id: &PartitionId,
        messages: Vec<Message>,
    ) -> AppResult<Vec<Offset>> {
        let partition = self.partition(partition_id)?;
        let start = Instant::now();
        let mut offsets = Vec::with_capacity(messages.len());
        for message in messages {
            if message.key.is_empty() {
                return Err(AppError::EmptyKey);
            }
            offsets.push(partition.append(message).await?);
        }
        self.publish_latency.record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("topic", partition_id.topic.clone())],
        );
        debug!(partition = %partition_id, count = offsets.len(), "published");
        Ok(offsets)
    }

    pub fn subscribe(
        &self,
        partition_id: &PartitionId,
        client_id: ClientId,
        stream: Box<dyn ConsumerStream>,
    ) -> AppResult<ConsumerHandle> {
        self.partition(partition_id)?
            .register_consumer(client_id, stream)
    }

    pub fn subscribe_with_filter(
        &self,
        partition_id: &PartitionId,
        client_id: ClientId,
        stream: Box<dyn ConsumerStream>,
        filter: Box<dyn MessageFilter>,
    ) -> AppResult<ConsumerHandle> {
        self.partition(partition_id)?
            .register_consumer_with_filter(client_id, stream, filter)
    }

    /// Ends the subscription `handle_id` of `client_id`, reporting `err` to
    /// its handle. A newer subscription of the same client stays.
    pub fn unsubscribe(
        &self,
        partition_id: &PartitionId,
        client_id: &ClientId,
        handle_id: u64,
        err: Option<AppError>,
    ) {
        if let Some(partition) = self.partitions.get(partition_id) {
            partition.unregister_consumer(client_id, handle_id, err);
        }
    }

    /// Stops every partition.
    pub fn shutdown(&self) {
        for partition in self.partitions.iter() {
            partition.stop();
        }
        info!(partitions = self.partitions.len(), "node service shut down");
    }
}
