use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::client::{
    ConnectionManager, Discovery, SingleAddrConnectionManager, SingleNodeDiscovery, Subscription,
    TcpDialer, TopicBroker,
};
use crate::message::{ClientId, Message, TopicMeta};
use crate::service::ClientConfig;
use crate::AppResult;

const CONSUMER_TTL: Duration = Duration::from_secs(30);

/// Entry point for applications: publish to and subscribe to topics by
/// name.
///
/// Topic metadata is looked up once per topic through discovery and kept
/// for the lifetime of the client.
#[derive(Debug)]
pub struct BrokerClient {
    client_id: ClientId,
    discovery: Arc<dyn Discovery>,
    connection_manager: Arc<dyn ConnectionManager>,
    config: ClientConfig,
    brokers: DashMap<String, Arc<TopicBroker>>,
}

impl BrokerClient {
    /// A client with a random consumer id inside `consumer_group`.
    pub fn new(
        consumer_group: impl Into<String>,
        discovery: Arc<dyn Discovery>,
        connection_manager: Arc<dyn ConnectionManager>,
        config: ClientConfig,
    ) -> Self {
        BrokerClient {
            client_id: ClientId::random(consumer_group),
            discovery,
            connection_manager,
            config,
            brokers: DashMap::new(),
        }
    }

    /// A client of the single node at `addr`.
    pub fn single_node(
        addr: impl Into<String>,
        consumer_group: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let dialer = Arc::new(TcpDialer::new(config.max_frame_size));
        let connection_manager = Arc::new(SingleAddrConnectionManager::new(addr, dialer));
        let discovery = Arc::new(SingleNodeDiscovery::new(connection_manager.clone()));
        BrokerClient::new(consumer_group, discovery, connection_manager, config)
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    async fn broker(&self, topic: &str) -> AppResult<Arc<TopicBroker>> {
        if let Some(broker) = self.brokers.get(topic) {
            return Ok(broker.clone());
        }
        let meta = self.discovery.get_topic(topic).await?;
        let broker = Arc::new(TopicBroker::new(
            meta,
            self.client_id.clone(),
            self.connection_manager.clone(),
            self.config.retry.clone(),
            self.config.subscription_buffer,
            self.config.max_frame_size,
        ));
        Ok(self
            .brokers
            .entry(topic.to_string())
            .or_insert(broker)
            .clone())
    }

    pub async fn topic(&self, topic: &str) -> AppResult<TopicMeta> {
        Ok(self.broker(topic).await?.topic().clone())
    }

    /// Subscribes to every partition of `topic`, starting at each
    /// partition's current end.
    pub async fn subscribe(&self, topic: &str) -> AppResult<Subscription> {
        let broker = self.broker(topic).await?;
        self.discovery
            .advertise_consumer(
                topic,
                &self.client_id.consumer_group,
                &self.client_id.consumer_id,
                CONSUMER_TTL,
            )
            .await?;
        broker.subscribe()
    }

    pub async fn publish(&self, topic: &str, messages: Vec<Message>) -> AppResult<()> {
        self.broker(topic).await?.publish(messages).await
    }

    pub async fn create_topic(&self, topic: &str, partitions: i32, replicas: i32) -> AppResult<()> {
        let meta = TopicMeta::new(topic, partitions, replicas);
        meta.validate()?;
        self.discovery.create_topic(meta).await?;
        info!(topic, partitions, replicas, "topic created");
        Ok(())
    }
}
