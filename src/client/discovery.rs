use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::client::SingleAddrConnectionManager;
use crate::message::{PartitionId, TopicMeta};
use crate::protocol::ErrorCode;
use crate::{AppError, AppResult};

/// Where topics live and who consumes them.
#[async_trait]
pub trait Discovery: Send + Sync + Debug {
    async fn advertise_node_addr(&self, addr: &str, ttl: Duration) -> AppResult<()>;

    async fn get_all_node_addrs(&self) -> AppResult<Vec<String>>;

    /// Address of the node accepting writes for the partition.
    async fn get_leader_addr(&self, partition_id: &PartitionId) -> AppResult<String>;

    /// Addresses of the nodes serving reads for the partition.
    async fn get_replica_addrs(&self, partition_id: &PartitionId) -> AppResult<Vec<String>>;

    async fn advertise_consumer(
        &self,
        topic: &str,
        consumer_group: &str,
        consumer_id: &str,
        ttl: Duration,
    ) -> AppResult<()>;

    async fn get_consumers(&self, topic: &str, consumer_group: &str) -> AppResult<Vec<String>>;

    async fn create_topic(&self, meta: TopicMeta) -> AppResult<()>;

    async fn get_topic(&self, topic: &str) -> AppResult<TopicMeta>;
}

/// Discovery for a deployment of exactly one node.
///
/// Every partition is led and replicated by that node. Topic metadata is
/// read from and created on the node itself; consumers are only tracked in
/// this process.
#[derive(Debug)]
pub struct SingleNodeDiscovery {
    connection_manager: Arc<SingleAddrConnectionManager>,
    consumers: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl SingleNodeDiscovery {
    pub fn new(connection_manager: Arc<SingleAddrConnectionManager>) -> Self {
        SingleNodeDiscovery {
            connection_manager,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    fn node_addr(&self) -> String {
        self.connection_manager.addr().to_string()
    }
}

/// Turns the node's topic errors back into their local variants.
fn local_topic_error(err: AppError, topic: &str) -> AppError {
    match err {
        AppError::Remote {
            code: ErrorCode::TopicNotFound,
            ..
        } => AppError::TopicNotFound(topic.to_string()),
        AppError::Remote {
            code: ErrorCode::TopicAlreadyExists,
            ..
        } => AppError::TopicAlreadyExists(topic.to_string()),
        other => other,
    }
}

#[async_trait]
impl Discovery for SingleNodeDiscovery {
    async fn advertise_node_addr(&self, addr: &str, _ttl: Duration) -> AppResult<()> {
        if addr == self.connection_manager.addr() {
            Ok(())
        } else {
            Err(AppError::InvalidValue(format!(
                "single node discovery serves {}, not {}",
                self.connection_manager.addr(),
                addr
            )))
        }
    }

    async fn get_all_node_addrs(&self) -> AppResult<Vec<String>> {
        Ok(vec![self.node_addr()])
    }

    async fn get_leader_addr(&self, _partition_id: &PartitionId) -> AppResult<String> {
        Ok(self.node_addr())
    }

    async fn get_replica_addrs(&self, _partition_id: &PartitionId) -> AppResult<Vec<String>> {
        Ok(vec![self.node_addr()])
    }

    async fn advertise_consumer(
        &self,
        topic: &str,
        consumer_group: &str,
        consumer_id: &str,
        _ttl: Duration,
    ) -> AppResult<()> {
        let mut consumers = self.consumers.lock();
        let group = consumers
            .entry((topic.to_string(), consumer_group.to_string()))
            .or_default();
        if !group.iter().any(|id| id == consumer_id) {
            debug!(topic, consumer_group, consumer_id, "consumer advertised");
            group.push(consumer_id.to_string());
        }
        Ok(())
    }

    async fn get_consumers(&self, topic: &str, consumer_group: &str) -> AppResult<Vec<String>> {
        let consumers = self.consumers.lock();
        Ok(consumers
            .get(&(topic.to_string(), consumer_group.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn create_topic(&self, meta: TopicMeta) -> AppResult<()> {
        let topic = meta.topic.clone();
        let client = self.connection_manager.client().await?;
        client
            .create_topic(meta)
            .await
            .map_err(|e| local_topic_error(e, &topic))
    }

    async fn get_topic(&self, topic: &str) -> AppResult<TopicMeta> {
        let client = self.connection_manager.client().await?;
        client
            .get_topic(topic)
            .await
            .map_err(|e| local_topic_error(e, topic))
    }
}
