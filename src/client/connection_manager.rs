use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::client::{Dialer, Discovery, NodeClient};
use crate::message::PartitionId;
use crate::{AppError, AppResult};

/// Hands out node clients for reading and writing partitions.
#[async_trait]
pub trait ConnectionManager: Send + Sync + Debug {
    async fn get_read_client(&self, partition_id: &PartitionId) -> AppResult<Arc<dyn NodeClient>>;

    async fn get_write_client(&self, partition_id: &PartitionId)
        -> AppResult<Arc<dyn NodeClient>>;
}

#[derive(Debug, Clone)]
struct ConnectedClient {
    addr: String,
    client: Arc<dyn NodeClient>,
}

/// Resolves partitions through [`Discovery`] and caches one client per
/// partition and direction.
///
/// Reads go to a random replica; the cached read client is kept while it is
/// live. Writes go to the current leader; a cached write client is replaced
/// once the leader moves or the client shuts down.
#[derive(Debug)]
pub struct DiscoveryConnectionManager {
    discovery: Arc<dyn Discovery>,
    dialer: Arc<dyn Dialer>,
    read_clients: DashMap<PartitionId, ConnectedClient>,
    write_clients: DashMap<PartitionId, ConnectedClient>,
}

impl DiscoveryConnectionManager {
    pub fn new(discovery: Arc<dyn Discovery>, dialer: Arc<dyn Dialer>) -> Self {
        DiscoveryConnectionManager {
            discovery,
            dialer,
            read_clients: DashMap::new(),
            write_clients: DashMap::new(),
        }
    }

    /// Installs a freshly dialed client unless a racing caller already put a
    /// usable one in place. The losing client is closed after the map entry
    /// is released.
    async fn install<F>(
        cache: &DashMap<PartitionId, ConnectedClient>,
        partition_id: &PartitionId,
        dialed: ConnectedClient,
        usable: F,
    ) -> Arc<dyn NodeClient>
    where
        F: Fn(&ConnectedClient) -> bool,
    {
        let (installed, to_close) = match cache.entry(partition_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if usable(occupied.get()) {
                    (occupied.get().client.clone(), dialed.client)
                } else {
                    let installed = dialed.client.clone();
                    let superseded = occupied.insert(dialed);
                    info!(
                        partition = %partition_id,
                        old = %superseded.addr,
                        new = %occupied.get().addr,
                        "replaced node client"
                    );
                    (installed, superseded.client)
                }
            }
            Entry::Vacant(vacant) => {
                let installed = dialed.client.clone();
                vacant.insert(dialed);
                return installed;
            }
        };
        to_close.close().await;
        installed
    }
}

#[async_trait]
impl ConnectionManager for DiscoveryConnectionManager {
    async fn get_read_client(&self, partition_id: &PartitionId) -> AppResult<Arc<dyn NodeClient>> {
        if let Some(cached) = self.read_clients.get(partition_id) {
            if !cached.client.is_shutdown() {
                return Ok(cached.client.clone());
            }
        }

        let replicas = self.discovery.get_replica_addrs(partition_id).await?;
        let addr = replicas
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| AppError::NoNodeAvailable(partition_id.clone()))?;
        debug!(partition = %partition_id, addr = %addr, "dialing read replica");
        let client = self.dialer.dial(&addr).await?;
        Ok(Self::install(
            &self.read_clients,
            partition_id,
            ConnectedClient { addr, client },
            |existing| !existing.client.is_shutdown(),
        )
        .await)
    }

    async fn get_write_client(
        &self,
        partition_id: &PartitionId,
    ) -> AppResult<Arc<dyn NodeClient>> {
        let leader = self.discovery.get_leader_addr(partition_id).await?;
        if let Some(cached) = self.write_clients.get(partition_id) {
            if cached.addr == leader && !cached.client.is_shutdown() {
                return Ok(cached.client.clone());
            }
        }

        debug!(partition = %partition_id, addr = %leader, "dialing leader");
        let client = self.dialer.dial(&leader).await?;
        let dialed = ConnectedClient {
            addr: leader.clone(),
            client,
        };
        Ok(Self::install(&self.write_clients, partition_id, dialed, |existing| {
            existing.addr == leader && !existing.client.is_shutdown()
        })
        .await)
    }
}

/// Uses one node for every partition; the client is redialed once it shuts
/// down.
#[derive(Debug)]
pub struct SingleAddrConnectionManager {
    addr: String,
    dialer: Arc<dyn Dialer>,
    client: Mutex<Option<Arc<dyn NodeClient>>>,
}

impl SingleAddrConnectionManager {
    pub fn new(addr: impl Into<String>, dialer: Arc<dyn Dialer>) -> Self {
        SingleAddrConnectionManager {
            addr: addr.into(),
            dialer,
            client: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn client(&self) -> AppResult<Arc<dyn NodeClient>> {
        let mut cached = self.client.lock().await;
        if let Some(client) = cached.as_ref() {
            if !client.is_shutdown() {
                return Ok(client.clone());
            }
        }
        let client = self.dialer.dial(&self.addr).await?;
        *cached = Some(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl ConnectionManager for SingleAddrConnectionManager {
    async fn get_read_client(&self, _partition_id: &PartitionId) -> AppResult<Arc<dyn NodeClient>> {
        self.client().await
    }

    async fn get_write_client(
        &self,
        _partition_id: &PartitionId,
    ) -> AppResult<Arc<dyn NodeClient>> {
        self.client().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::RwLock;

    use super::*;
    use crate::client::test_util::{FakeDialer, FakeNode};
    use crate::message::TopicMeta;

    /// Discovery with a movable leader.
    #[derive(Debug)]
    struct StaticDiscovery {
        leader: RwLock<String>,
        replicas: Vec<String>,
    }

    #[async_trait]
    impl Discovery for StaticDiscovery {
        async fn advertise_node_addr(&self, _addr: &str, _ttl: Duration) -> AppResult<()> {
            Ok(())
        }

        async fn get_all_node_addrs(&self) -> AppResult<Vec<String>> {
            Ok(self.replicas.clone())
        }

        async fn get_leader_addr(&self, _partition_id: &PartitionId) -> AppResult<String> {
            Ok(self.leader.read().clone())
        }

        async fn get_replica_addrs(&self, _partition_id: &PartitionId) -> AppResult<Vec<String>> {
            Ok(self.replicas.clone())
        }

        async fn advertise_consumer(
            &self,
            _topic: &str,
            _consumer_group: &str,
            _consumer_id: &str,
            _ttl: Duration,
        ) -> AppResult<()> {
            Ok(())
        }

        async fn get_consumers(&self, _topic: &str, _group: &str) -> AppResult<Vec<String>> {
            Ok(vec![])
        }

        async fn create_topic(&self, _meta: TopicMeta) -> AppResult<()> {
            Ok(())
        }

        async fn get_topic(&self, topic: &str) -> AppResult<TopicMeta> {
            Err(AppError::TopicNotFound(topic.to_string()))
        }
    }

    fn manager(
        replicas: &[&str],
    ) -> (
        Arc<StaticDiscovery>,
        Arc<FakeDialer>,
        DiscoveryConnectionManager,
    ) {
        let nodes = replicas
            .iter()
            .map(|addr| Arc::new(FakeNode::new(addr)))
            .collect();
        let dialer = Arc::new(FakeDialer::new(nodes));
        let discovery = Arc::new(StaticDiscovery {
            leader: RwLock::new(replicas[0].to_string()),
            replicas: replicas.iter().map(|addr| addr.to_string()).collect(),
        });
        let manager = DiscoveryConnectionManager::new(discovery.clone(), dialer.clone());
        (discovery, dialer, manager)
    }

    #[tokio::test]
    async fn test_read_client_is_cached_until_shutdown() {
        let (_, dialer, manager) = manager(&["a:1", "b:1", "c:1"]);
        let partition_id = PartitionId::new("orders", 0);

        let first = manager.get_read_client(&partition_id).await.unwrap();
        assert!(["a:1", "b:1", "c:1"].contains(&first.addr()));
        let second = manager.get_read_client(&partition_id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dialer.dials(), 1);

        first.close().await;
        let third = manager.get_read_client(&partition_id).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(!third.is_shutdown());
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_write_client_follows_the_leader() {
        let (discovery, dialer, manager) = manager(&["a:1", "b:1"]);
        let partition_id = PartitionId::new("orders", 1);

        let first = manager.get_write_client(&partition_id).await.unwrap();
        assert_eq!(first.addr(), "a:1");
        let again = manager.get_write_client(&partition_id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(dialer.dials(), 1);

        *discovery.leader.write() = "b:1".to_string();
        let moved = manager.get_write_client(&partition_id).await.unwrap();
        assert_eq!(moved.addr(), "b:1");
        // the superseded client is closed once the new one is installed
        assert!(first.is_shutdown());
        assert!(!moved.is_shutdown());
    }

    /// Holds every dial until `parties` dials are in flight.
    #[derive(Debug)]
    struct GatedDialer {
        inner: FakeDialer,
        gate: tokio::sync::Barrier,
        dialed: parking_lot::Mutex<Vec<Arc<dyn NodeClient>>>,
    }

    #[async_trait]
    impl Dialer for GatedDialer {
        async fn dial(&self, addr: &str) -> AppResult<Arc<dyn NodeClient>> {
            let client = self.inner.dial(addr).await?;
            self.dialed.lock().push(client.clone());
            self.gate.wait().await;
            Ok(client)
        }
    }

    #[tokio::test]
    async fn test_racing_dial_closes_the_losing_client() {
        let dialer = Arc::new(GatedDialer {
            inner: FakeDialer::single(Arc::new(FakeNode::new("a:1"))),
            gate: tokio::sync::Barrier::new(2),
            dialed: parking_lot::Mutex::new(Vec::new()),
        });
        let discovery = Arc::new(StaticDiscovery {
            leader: RwLock::new("a:1".to_string()),
            replicas: vec!["a:1".to_string()],
        });
        let manager = DiscoveryConnectionManager::new(discovery, dialer.clone());
        let partition_id = PartitionId::new("orders", 0);

        // both callers miss the cache and dial before either installs
        let (first, second) = tokio::join!(
            manager.get_write_client(&partition_id),
            manager.get_write_client(&partition_id)
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.is_shutdown());

        let dialed = dialer.dialed.lock().clone();
        assert_eq!(dialed.len(), 2);
        let closed: Vec<_> = dialed.iter().filter(|client| client.is_shutdown()).collect();
        assert_eq!(closed.len(), 1);
        assert!(!Arc::ptr_eq(closed[0], &first));

        // the winner stays cached
        let again = manager.get_write_client(&partition_id).await.unwrap();
        assert!(Arc::ptr_eq(&again, &first));
        assert_eq!(dialer.inner.dials(), 2);
    }

    #[tokio::test]
    async fn test_clients_are_cached_per_partition() {
        let (_, dialer, manager) = manager(&["a:1"]);
        let p0 = manager
            .get_write_client(&PartitionId::new("orders", 0))
            .await
            .unwrap();
        let p1 = manager
            .get_write_client(&PartitionId::new("orders", 1))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&p0, &p1));
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_no_replica_is_an_error() {
        let dialer = Arc::new(FakeDialer::new(vec![]));
        let discovery = Arc::new(StaticDiscovery {
            leader: RwLock::new(String::new()),
            replicas: vec![],
        });
        let manager = DiscoveryConnectionManager::new(discovery, dialer);
        assert!(matches!(
            manager.get_read_client(&PartitionId::new("orders", 0)).await,
            Err(AppError::NoNodeAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_single_addr_redials_after_shutdown() {
        let node = Arc::new(FakeNode::new("a:1"));
        let dialer = Arc::new(FakeDialer::single(node));
        let manager = SingleAddrConnectionManager::new("a:1", dialer.clone());

        let read = manager
            .get_read_client(&PartitionId::new("orders", 0))
            .await
            .unwrap();
        let write = manager
            .get_write_client(&PartitionId::new("orders", 5))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&read, &write));

        read.close().await;
        let redialed = manager.client().await.unwrap();
        assert!(!redialed.is_shutdown());
        assert_eq!(dialer.dials(), 2);
    }
}
