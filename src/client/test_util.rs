//! In-process node fakes for client tests. A [`FakeNode`] wraps a real
//! [`NodeService`]; clients dialed to it see its errors the way they would
//! arrive over the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::{Dialer, MessageStream, NodeClient};
use crate::message::{MessageWithOffset, TopicMeta};
use crate::protocol::{PublishRequest, PublishResponse, SubscribeRequest};
use crate::service::NodeService;
use crate::{AppError, AppResult};

fn remote(err: AppError) -> AppError {
    AppError::Remote {
        code: err.code(),
        message: err.to_string(),
    }
}

#[derive(Debug)]
pub(crate) struct FakeNode {
    pub(crate) addr: String,
    pub(crate) service: Arc<NodeService>,
    failing_publishes: AtomicU32,
    publish_calls: AtomicU32,
}

impl FakeNode {
    pub(crate) fn new(addr: &str) -> Self {
        FakeNode {
            addr: addr.to_string(),
            service: Arc::new(NodeService::new()),
            failing_publishes: AtomicU32::new(0),
            publish_calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn with_topic(addr: &str, topic: &str, partitions: i32) -> Self {
        let node = FakeNode::new(addr);
        node.service
            .create_topic(TopicMeta::new(topic, partitions, 1))
            .unwrap();
        node
    }

    /// The next `count` publish calls fail like a dropped connection.
    pub(crate) fn fail_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    pub(crate) fn publish_calls(&self) -> u32 {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// Ends every open subscription by recreating the topic's partitions.
    pub(crate) fn restart_topic(&self, topic: &str) {
        let meta = self.service.get_topic(topic).unwrap();
        self.service.delete_topic(topic).unwrap();
        self.service.create_topic(meta).unwrap();
    }
}

#[derive(Debug)]
pub(crate) struct FakeClient {
    node: Arc<FakeNode>,
    shutdown: AtomicBool,
}

struct FakeStream {
    batches: mpsc::Receiver<Vec<MessageWithOffset>>,
}

#[async_trait]
impl MessageStream for FakeStream {
    async fn recv(&mut self) -> AppResult<Option<Vec<MessageWithOffset>>> {
        Ok(self.batches.recv().await)
    }
}

#[async_trait]
impl NodeClient for FakeClient {
    fn addr(&self) -> &str {
        &self.node.addr
    }

    async fn subscribe(&self, request: SubscribeRequest) -> AppResult<Box<dyn MessageStream>> {
        let (tx, rx) = mpsc::channel(16);
        self.node
            .service
            .subscribe(&request.partition_id, request.client_id, Box::new(tx))
            .map_err(remote)?;
        Ok(Box::new(FakeStream { batches: rx }))
    }

    async fn publish(&self, request: PublishRequest) -> AppResult<PublishResponse> {
        self.node.publish_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .node
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            self.shutdown.store(true, Ordering::SeqCst);
            return Err(AppError::ConnectionClosed(self.node.addr.clone()));
        }
        let offsets = self
            .node
            .service
            .publish(&request.partition_id, request.messages)
            .await
            .map_err(remote)?;
        Ok(PublishResponse { offsets })
    }

    async fn create_topic(&self, meta: TopicMeta) -> AppResult<()> {
        self.node.service.create_topic(meta).map_err(remote)
    }

    async fn get_topic(&self, topic: &str) -> AppResult<TopicMeta> {
        self.node.service.get_topic(topic).map_err(remote)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub(crate) struct FakeDialer {
    nodes: HashMap<String, Arc<FakeNode>>,
    dials: AtomicU32,
}

impl FakeDialer {
    pub(crate) fn new(nodes: Vec<Arc<FakeNode>>) -> Self {
        FakeDialer {
            nodes: nodes
                .into_iter()
                .map(|node| (node.addr.clone(), node))
                .collect(),
            dials: AtomicU32::new(0),
        }
    }

    pub(crate) fn single(node: Arc<FakeNode>) -> Self {
        FakeDialer::new(vec![node])
    }

    pub(crate) fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, addr: &str) -> AppResult<Arc<dyn NodeClient>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let node = self
            .nodes
            .get(addr)
            .ok_or_else(|| AppError::DetailedIoError(format!("connection refused: {}", addr)))?;
        Ok(Arc::new(FakeClient {
            node: node.clone(),
            shutdown: AtomicBool::new(false),
        }))
    }
}
