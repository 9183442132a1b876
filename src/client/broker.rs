use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ConnectionManager, MessageStream, RetryPolicy};
use crate::message::{
    hash_to_partition, ClientId, Message, MessageWithOffset, PartitionId, TopicMeta,
};
use crate::network::{RequestFrame, ResponseFrame};
use crate::protocol::{ErrorCode, PublishRequest, PublishResponse, SubscribeRequest};
use crate::{AppError, AppResult};

/// Client side view of one topic: fans subscriptions in from every
/// partition and routes published messages to their partitions.
#[derive(Debug)]
pub struct TopicBroker {
    meta: TopicMeta,
    client_id: ClientId,
    connection_manager: Arc<dyn ConnectionManager>,
    retry: RetryPolicy,
    subscription_buffer: usize,
    max_frame_size: usize,
}

/// Messages of every partition of a topic, merged.
///
/// Messages of one partition arrive in offset order; there is no order
/// across partitions. Stopping or dropping the subscription ends every
/// partition worker.
#[derive(Debug)]
pub struct Subscription {
    messages: mpsc::Receiver<MessageWithOffset>,
    done: CancellationToken,
}

impl Subscription {
    /// The next message, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<MessageWithOffset> {
        tokio::select! {
            biased;
            message = self.messages.recv() => message,
            _ = self.done.cancelled() => None,
        }
    }

    pub fn stop(&self) {
        self.done.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.done.is_cancelled()
    }
}

impl Stream for Subscription {
    type Item = MessageWithOffset;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

impl TopicBroker {
    pub fn new(
        meta: TopicMeta,
        client_id: ClientId,
        connection_manager: Arc<dyn ConnectionManager>,
        retry: RetryPolicy,
        subscription_buffer: usize,
        max_frame_size: usize,
    ) -> Self {
        TopicBroker {
            meta,
            client_id,
            connection_manager,
            retry,
            subscription_buffer,
            max_frame_size,
        }
    }

    pub fn topic(&self) -> &TopicMeta {
        &self.meta
    }

    /// Starts one worker per partition, each streaming from the node that
    /// serves the partition's reads. Must run inside a tokio runtime.
    pub fn subscribe(&self) -> AppResult<Subscription> {
        let (tx, rx) = mpsc::channel(self.subscription_buffer.max(1));
        let done = CancellationToken::new();

        let mut workers = JoinSet::new();
        for partition_id in self.meta.partition_ids() {
            let worker = SubscribeWorker {
                request: SubscribeRequest {
                    client_id: self.client_id.clone(),
                    partition_id,
                },
                connection_manager: self.connection_manager.clone(),
                retry: self.retry.clone(),
                messages: tx.clone(),
                done: done.clone(),
            };
            workers.spawn(worker.run());
        }
        drop(tx);

        let all_exited = done.clone();
        let topic = self.meta.topic.clone();
        tokio::spawn(async move {
            while workers.join_next().await.is_some() {}
            debug!(topic = %topic, "every subscription worker exited");
            all_exited.cancel();
        });

        info!(topic = %self.meta.topic, client = %self.client_id, "subscribed");
        Ok(Subscription { messages: rx, done })
    }

    /// Routes every message to its partition and writes each partition's
    /// share concurrently. Returns once all of them are appended.
    ///
    /// Keys are hashed and requests sized before anything is sent, so a bad
    /// key or a message too large for a frame fails the whole call without a
    /// network round trip. A partition's share goes out as consecutive
    /// requests when it does not fit in one frame. Failed writes are retried
    /// under the retry policy; a retried write may be appended twice.
    pub async fn publish(&self, messages: Vec<Message>) -> AppResult<()> {
        let mut per_partition: BTreeMap<i32, Vec<Message>> = BTreeMap::new();
        for message in messages {
            let partition = hash_to_partition(&message.key, self.meta.partitions)?;
            per_partition.entry(partition).or_default().push(message);
        }
        let mut requests = Vec::with_capacity(per_partition.len());
        for (partition, messages) in per_partition {
            let partition_id = self.meta.partition_id(partition);
            requests.push(split_publish(partition_id, messages, self.max_frame_size)?);
        }

        let mut writers = JoinSet::new();
        for partition_requests in requests {
            writers.spawn(publish_in_order(
                self.connection_manager.clone(),
                self.retry.clone(),
                partition_requests,
            ));
        }

        let mut first_error = None;
        while let Some(joined) = writers.join_next().await {
            let result = joined
                .map_err(|e| AppError::IllegalStateError(format!("publish task failed: {}", e)))
                .and_then(|written| written);
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Splits one partition's messages, in order, into requests that fit in a
/// frame of `max_frame_size` bytes together with their responses.
fn split_publish(
    partition_id: PartitionId,
    messages: Vec<Message>,
    max_frame_size: usize,
) -> AppResult<Vec<PublishRequest>> {
    let empty_len = RequestFrame::HEADER_SIZE + PublishRequest::encoded_len_of(&partition_id, &[]);
    let response_len = |count: usize| ResponseFrame::HEADER_SIZE + PublishResponse::encoded_len_for(count);

    let mut requests = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_len = empty_len;
    for message in messages {
        let message_len = message.encoded_len();
        let alone = (empty_len + message_len).max(response_len(1));
        if alone > max_frame_size {
            return Err(AppError::FrameTooLarge {
                size: alone,
                max: max_frame_size,
            });
        }
        if current_len + message_len > max_frame_size
            || response_len(current.len() + 1) > max_frame_size
        {
            requests.push(PublishRequest {
                partition_id: partition_id.clone(),
                messages: std::mem::take(&mut current),
            });
            current_len = empty_len;
        }
        current_len += message_len;
        current.push(message);
    }
    if !current.is_empty() {
        requests.push(PublishRequest {
            partition_id,
            messages: current,
        });
    }
    Ok(requests)
}

/// Errors that another attempt cannot fix. A frame that does not fit or
/// can not be parsed fails the same way every time.
fn is_permanent(err: &AppError) -> bool {
    match err {
        AppError::EmptyKey
        | AppError::InvalidValue(_)
        | AppError::InvalidRequest(_)
        | AppError::MalformedProtocol(_)
        | AppError::FrameTooLarge { .. }
        | AppError::TopicNotFound(_)
        | AppError::PartitionNotFound(_) => true,
        AppError::Remote { code, .. } => matches!(
            code,
            ErrorCode::EmptyKey
                | ErrorCode::InvalidValue
                | ErrorCode::InvalidRequest
                | ErrorCode::MalformedProtocol
                | ErrorCode::FrameTooLarge
                | ErrorCode::TopicNotFound
                | ErrorCode::PartitionNotFound
        ),
        _ => false,
    }
}

/// Writes the requests of one partition one after the other, so they are
/// appended in order.
async fn publish_in_order(
    connection_manager: Arc<dyn ConnectionManager>,
    retry: RetryPolicy,
    requests: Vec<PublishRequest>,
) -> AppResult<()> {
    for request in requests {
        publish_with_retry(connection_manager.clone(), retry.clone(), request).await?;
    }
    Ok(())
}

async fn publish_with_retry(
    connection_manager: Arc<dyn ConnectionManager>,
    retry: RetryPolicy,
    request: PublishRequest,
) -> AppResult<()> {
    let partition_id = request.partition_id.clone();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let result = match connection_manager.get_write_client(&partition_id).await {
            Ok(client) => client.publish(request.clone()).await,
            Err(err) => Err(err),
        };
        let err = match result {
            Ok(response) => {
                debug!(partition = %partition_id, offsets = ?response.offsets, "published");
                return Ok(());
            }
            Err(err) if is_permanent(&err) => return Err(err),
            Err(err) => err,
        };
        if !retry.should_retry(attempts) {
            error!(partition = %partition_id, attempts, error = %err, "giving up publish");
            return Err(AppError::RetriesExhausted {
                operation: format!("publish to {}", partition_id),
                attempts,
                cause: Box::new(err),
            });
        }
        let delay = retry.backoff(attempts);
        warn!(partition = %partition_id, attempts, error = %err, ?delay, "publish failed, retrying");
        sleep(delay).await;
    }
}

/// Streams one partition into the subscription's channel, reconnecting
/// after stream failures until the subscription is stopped.
struct SubscribeWorker {
    request: SubscribeRequest,
    connection_manager: Arc<dyn ConnectionManager>,
    retry: RetryPolicy,
    messages: mpsc::Sender<MessageWithOffset>,
    done: CancellationToken,
}

impl SubscribeWorker {
    async fn run(self) {
        let partition_id = self.request.partition_id.clone();
        let mut failures = 0u32;
        let mut stream: Option<Box<dyn MessageStream>> = None;
        loop {
            if self.done.is_cancelled() {
                break;
            }
            if stream.is_none() {
                match self.open().await {
                    Ok(opened) => stream = Some(opened),
                    Err(err) => {
                        if self.back_off(&mut failures, err).await {
                            continue;
                        }
                        break;
                    }
                }
            }
            let Some(active) = stream.as_mut() else {
                continue;
            };

            let received = tokio::select! {
                biased;
                _ = self.done.cancelled() => break,
                received = active.recv() => received,
            };
            match received {
                Ok(Some(batch)) => {
                    failures = 0;
                    if !self.forward(batch).await {
                        break;
                    }
                }
                Ok(None) => {
                    stream = None;
                    let err = AppError::ConnectionClosed(format!("stream of {}", partition_id));
                    if !self.back_off(&mut failures, err).await {
                        break;
                    }
                }
                Err(err) => {
                    stream = None;
                    if !self.back_off(&mut failures, err).await {
                        break;
                    }
                }
            }
        }
        debug!(partition = %partition_id, "subscription worker exited");
    }

    async fn open(&self) -> AppResult<Box<dyn MessageStream>> {
        let client = self
            .connection_manager
            .get_read_client(&self.request.partition_id)
            .await?;
        client.subscribe(self.request.clone()).await
    }

    /// Hands the batch to the subscription. False once the subscription is
    /// gone.
    async fn forward(&self, batch: Vec<MessageWithOffset>) -> bool {
        for message in batch {
            tokio::select! {
                biased;
                _ = self.done.cancelled() => return false,
                sent = self.messages.send(message) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Sleeps before the next attempt. False when the worker should exit
    /// instead.
    async fn back_off(&self, failures: &mut u32, err: AppError) -> bool {
        *failures += 1;
        let partition_id = &self.request.partition_id;
        if !self.retry.should_retry(*failures) {
            error!(partition = %partition_id, failures = *failures, error = %err, "giving up subscription");
            return false;
        }
        let delay = self.retry.backoff(*failures);
        warn!(partition = %partition_id, error = %err, ?delay, "subscription interrupted, reconnecting");
        tokio::select! {
            _ = self.done.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::client::test_util::{FakeDialer, FakeNode};
    use crate::client::SingleAddrConnectionManager;

    const ADDR: &str = "node-0:10000";

    fn broker(node: Arc<FakeNode>, partitions: i32, retry: RetryPolicy) -> TopicBroker {
        limited_broker(node, partitions, retry, 1024 * 1024)
    }

    fn limited_broker(
        node: Arc<FakeNode>,
        partitions: i32,
        retry: RetryPolicy,
        max_frame_size: usize,
    ) -> TopicBroker {
        let dialer = Arc::new(FakeDialer::single(node));
        TopicBroker::new(
            TopicMeta::new("orders", partitions, 1),
            ClientId::new("billing", "c1"),
            Arc::new(SingleAddrConnectionManager::new(ADDR, dialer)),
            retry,
            64,
            max_frame_size,
        )
    }

    fn messages(count: usize) -> Vec<Message> {
        (0..count)
            .map(|i| Message::new(format!("k{}", i), format!("v{}", i)))
            .collect()
    }

    async fn wait_registered(node: &FakeNode, partition_id: &PartitionId) {
        loop {
            let partition = node.service.partition(partition_id).unwrap();
            if partition.consumer_count() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::unbounded(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_publish_routes_by_key() {
        let node = Arc::new(FakeNode::with_topic(ADDR, "orders", 4));
        let broker = broker(node.clone(), 4, fast_retry());
        broker.publish(messages(100)).await.unwrap();

        let mut total = 0;
        for partition_id in broker.topic().partition_ids() {
            let partition = node.service.partition(&partition_id).unwrap();
            let mut cursor = partition.log().cursor_start().unwrap();
            let mut last = -1;
            while cursor.has_next() {
                let stored = cursor.next().unwrap();
                assert!(stored.offset > last);
                last = stored.offset;
                assert_eq!(
                    hash_to_partition(stored.key(), 4).unwrap(),
                    partition_id.partition
                );
                total += 1;
            }
        }
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn test_empty_key_fails_before_sending() {
        let node = Arc::new(FakeNode::with_topic(ADDR, "orders", 4));
        let broker = broker(node.clone(), 4, fast_retry());
        let mut batch = messages(3);
        batch.push(Message::new("", "no key"));
        assert!(matches!(
            broker.publish(batch).await,
            Err(AppError::EmptyKey)
        ));
        assert_eq!(node.publish_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_retries_connection_failures() {
        let node = Arc::new(FakeNode::with_topic(ADDR, "orders", 1));
        node.fail_publishes(3);
        let broker = broker(node.clone(), 1, RetryPolicy::default());
        broker.publish(messages(5)).await.unwrap();
        assert_eq!(node.publish_calls(), 4);

        let partition = node.service.partition(&PartitionId::new("orders", 0)).unwrap();
        assert_eq!(partition.log().last_offset().unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_publish_exhausts_retries() {
        let node = Arc::new(FakeNode::with_topic(ADDR, "orders", 1));
        node.fail_publishes(10);
        let broker = broker(
            node.clone(),
            1,
            RetryPolicy::fixed(3, Duration::from_millis(100)),
        );
        match broker.publish(messages(1)).await {
            Err(AppError::RetriesExhausted { attempts, cause, .. }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*cause, AppError::ConnectionClosed(_)));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(node.publish_calls(), 3);
    }

    #[tokio::test]
    async fn test_publish_is_split_to_fit_frames() {
        let node = Arc::new(FakeNode::with_topic(ADDR, "orders", 1));
        let broker = limited_broker(node.clone(), 1, fast_retry(), 1024);
        let batch: Vec<Message> = (0..150)
            .map(|i| Message::new("a", format!("{}", i)))
            .collect();
        broker.publish(batch).await.unwrap();
        // at most 126 offsets fit in a 1024 byte response
        assert_eq!(node.publish_calls(), 2);

        let partition = node.service.partition(&PartitionId::new("orders", 0)).unwrap();
        let mut cursor = partition.log().cursor_start().unwrap();
        let mut expected = 0;
        while cursor.has_next() {
            let stored = cursor.next().unwrap();
            assert_eq!(stored.offset, expected);
            assert_eq!(stored.value().as_ref(), format!("{}", expected).as_bytes());
            expected += 1;
        }
        assert_eq!(expected, 150);
    }

    #[tokio::test]
    async fn test_message_larger_than_a_frame_is_not_sent() {
        let node = Arc::new(FakeNode::with_topic(ADDR, "orders", 2));
        let broker = limited_broker(node.clone(), 2, fast_retry(), 1024);
        let mut batch = messages(10);
        batch.push(Message::new("big", vec![0u8; 2048]));
        assert!(matches!(
            broker.publish(batch).await,
            Err(AppError::FrameTooLarge { max: 1024, .. })
        ));
        assert_eq!(node.publish_calls(), 0);
    }

    #[test]
    fn test_frame_errors_are_permanent() {
        assert!(is_permanent(&AppError::FrameTooLarge {
            size: 4096,
            max: 1024
        }));
        assert!(is_permanent(&AppError::MalformedProtocol("bad count".into())));
        assert!(is_permanent(&AppError::Remote {
            code: ErrorCode::FrameTooLarge,
            message: String::new(),
        }));
        assert!(!is_permanent(&AppError::ConnectionClosed("node-0".into())));
        assert!(!is_permanent(&AppError::Remote {
            code: ErrorCode::PartitionStopped,
            message: String::new(),
        }));
    }

    #[tokio::test]
    async fn test_unknown_partition_is_not_retried() {
        // the broker believes in more partitions than the node has
        let node = Arc::new(FakeNode::with_topic(ADDR, "orders", 1));
        let broker = broker(node.clone(), 16, fast_retry());
        let result = broker.publish(messages(32)).await;
        assert!(matches!(
            result,
            Err(AppError::Remote {
                code: ErrorCode::PartitionNotFound,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_subscription_merges_partitions() {
        let node = Arc::new(FakeNode::with_topic(ADDR, "orders", 4));
        let broker = broker(node.clone(), 4, fast_retry());
        let mut subscription = broker.subscribe().unwrap();
        // let every worker register before publishing
        for partition_id in broker.topic().partition_ids() {
            wait_registered(&node, &partition_id).await;
        }

        broker.publish(messages(40)).await.unwrap();
        let mut keys = HashSet::new();
        while keys.len() < 40 {
            let message = timeout(Duration::from_secs(5), subscription.recv())
                .await
                .unwrap()
                .unwrap();
            keys.insert(message.key().clone());
        }
        assert_eq!(keys.len(), 40);
    }

    #[tokio::test]
    async fn test_stop_ends_the_subscription() {
        let node = Arc::new(FakeNode::with_topic(ADDR, "orders", 2));
        let broker = broker(node.clone(), 2, fast_retry());
        let mut subscription = broker.subscribe().unwrap();
        subscription.stop();
        assert!(subscription.is_stopped());
        assert!(timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_all_workers_giving_up_fires_done() {
        // the node does not know the topic, so every subscribe attempt fails
        let node = Arc::new(FakeNode::new(ADDR));
        let broker = broker(node, 3, RetryPolicy::fixed(2, Duration::from_millis(1)));
        let mut subscription = broker.subscribe().unwrap();
        let ended = timeout(Duration::from_secs(5), subscription.next())
            .await
            .unwrap();
        assert!(ended.is_none());
        timeout(Duration::from_secs(5), subscription.done.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_resubscribes_after_stream_ends() {
        let node = Arc::new(FakeNode::with_topic(ADDR, "orders", 1));
        let broker = broker(node.clone(), 1, fast_retry());
        let mut subscription = broker.subscribe().unwrap();
        let partition_id = PartitionId::new("orders", 0);

        wait_registered(&node, &partition_id).await;
        broker.publish(vec![Message::new("k1", "before")]).await.unwrap();
        let first = timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.value().as_ref(), b"before");

        node.restart_topic("orders");
        wait_registered(&node, &partition_id).await;
        broker.publish(vec![Message::new("k1", "after")]).await.unwrap();
        let second = timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.value().as_ref(), b"after");
    }
}
