use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace};

use super::consumer::{new_consumer, ConsumerHandle, ConsumerStream};
use super::filter::{AcceptAll, MessageFilter};
use super::registry::ConsumerRegistry;
use crate::log::{InMemoryMessageLog, MessageLog};
use crate::message::{ClientId, Message, Offset, PartitionId};
use crate::service::Shutdown;
use crate::{AppError, AppResult};

/// Owns the log of one partition and fans its appends out to the registered
/// consumers.
///
/// Every append posts a wake signal on a capacity-1 dirty channel. A
/// background task consumes the signal and wakes every consumer, and each
/// consumer drains its own cursor. Signals coalesce, so a burst of appends
/// costs one wake-up per consumer, and a pending signal always implies the
/// next drain sees every message appended so far.
///
/// Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct Partition {
    partition_id: PartitionId,
    log: Arc<dyn MessageLog>,
    registry: Arc<ConsumerRegistry>,
    dirty_tx: mpsc::Sender<()>,
    notify_shutdown: broadcast::Sender<()>,
    next_handle_id: AtomicU64,
    stopped: AtomicBool,
}

impl Partition {
    pub fn new(partition_id: PartitionId, log: Arc<dyn MessageLog>) -> Self {
        let registry = Arc::new(ConsumerRegistry::new(partition_id.clone()));
        let (dirty_tx, dirty_rx) = mpsc::channel(1);
        let (notify_shutdown, _) = broadcast::channel(1);

        tokio::spawn(run_wake_loop(
            partition_id.clone(),
            registry.clone(),
            dirty_rx,
            Shutdown::listen(&notify_shutdown),
        ));

        Partition {
            partition_id,
            log,
            registry,
            dirty_tx,
            notify_shutdown,
            next_handle_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn new_in_memory(partition_id: PartitionId) -> Self {
        Self::new(partition_id, Arc::new(InMemoryMessageLog::new()))
    }

    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    pub fn log(&self) -> &Arc<dyn MessageLog> {
        &self.log
    }

    /// Appends the message and returns its offset once the log acknowledged
    /// the write.
    pub async fn append(&self, message: Message) -> AppResult<Offset> {
        if self.is_stopped() {
            return Err(AppError::PartitionStopped(self.partition_id.clone()));
        }
        let receipt = self.log.append(message);
        receipt.done().await;
        let _ = self.dirty_tx.try_send(());
        let offset = receipt.read()?;
        trace!(partition = %self.partition_id, offset, "message appended");
        Ok(offset)
    }

    /// Registers a consumer that receives every message appended from now
    /// on. A live consumer with the same client id is terminated with
    /// `DuplicateClientId`.
    pub fn register_consumer(
        &self,
        client_id: ClientId,
        stream: Box<dyn ConsumerStream>,
    ) -> AppResult<ConsumerHandle> {
        self.register_consumer_with_filter(client_id, stream, Box::new(AcceptAll))
    }

    pub fn register_consumer_with_filter(
        &self,
        client_id: ClientId,
        stream: Box<dyn ConsumerStream>,
        filter: Box<dyn MessageFilter>,
    ) -> AppResult<ConsumerHandle> {
        if self.is_stopped() {
            return Err(AppError::PartitionStopped(self.partition_id.clone()));
        }
        let cursor = self.log.cursor_end()?;
        let handle_id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let (entry, handle, drain) = new_consumer(
            self.partition_id.clone(),
            client_id.clone(),
            handle_id,
            cursor,
            filter,
            stream,
            self.registry.clone(),
        );
        self.registry.register(client_id.clone(), entry)?;
        tokio::spawn(drain.run());
        debug!(
            partition = %self.partition_id,
            client = %client_id,
            handle = handle_id,
            "consumer registered"
        );
        Ok(handle)
    }

    /// Removes the consumer if `handle_id` is still the registered
    /// generation for `client_id`. Idempotent.
    pub fn unregister_consumer(&self, client_id: &ClientId, handle_id: u64, err: Option<AppError>) {
        self.registry.unregister(client_id, handle_id, err);
    }

    pub fn consumer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Terminates every consumer with `PartitionStopped` and shuts the wake
    /// loop down. Further appends and registrations fail.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.close();
        let _ = self.notify_shutdown.send(());
        info!(partition = %self.partition_id, "partition stopped");
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_wake_loop(
    partition_id: PartitionId,
    registry: Arc<ConsumerRegistry>,
    mut dirty_rx: mpsc::Receiver<()>,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            dirty = dirty_rx.recv() => {
                if dirty.is_none() {
                    break;
                }
                registry.wake_all();
            }
        }
    }
    registry.close();
    debug!(partition = %partition_id, "partition wake loop exited");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::message::MessageWithOffset;
    use crate::partition::consumer::MAX_DRAIN_BATCH;
    use crate::partition::PredicateFilter;

    const WAIT: Duration = Duration::from_secs(5);

    fn consumer_channel() -> (
        Box<dyn ConsumerStream>,
        mpsc::Receiver<Vec<MessageWithOffset>>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        (Box::new(tx), rx)
    }

    async fn recv_offsets(
        rx: &mut mpsc::Receiver<Vec<MessageWithOffset>>,
        count: usize,
    ) -> Vec<Offset> {
        let mut offsets = Vec::new();
        while offsets.len() < count {
            let batch = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            offsets.extend(batch.into_iter().map(|m| m.offset));
        }
        offsets
    }

    fn message(i: i64) -> Message {
        Message::new(format!("k{}", i), format!("v{}", i))
    }

    #[tokio::test]
    async fn test_consumer_receives_appends_in_order() {
        let partition = Partition::new_in_memory(PartitionId::new("topic", 0));
        let (stream, mut rx) = consumer_channel();
        let _handle = partition
            .register_consumer(ClientId::new("group", "c1"), stream)
            .unwrap();

        for i in 0..20 {
            assert_eq!(partition.append(message(i)).await.unwrap(), i);
        }
        let offsets = recv_offsets(&mut rx, 20).await;
        assert_eq!(offsets, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_new_consumer_skips_history() {
        let partition = Partition::new_in_memory(PartitionId::new("topic", 0));
        for i in 0..5 {
            partition.append(message(i)).await.unwrap();
        }
        let (stream, mut rx) = consumer_channel();
        let _handle = partition
            .register_consumer(ClientId::new("group", "late"), stream)
            .unwrap();
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        partition.append(message(5)).await.unwrap();
        let batch = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, 5);
        assert_eq!(batch[0].message, message(5));
    }

    #[tokio::test]
    async fn test_backlog_is_drained_in_bounded_batches() {
        let partition = Partition::new_in_memory(PartitionId::new("topic", 0));
        let (stream, mut rx) = consumer_channel();
        let _handle = partition
            .register_consumer(ClientId::new("group", "lagging"), stream)
            .unwrap();

        // written behind the coordinator's back, so nothing wakes the consumer
        let backlog = 2 * MAX_DRAIN_BATCH as i64 + 100;
        for i in 0..backlog {
            partition.log().append(message(i)).done().await;
        }
        partition.append(message(backlog)).await.unwrap();

        let mut offsets = Vec::new();
        while offsets.len() < backlog as usize + 1 {
            let batch = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert!(batch.len() <= MAX_DRAIN_BATCH);
            offsets.extend(batch.into_iter().map(|m| m.offset));
        }
        assert_eq!(offsets, (0..=backlog).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_duplicate_client_id_evicts_previous_consumer() {
        let partition = Partition::new_in_memory(PartitionId::new("topic", 0));
        let client_id = ClientId::new("group", "c1");

        let (first_stream, _first_rx) = consumer_channel();
        let first = partition
            .register_consumer(client_id.clone(), first_stream)
            .unwrap();
        let (second_stream, mut second_rx) = consumer_channel();
        let second = partition
            .register_consumer(client_id.clone(), second_stream)
            .unwrap();
        assert_ne!(first.id(), second.id());

        let err = timeout(WAIT, first.wait()).await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::DuplicateClientId(id) if id == client_id));
        assert_eq!(partition.consumer_count(), 1);

        partition.append(message(0)).await.unwrap();
        assert_eq!(recv_offsets(&mut second_rx, 1).await, vec![0]);
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_new_generation() {
        let partition = Partition::new_in_memory(PartitionId::new("topic", 0));
        let client_id = ClientId::new("group", "c1");

        let (first_stream, _first_rx) = consumer_channel();
        let first = partition
            .register_consumer(client_id.clone(), first_stream)
            .unwrap();
        let stale_id = first.id();
        let (second_stream, _second_rx) = consumer_channel();
        let second = partition
            .register_consumer(client_id.clone(), second_stream)
            .unwrap();

        partition.unregister_consumer(&client_id, stale_id, None);
        assert_eq!(partition.consumer_count(), 1);

        partition.unregister_consumer(&client_id, second.id(), None);
        partition.unregister_consumer(&client_id, second.id(), None);
        assert_eq!(partition.consumer_count(), 0);
        assert!(timeout(WAIT, second.wait()).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_failed_stream_unregisters_consumer() {
        let partition = Partition::new_in_memory(PartitionId::new("topic", 0));
        let (stream, rx) = consumer_channel();
        let handle = partition
            .register_consumer(ClientId::new("group", "gone"), stream)
            .unwrap();
        drop(rx);

        partition.append(message(0)).await.unwrap();
        let err = timeout(WAIT, handle.wait()).await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::ChannelSendError(_)));
        assert_eq!(partition.consumer_count(), 0);

        // appends keep working for everyone else
        assert_eq!(partition.append(message(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_filtered_consumer() {
        let partition = Partition::new_in_memory(PartitionId::new("topic", 0));
        let (stream, mut rx) = consumer_channel();
        let _handle = partition
            .register_consumer_with_filter(
                ClientId::new("group", "even"),
                stream,
                Box::new(PredicateFilter(|m: &MessageWithOffset| m.offset % 2 == 0)),
            )
            .unwrap();

        for i in 0..10 {
            partition.append(message(i)).await.unwrap();
        }
        let offsets = recv_offsets(&mut rx, 5).await;
        assert_eq!(offsets, vec![0, 2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn test_stop_terminates_consumers() {
        let partition = Partition::new_in_memory(PartitionId::new("topic", 3));
        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (stream, rx) = consumer_channel();
            receivers.push(rx);
            handles.push(
                partition
                    .register_consumer(ClientId::new("group", format!("c{}", i)), stream)
                    .unwrap(),
            );
        }

        partition.stop();
        partition.stop();
        for handle in handles {
            let err = timeout(WAIT, handle.wait()).await.unwrap().unwrap_err();
            assert!(matches!(err, AppError::PartitionStopped(_)));
        }
        assert_eq!(partition.consumer_count(), 0);
        assert!(matches!(
            partition.append(message(0)).await,
            Err(AppError::PartitionStopped(_))
        ));
        let (stream, _rx) = consumer_channel();
        assert!(matches!(
            partition.register_consumer(ClientId::new("group", "late"), stream),
            Err(AppError::PartitionStopped(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_reach_every_consumer() {
        let partition = Arc::new(Partition::new_in_memory(PartitionId::new("topic", 0)));
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (tx, rx) = mpsc::channel(1024);
            partition
                .register_consumer(ClientId::new("group", format!("c{}", i)), Box::new(tx))
                .unwrap();
            receivers.push(rx);
        }

        let mut producers = Vec::new();
        for p in 0..4 {
            let partition = partition.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..25 {
                    partition.append(message(p * 100 + i)).await.unwrap();
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        for mut rx in receivers {
            let offsets = recv_offsets(&mut rx, 100).await;
            assert_eq!(offsets, (0..100).collect::<Vec<_>>());
        }
    }
}
