use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::filter::MessageFilter;
use super::registry::ConsumerRegistry;
use crate::log::MessageLogCursor;
use crate::message::{ClientId, MessageWithOffset, PartitionId};
use crate::{AppError, AppResult};

/// Outbound side of a subscription on the node. Sending fails once the
/// subscriber is gone.
#[async_trait]
pub trait ConsumerStream: Send {
    async fn send(&mut self, batch: Vec<MessageWithOffset>) -> AppResult<()>;
}

#[async_trait]
impl ConsumerStream for mpsc::Sender<Vec<MessageWithOffset>> {
    async fn send(&mut self, batch: Vec<MessageWithOffset>) -> AppResult<()> {
        mpsc::Sender::send(self, batch)
            .await
            .map_err(|_| AppError::ChannelSendError("consumer stream receiver dropped".into()))
    }
}

/// Registry side of a live consumer.
#[derive(Debug)]
pub(crate) struct ConsumerEntry {
    pub(crate) handle_id: u64,
    wake_tx: mpsc::Sender<()>,
    terminated: CancellationToken,
    done_tx: oneshot::Sender<Option<AppError>>,
}

impl ConsumerEntry {
    /// Posts a wake-up. A wake that is already pending absorbs this one.
    pub(crate) fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Terminates the consumer and reports `err` to its handle. `None` is a
    /// clean stop.
    pub(crate) fn stop(self, err: Option<AppError>) {
        self.terminated.cancel();
        drop(self.wake_tx);
        let _ = self.done_tx.send(err);
    }
}

/// Caller side of a registered consumer, used to wait for its termination.
#[derive(Debug)]
pub struct ConsumerHandle {
    client_id: ClientId,
    handle_id: u64,
    done_rx: oneshot::Receiver<Option<AppError>>,
}

impl ConsumerHandle {
    pub fn id(&self) -> u64 {
        self.handle_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Resolves once the consumer is terminated: `Ok(())` on a clean stop,
    /// the terminal error otherwise.
    pub async fn wait(self) -> AppResult<()> {
        match self.done_rx.await {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(AppError::IllegalStateError(format!(
                "consumer {} dropped without completion",
                self.client_id
            ))),
        }
    }
}

/// Builds the entry/handle pair of a new consumer plus the drain loop that
/// feeds its stream.
pub(crate) fn new_consumer(
    partition_id: PartitionId,
    client_id: ClientId,
    handle_id: u64,
    cursor: Box<dyn MessageLogCursor>,
    filter: Box<dyn MessageFilter>,
    stream: Box<dyn ConsumerStream>,
    registry: Arc<ConsumerRegistry>,
) -> (ConsumerEntry, ConsumerHandle, ConsumerDrain) {
    let (wake_tx, wake_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();
    let terminated = CancellationToken::new();
    let entry = ConsumerEntry {
        handle_id,
        wake_tx,
        terminated: terminated.clone(),
        done_tx,
    };
    let handle = ConsumerHandle {
        client_id: client_id.clone(),
        handle_id,
        done_rx,
    };
    let drain = ConsumerDrain {
        partition_id,
        client_id,
        handle_id,
        cursor,
        filter,
        stream,
        wake_rx,
        terminated,
        registry,
    };
    (entry, handle, drain)
}

/// Most messages read from the cursor for one `send`. A longer backlog is
/// drained over several sends without waiting for another wake-up.
pub(crate) const MAX_DRAIN_BATCH: usize = 512;

pub(crate) struct ConsumerDrain {
    partition_id: PartitionId,
    client_id: ClientId,
    handle_id: u64,
    cursor: Box<dyn MessageLogCursor>,
    filter: Box<dyn MessageFilter>,
    stream: Box<dyn ConsumerStream>,
    wake_rx: mpsc::Receiver<()>,
    terminated: CancellationToken,
    registry: Arc<ConsumerRegistry>,
}

impl ConsumerDrain {
    pub(crate) async fn run(mut self) {
        trace!(
            partition = %self.partition_id,
            client = %self.client_id,
            pos = self.cursor.pos(),
            "consumer drain loop started"
        );
        loop {
            if self.terminated.is_cancelled() {
                break;
            }
            if !self.cursor.has_next() {
                tokio::select! {
                    biased;
                    _ = self.terminated.cancelled() => break,
                    wake = self.wake_rx.recv() => {
                        if wake.is_none() {
                            break;
                        }
                    }
                }
            }

            let batch = match self.drain_cursor() {
                Ok(batch) => batch,
                Err(err) => {
                    self.fail(err);
                    break;
                }
            };
            if batch.is_empty() {
                continue;
            }

            let sent = tokio::select! {
                biased;
                _ = self.terminated.cancelled() => break,
                sent = self.stream.send(batch) => sent,
            };
            if let Err(err) = sent {
                self.fail(err);
                break;
            }
        }
        trace!(
            partition = %self.partition_id,
            client = %self.client_id,
            "consumer drain loop exited"
        );
    }

    fn drain_cursor(&mut self) -> AppResult<Vec<MessageWithOffset>> {
        let mut batch = Vec::new();
        let mut read = 0;
        while read < MAX_DRAIN_BATCH && self.cursor.has_next() {
            read += 1;
            let message = self.cursor.next()?;
            if self.filter.applies(&message) {
                batch.push(message);
            }
        }
        Ok(batch)
    }

    fn fail(&self, err: AppError) {
        debug!(
            partition = %self.partition_id,
            client = %self.client_id,
            error = %err,
            "consumer terminated"
        );
        self.registry
            .unregister(&self.client_id, self.handle_id, Some(err));
    }
}
