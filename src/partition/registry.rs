use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::consumer::ConsumerEntry;
use crate::message::{ClientId, PartitionId};
use crate::{AppError, AppResult};

#[derive(Debug, Default)]
struct RegistryState {
    consumers: HashMap<ClientId, ConsumerEntry>,
    closed: bool,
}

/// The live consumers of one partition, at most one per client id.
#[derive(Debug)]
pub(crate) struct ConsumerRegistry {
    partition_id: PartitionId,
    state: RwLock<RegistryState>,
}

impl ConsumerRegistry {
    pub(crate) fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Installs `entry`, evicting any live consumer with the same client id.
    /// The eviction and the insert happen under one write lock, so the old
    /// consumer is terminated before the new one can receive anything.
    pub(crate) fn register(&self, client_id: ClientId, entry: ConsumerEntry) -> AppResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(AppError::PartitionStopped(self.partition_id.clone()));
        }
        if let Some(evicted) = state.consumers.remove(&client_id) {
            info!(
                partition = %self.partition_id,
                client = %client_id,
                handle = evicted.handle_id,
                "evicting consumer with duplicate client id"
            );
            evicted.stop(Some(AppError::DuplicateClientId(client_id.clone())));
        }
        // catches appends that raced with the creation of the new cursor
        entry.wake();
        state.consumers.insert(client_id, entry);
        Ok(())
    }

    /// Removes the consumer registered under `client_id`, provided it is
    /// still the generation `handle_id`. Later registrations with the same
    /// client id are left alone.
    pub(crate) fn unregister(&self, client_id: &ClientId, handle_id: u64, err: Option<AppError>) {
        let removed = {
            let mut state = self.state.write();
            match state.consumers.get(client_id) {
                Some(entry) if entry.handle_id == handle_id => state.consumers.remove(client_id),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            debug!(
                partition = %self.partition_id,
                client = %client_id,
                handle = handle_id,
                "consumer unregistered"
            );
            entry.stop(err);
        }
    }

    pub(crate) fn wake_all(&self) {
        let state = self.state.read();
        for entry in state.consumers.values() {
            entry.wake();
        }
    }

    /// Refuses further registrations and stops every consumer with
    /// `PartitionStopped`.
    pub(crate) fn close(&self) {
        let drained: Vec<ConsumerEntry> = {
            let mut state = self.state.write();
            state.closed = true;
            state.consumers.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.stop(Some(AppError::PartitionStopped(self.partition_id.clone())));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.read().consumers.len()
    }
}
