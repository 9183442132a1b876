//! Partition log.
//!
//! A partition stores its messages in a [`MessageLog`]: an append-only
//! sequence indexed by offset. Producers append and get a [`WriteReceipt`]
//! back; consumers read through independent [`MessageLogCursor`]s, so readers
//! at different positions never block each other or the writer.
//!
//! [`InMemoryMessageLog`] is the reference implementation. A durable log plugs
//! in behind the same trait.

pub use memory_log::InMemoryMessageLog;
pub use receipt::{write_receipt, ReceiptWriter, WriteReceipt};

mod memory_log;
mod receipt;

use std::fmt::Debug;

use crate::message::{Message, MessageWithOffset, Offset};

pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("offset {offset} is out of bounds (max offset {max_offset})")]
    OffsetOutOfBounds { offset: Offset, max_offset: Offset },

    #[error("empty log")]
    EmptyLog,

    #[error("receipt has not yet been written")]
    ReceiptNotWritten,

    #[error("log storage error: {0}")]
    Storage(String),
}

/// Forward cursor over a log. A cursor has a single owner; it is never shared
/// between tasks.
pub trait MessageLogCursor: Send + Debug {
    /// True if the cursor is positioned on a stored message.
    fn has_next(&self) -> bool;

    /// Returns the message at the cursor and moves one offset forward. Fails
    /// with `OffsetOutOfBounds` past the end; callers re-check `has_next`.
    fn next(&mut self) -> LogResult<MessageWithOffset>;

    fn pos(&self) -> Offset;

    fn seek(&mut self, offset: Offset) -> LogResult<()>;
}

pub trait MessageLog: Send + Sync + Debug {
    /// Appends the message. Offsets are unique, strictly increasing and
    /// gap-free even with concurrent appenders.
    fn append(&self, message: Message) -> WriteReceipt;

    fn cursor_start(&self) -> LogResult<Box<dyn MessageLogCursor>>;

    /// Cursor one past the last message, i.e. at the next offset to be
    /// written. On an empty log this is offset 0.
    fn cursor_end(&self) -> LogResult<Box<dyn MessageLogCursor>>;

    fn cursor_at(&self, offset: Offset) -> LogResult<Box<dyn MessageLogCursor>>;

    fn first_offset(&self) -> LogResult<Offset>;

    fn last_offset(&self) -> LogResult<Offset>;
}
