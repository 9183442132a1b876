use std::sync::Arc;

use parking_lot::RwLock;

use super::{write_receipt, LogError, LogResult, MessageLog, MessageLogCursor, WriteReceipt};
use crate::message::{Message, MessageWithOffset, Offset};

/// Reference log kept entirely in memory. Cloning shares the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessageLog {
    messages: Arc<RwLock<Vec<MessageWithOffset>>>,
}

impl InMemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, pos: Offset) -> LogResult<MessageWithOffset> {
        let messages = self.messages.read();
        let len = messages.len() as Offset;
        if pos < 0 || pos >= len {
            return Err(LogError::OffsetOutOfBounds {
                offset: pos,
                max_offset: len - 1,
            });
        }
        Ok(messages[pos as usize].clone())
    }

    fn cursor(&self, pos: Offset) -> Box<dyn MessageLogCursor> {
        Box::new(InMemoryCursor {
            pos,
            log: self.clone(),
        })
    }
}

impl MessageLog for InMemoryMessageLog {
    fn append(&self, message: Message) -> WriteReceipt {
        let (writer, receipt) = write_receipt();
        let offset = {
            let mut messages = self.messages.write();
            let offset = messages.len() as Offset;
            messages.push(MessageWithOffset::new(message, offset));
            offset
        };
        writer.succeed(offset);
        receipt
    }

    fn cursor_start(&self) -> LogResult<Box<dyn MessageLogCursor>> {
        Ok(self.cursor(0))
    }

    fn cursor_end(&self) -> LogResult<Box<dyn MessageLogCursor>> {
        match self.last_offset() {
            Ok(last_offset) => Ok(self.cursor(last_offset + 1)),
            Err(LogError::EmptyLog) => self.cursor_start(),
            Err(err) => Err(err),
        }
    }

    fn cursor_at(&self, offset: Offset) -> LogResult<Box<dyn MessageLogCursor>> {
        let last_offset = self.last_offset()?;
        if offset < 0 || offset > last_offset {
            return Err(LogError::OffsetOutOfBounds {
                offset,
                max_offset: last_offset,
            });
        }
        Ok(self.cursor(offset))
    }

    fn first_offset(&self) -> LogResult<Offset> {
        if self.messages.read().is_empty() {
            Err(LogError::EmptyLog)
        } else {
            Ok(0)
        }
    }

    fn last_offset(&self) -> LogResult<Offset> {
        let len = self.messages.read().len();
        if len == 0 {
            Err(LogError::EmptyLog)
        } else {
            Ok(len as Offset - 1)
        }
    }
}

#[derive(Debug)]
struct InMemoryCursor {
    pos: Offset,
    log: InMemoryMessageLog,
}

impl MessageLogCursor for InMemoryCursor {
    fn has_next(&self) -> bool {
        matches!(self.log.last_offset(), Ok(last_offset) if self.pos <= last_offset)
    }

    fn next(&mut self) -> LogResult<MessageWithOffset> {
        let message = self.log.read(self.pos)?;
        self.pos += 1;
        Ok(message)
    }

    fn pos(&self) -> Offset {
        self.pos
    }

    fn seek(&mut self, offset: Offset) -> LogResult<()> {
        let last_offset = self.log.last_offset()?;
        if offset < 0 || offset > last_offset {
            return Err(LogError::OffsetOutOfBounds {
                offset,
                max_offset: last_offset,
            });
        }
        self.pos = offset;
        Ok(())
    }
}
