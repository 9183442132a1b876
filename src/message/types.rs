use std::fmt::{Display, Formatter};

use bytes::Bytes;

/// Position of a message inside its partition log.
pub type Offset = i64;

/// A keyed message. The key routes the message to a partition, the value is
/// opaque to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub key: Bytes,
    pub value: Bytes,
}

impl Message {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A message as stored in a partition log, tagged with the offset the log
/// assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageWithOffset {
    pub message: Message,
    pub offset: Offset,
}

impl MessageWithOffset {
    pub fn new(message: Message, offset: Offset) -> Self {
        Self { message, offset }
    }

    pub fn key(&self) -> &Bytes {
        &self.message.key
    }

    pub fn value(&self) -> &Bytes {
        &self.message.value
    }
}

impl Display for MessageWithOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "offset={} key={} value={}",
            self.offset,
            String::from_utf8_lossy(&self.message.key),
            String::from_utf8_lossy(&self.message.value)
        )
    }
}
