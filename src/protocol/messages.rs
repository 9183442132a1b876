use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{
    bytes_encoded_len, get_bytes, get_count, get_i32, get_i64, get_string, put_bytes,
    put_string, WireDecode, WireEncode,
};
use crate::message::{ClientId, Message, MessageWithOffset, Offset, PartitionId, TopicMeta};
use crate::{AppError, AppResult};

/// Size of an element count prefix.
const COUNT_SIZE: usize = 4;
const OFFSET_SIZE: usize = 8;

impl WireEncode for PartitionId {
    fn encode(&self, buffer: &mut BytesMut) {
        put_string(buffer, &self.topic);
        buffer.put_i32(self.partition);
    }
}

impl WireDecode for PartitionId {
    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        let topic = get_string(buffer)?;
        let partition = get_i32(buffer)?;
        Ok(PartitionId { topic, partition })
    }
}

impl WireEncode for ClientId {
    fn encode(&self, buffer: &mut BytesMut) {
        put_string(buffer, &self.consumer_group);
        put_string(buffer, &self.consumer_id);
    }
}

impl WireDecode for ClientId {
    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        let consumer_group = get_string(buffer)?;
        let consumer_id = get_string(buffer)?;
        Ok(ClientId {
            consumer_group,
            consumer_id,
        })
    }
}

impl WireEncode for TopicMeta {
    fn encode(&self, buffer: &mut BytesMut) {
        put_string(buffer, &self.topic);
        buffer.put_i32(self.partitions);
        buffer.put_i32(self.replicas);
    }
}

impl WireDecode for TopicMeta {
    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        let topic = get_string(buffer)?;
        let partitions = get_i32(buffer)?;
        let replicas = get_i32(buffer)?;
        Ok(TopicMeta {
            topic,
            partitions,
            replicas,
        })
    }
}

impl WireEncode for Message {
    fn encode(&self, buffer: &mut BytesMut) {
        put_bytes(buffer, &self.key);
        put_bytes(buffer, &self.value);
    }
}

impl Message {
    pub fn encoded_len(&self) -> usize {
        bytes_encoded_len(self.key.len()) + bytes_encoded_len(self.value.len())
    }
}

impl WireDecode for Message {
    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        let key = get_bytes(buffer)?;
        let value = get_bytes(buffer)?;
        Ok(Message { key, value })
    }
}

/// Opens a message stream on one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub client_id: ClientId,
    pub partition_id: PartitionId,
}

impl WireEncode for SubscribeRequest {
    fn encode(&self, buffer: &mut BytesMut) {
        self.client_id.encode(buffer);
        self.partition_id.encode(buffer);
    }
}

impl WireDecode for SubscribeRequest {
    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        let client_id = ClientId::decode(buffer)?;
        let partition_id = PartitionId::decode(buffer)?;
        Ok(SubscribeRequest {
            client_id,
            partition_id,
        })
    }
}

/// Appends a batch of messages, in order, to one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub partition_id: PartitionId,
    pub messages: Vec<Message>,
}

impl WireEncode for PublishRequest {
    fn encode(&self, buffer: &mut BytesMut) {
        self.partition_id.encode(buffer);
        buffer.put_i32(self.messages.len() as i32);
        for message in &self.messages {
            message.encode(buffer);
        }
    }
}

impl PublishRequest {
    /// Encoded payload size of a publish of `messages` to `partition_id`.
    pub fn encoded_len_of(partition_id: &PartitionId, messages: &[Message]) -> usize {
        bytes_encoded_len(partition_id.topic.len())
            + 4
            + COUNT_SIZE
            + messages.iter().map(Message::encoded_len).sum::<usize>()
    }
}

impl WireDecode for PublishRequest {
    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        let partition_id = PartitionId::decode(buffer)?;
        // a message is at least its two length prefixes
        let count = get_count(buffer, 2)?;
        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            messages.push(Message::decode(buffer)?);
        }
        Ok(PublishRequest {
            partition_id,
            messages,
        })
    }
}

/// Offsets assigned to the messages of a publish request, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishResponse {
    pub offsets: Vec<Offset>,
}

impl PublishResponse {
    /// Encoded payload size of the response to a publish of `count`
    /// messages.
    pub fn encoded_len_for(count: usize) -> usize {
        COUNT_SIZE + count * OFFSET_SIZE
    }
}

impl WireEncode for PublishResponse {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_i32(self.offsets.len() as i32);
        for offset in &self.offsets {
            buffer.put_i64(*offset);
        }
    }
}

impl WireDecode for PublishResponse {
    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        let count = get_count(buffer, 8)?;
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(get_i64(buffer)?);
        }
        Ok(PublishResponse { offsets })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTopicRequest {
    pub meta: TopicMeta,
}

impl WireEncode for CreateTopicRequest {
    fn encode(&self, buffer: &mut BytesMut) {
        self.meta.encode(buffer);
    }
}

impl WireDecode for CreateTopicRequest {
    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(CreateTopicRequest {
            meta: TopicMeta::decode(buffer)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetTopicRequest {
    pub topic: String,
}

impl WireEncode for GetTopicRequest {
    fn encode(&self, buffer: &mut BytesMut) {
        put_string(buffer, &self.topic);
    }
}

impl WireDecode for GetTopicRequest {
    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        Ok(GetTopicRequest {
            topic: get_string(buffer)?,
        })
    }
}

/// One push on a subscription stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageBatch {
    pub messages: Vec<MessageWithOffset>,
}

impl WireEncode for MessageBatch {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_i32(self.messages.len() as i32);
        for message in &self.messages {
            buffer.put_i64(message.offset);
            message.message.encode(buffer);
        }
    }
}

impl MessageBatch {
    /// Encoded size a message adds to a batch.
    pub fn entry_len(message: &Message) -> usize {
        OFFSET_SIZE + message.encoded_len()
    }

    /// Splits `messages`, in order, into batches whose encoded payload stays
    /// within `max_payload` bytes. Fails if a single message can not fit.
    pub fn split(
        messages: Vec<MessageWithOffset>,
        max_payload: usize,
    ) -> AppResult<Vec<MessageBatch>> {
        let mut batches = Vec::new();
        let mut current = MessageBatch::default();
        let mut current_len = COUNT_SIZE;
        for message in messages {
            let entry_len = Self::entry_len(&message.message);
            if COUNT_SIZE + entry_len > max_payload {
                return Err(AppError::FrameTooLarge {
                    size: COUNT_SIZE + entry_len,
                    max: max_payload,
                });
            }
            if current_len + entry_len > max_payload {
                batches.push(std::mem::take(&mut current));
                current_len = COUNT_SIZE;
            }
            current_len += entry_len;
            current.messages.push(message);
        }
        if !current.messages.is_empty() {
            batches.push(current);
        }
        Ok(batches)
    }
}

impl WireDecode for MessageBatch {
    fn decode(buffer: &mut Bytes) -> AppResult<Self> {
        let count = get_count(buffer, 10)?;
        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = get_i64(buffer)?;
            let message = Message::decode(buffer)?;
            messages.push(MessageWithOffset::new(message, offset));
        }
        Ok(MessageBatch { messages })
    }
}
