use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::message::{MessageWithOffset, TopicMeta};
use crate::network::{write_frame, Connection, RequestFrame, ResponseFrame};
use crate::protocol::{
    ApiKey, CreateTopicRequest, GetTopicRequest, MessageBatch, PublishRequest, PublishResponse,
    SubscribeRequest, WireDecode, WireEncode,
};
use crate::{AppError, AppResult};

/// Server push side of a subscribe call, as seen by the client.
#[async_trait]
pub trait MessageStream: Send {
    /// The next batch. `Ok(None)` once the node closed the stream cleanly,
    /// `Err` when the node terminated it with an error or the transport
    /// failed.
    async fn recv(&mut self) -> AppResult<Option<Vec<MessageWithOffset>>>;
}

/// Client end of the node transport.
#[async_trait]
pub trait NodeClient: Send + Sync + Debug {
    fn addr(&self) -> &str;

    async fn subscribe(&self, request: SubscribeRequest) -> AppResult<Box<dyn MessageStream>>;

    async fn publish(&self, request: PublishRequest) -> AppResult<PublishResponse>;

    async fn create_topic(&self, meta: TopicMeta) -> AppResult<()>;

    async fn get_topic(&self, topic: &str) -> AppResult<TopicMeta>;

    /// True once the client can no longer be used and must be redialed.
    fn is_shutdown(&self) -> bool;

    async fn close(&self);
}

/// Opens clients to node addresses.
#[async_trait]
pub trait Dialer: Send + Sync + Debug {
    async fn dial(&self, addr: &str) -> AppResult<Arc<dyn NodeClient>>;
}

#[derive(Debug, Clone)]
pub struct TcpDialer {
    max_frame_size: usize,
}

impl TcpDialer {
    pub fn new(max_frame_size: usize) -> Self {
        TcpDialer { max_frame_size }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> AppResult<Arc<dyn NodeClient>> {
        let client = TcpNodeClient::connect(addr, self.max_frame_size).await?;
        Ok(Arc::new(client))
    }
}

#[derive(Debug)]
struct UnaryChannel {
    connection: Connection<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl UnaryChannel {
    async fn round_trip(&mut self, frame: &[u8]) -> AppResult<ResponseFrame> {
        write_frame(&mut self.writer, frame).await?;
        match self.connection.read_frame().await? {
            Some(body) => ResponseFrame::parse(body),
            None => Err(AppError::Incomplete),
        }
    }
}

/// Node client over TCP.
///
/// Unary calls share one connection and are issued one at a time. Every
/// subscribe call opens a dedicated connection which then carries only that
/// stream. A transport failure on the unary connection shuts the client
/// down.
#[derive(Debug)]
pub struct TcpNodeClient {
    addr: String,
    max_frame_size: usize,
    channel: Mutex<Option<UnaryChannel>>,
    shutdown: AtomicBool,
    next_correlation_id: AtomicI32,
}

async fn open_stream(addr: &str) -> AppResult<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| AppError::DetailedIoError(format!("connect to {}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream.into_split())
}

impl TcpNodeClient {
    pub async fn connect(addr: &str, max_frame_size: usize) -> AppResult<TcpNodeClient> {
        let (reader, writer) = open_stream(addr).await?;
        debug!(addr, "connected to node");
        Ok(TcpNodeClient {
            addr: addr.to_string(),
            max_frame_size,
            channel: Mutex::new(Some(UnaryChannel {
                connection: Connection::new(reader, max_frame_size),
                writer: BufWriter::new(writer),
            })),
            shutdown: AtomicBool::new(false),
            next_correlation_id: AtomicI32::new(0),
        })
    }

    fn correlation_id(&self) -> i32 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn call<Req, Resp>(&self, api_key: ApiKey, request: &Req) -> AppResult<Resp>
    where
        Req: WireEncode + Sync,
        Resp: WireDecode,
    {
        let correlation_id = self.correlation_id();
        let frame = RequestFrame::encode(api_key, correlation_id, request);

        let mut guard = self.channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| AppError::ConnectionClosed(self.addr.clone()))?;
        let result = channel.round_trip(&frame).await.and_then(|response| {
            if response.correlation_id == correlation_id {
                Ok(response)
            } else {
                Err(AppError::MalformedProtocol(format!(
                    "expected correlation id {}, got {}",
                    correlation_id, response.correlation_id
                )))
            }
        });
        if let Err(err) = &result {
            if err.is_connection_error() {
                warn!(addr = %self.addr, error = %err, "node connection failed");
                *guard = None;
                self.shutdown.store(true, Ordering::Release);
            }
        }
        drop(guard);
        result?.into_result()
    }
}

#[async_trait]
impl NodeClient for TcpNodeClient {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn subscribe(&self, request: SubscribeRequest) -> AppResult<Box<dyn MessageStream>> {
        if self.is_shutdown() {
            return Err(AppError::ConnectionClosed(self.addr.clone()));
        }
        let (reader, mut writer) = open_stream(&self.addr).await?;
        let correlation_id = self.correlation_id();
        let frame = RequestFrame::encode(ApiKey::Subscribe, correlation_id, &request);
        write_frame(&mut writer, &frame).await?;
        Ok(Box::new(TcpMessageStream {
            correlation_id,
            connection: Connection::new(reader, self.max_frame_size),
            _writer: writer,
        }))
    }

    async fn publish(&self, request: PublishRequest) -> AppResult<PublishResponse> {
        self.call(ApiKey::Publish, &request).await
    }

    async fn create_topic(&self, meta: TopicMeta) -> AppResult<()> {
        self.call(ApiKey::CreateTopic, &CreateTopicRequest { meta })
            .await
    }

    async fn get_topic(&self, topic: &str) -> AppResult<TopicMeta> {
        let request = GetTopicRequest {
            topic: topic.to_string(),
        };
        self.call(ApiKey::GetTopic, &request).await
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(mut channel) = self.channel.lock().await.take() {
            let _ = channel.writer.shutdown().await;
        }
    }
}

/// A subscribe call's dedicated connection. Dropping it closes the
/// connection, which ends the subscription on the node.
struct TcpMessageStream {
    correlation_id: i32,
    connection: Connection<OwnedReadHalf>,
    _writer: OwnedWriteHalf,
}

#[async_trait]
impl MessageStream for TcpMessageStream {
    async fn recv(&mut self) -> AppResult<Option<Vec<MessageWithOffset>>> {
        let Some(body) = self.connection.read_frame().await? else {
            return Ok(None);
        };
        let response = ResponseFrame::parse(body)?;
        if response.correlation_id != self.correlation_id {
            return Err(AppError::MalformedProtocol(format!(
                "expected correlation id {} on subscription, got {}",
                self.correlation_id, response.correlation_id
            )));
        }
        let batch: MessageBatch = response.into_result()?;
        Ok(Some(batch.messages))
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use tokio::net::TcpListener;

    use super::*;
    use crate::message::{ClientId, Message, PartitionId};
    use crate::protocol::ErrorCode;

    /// Accepts one connection and answers every request frame with
    /// `respond`.
    async fn serve_once<F>(respond: F) -> String
    where
        F: Fn(RequestFrame) -> BytesMut + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut connection = Connection::new(reader, 1024 * 1024);
            while let Ok(Some(body)) = connection.read_frame().await {
                let request = RequestFrame::parse(body).unwrap();
                let response = respond(request);
                if write_frame(&mut writer, &response).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_publish_round_trip() {
        let addr = serve_once(|mut frame| {
            assert_eq!(frame.api_key, ApiKey::Publish);
            let request = PublishRequest::decode(&mut frame.body).unwrap();
            let offsets = (0..request.messages.len() as i64).collect();
            ResponseFrame::encode_ok(frame.correlation_id, &PublishResponse { offsets })
        })
        .await;
        let client = TcpNodeClient::connect(&addr, 1024 * 1024).await.unwrap();
        let response = client
            .publish(PublishRequest {
                partition_id: PartitionId::new("orders", 0),
                messages: vec![Message::new("a", "1"), Message::new("b", "2")],
            })
            .await
            .unwrap();
        assert_eq!(response.offsets, vec![0, 1]);
        assert!(!client.is_shutdown());
    }

    #[tokio::test]
    async fn test_remote_error_keeps_client_alive() {
        let addr = serve_once(|frame| {
            let err = AppError::TopicNotFound("missing".into());
            ResponseFrame::encode_error(frame.correlation_id, &err)
        })
        .await;
        let client = TcpNodeClient::connect(&addr, 1024 * 1024).await.unwrap();
        match client.get_topic("missing").await {
            Err(AppError::Remote { code, .. }) => assert_eq!(code, ErrorCode::TopicNotFound),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!client.is_shutdown());
    }

    #[tokio::test]
    async fn test_closed_peer_shuts_client_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // accept and hang up without answering
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let client = TcpNodeClient::connect(&addr, 1024 * 1024).await.unwrap();
        assert!(client.get_topic("orders").await.is_err());
        assert!(client.is_shutdown());
        assert!(matches!(
            client.get_topic("orders").await,
            Err(AppError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_yields_batches_then_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // the first connection carries unary calls and stays idle here
            let (_unary, _) = listener.accept().await.unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut connection = Connection::new(reader, 1024 * 1024);
            let body = connection.read_frame().await.unwrap().unwrap();
            let frame = RequestFrame::parse(body).unwrap();
            assert_eq!(frame.api_key, ApiKey::Subscribe);
            let batch = MessageBatch {
                messages: vec![MessageWithOffset::new(
                    Message::new(Bytes::from_static(b"k"), Bytes::from_static(b"v")),
                    7,
                )],
            };
            let response = ResponseFrame::encode_ok(frame.correlation_id, &batch);
            write_frame(&mut writer, &response).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let client = TcpNodeClient::connect(&addr, 1024 * 1024).await.unwrap();
        let mut stream = client
            .subscribe(SubscribeRequest {
                client_id: ClientId::new("group", "c1"),
                partition_id: PartitionId::new("orders", 0),
            })
            .await
            .unwrap();
        let batch = stream.recv().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, 7);
        assert!(stream.recv().await.unwrap().is_none());
    }
}
