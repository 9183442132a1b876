use std::any::type_name;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::message::MessageWithOffset;
use crate::network::{write_frame, Connection, RequestFrame, ResponseFrame};
use crate::partition::ConsumerStream;
use crate::protocol::{MessageBatch, SubscribeRequest};
use crate::request::{ApiRequest, RequestContext, RequestProcessor};
use crate::service::{NodeConfig, NodeService};
use crate::AppError;
use crate::AppResult;

use super::config::RequestHandlerPool;
use super::Shutdown;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Write half of a connection. A frame write that was cancelled half way
/// leaves the connection `torn`: the peer's framing is lost and nothing
/// else may be written.
#[derive(Debug)]
struct FrameWriter {
    inner: BufWriter<OwnedWriteHalf>,
    torn: bool,
}

impl FrameWriter {
    fn new(inner: OwnedWriteHalf) -> Self {
        FrameWriter {
            inner: BufWriter::new(inner),
            torn: false,
        }
    }

    async fn write(&mut self, frame: &[u8]) -> AppResult<()> {
        if self.torn {
            return Err(AppError::ConnectionClosed(
                "an earlier frame was only partially written".into(),
            ));
        }
        self.torn = true;
        write_frame(&mut self.inner, frame).await?;
        self.torn = false;
        Ok(())
    }
}

type SharedWriter = Arc<Mutex<FrameWriter>>;

#[derive(Debug)]
struct RequestTask {
    connection_id: u64,
    correlation_id: i32,
    request: ApiRequest,
    response_tx: oneshot::Sender<BytesMut>,
}

fn type_name_of<T>(_: &T) -> &'static str {
    type_name::<T>()
}

fn spawn_worker(
    id: usize,
    request_rx: async_channel::Receiver<RequestTask>,
    node_service: Arc<NodeService>,
    max_frame_size: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(worker = id, "worker started");
        while let Ok(task) = request_rx.recv().await {
            process_request(task, node_service.clone(), max_frame_size).await;
        }
        debug!(worker = id, "worker exited, request channel closed");
    })
}

/// Starts the unary request workers plus a monitor that respawns the ones
/// that panicked.
fn start_worker_pool(
    node_service: Arc<NodeService>,
    pool: &RequestHandlerPool,
    max_frame_size: usize,
    notify_shutdown: broadcast::Sender<()>,
) -> async_channel::Sender<RequestTask> {
    let (task_tx, task_rx) = async_channel::bounded(pool.channel_capacity);
    let worker_count = pool.worker_count();
    let check_every = Duration::from_secs(pool.monitor_interval);
    let join_timeout = Duration::from_millis(pool.worker_check_timeout);
    let mut workers: HashMap<usize, JoinHandle<()>> = (0..worker_count)
        .map(|id| {
            let worker = spawn_worker(id, task_rx.clone(), node_service.clone(), max_frame_size);
            (id, worker)
        })
        .collect();

    tokio::spawn(async move {
        let mut shutdown = Shutdown::listen(&notify_shutdown);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = time::sleep(check_every) => {}
            }
            for id in 0..worker_count {
                let finished = workers
                    .get(&id)
                    .map(|handle| handle.is_finished())
                    .unwrap_or(false);
                if !finished {
                    continue;
                }
                let Some(handle) = workers.remove(&id) else {
                    continue;
                };
                match time::timeout(join_timeout, handle).await {
                    Ok(Ok(())) => info!(worker = id, "worker exited"),
                    Ok(Err(join_error)) if join_error.is_panic() => {
                        let payload = join_error.into_panic();
                        let reason = payload
                            .downcast_ref::<&'static str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| type_name_of(&payload).to_string());
                        error!(worker = id, %reason, "worker panicked, respawning");
                        let worker =
                            spawn_worker(id, task_rx.clone(), node_service.clone(), max_frame_size);
                        workers.insert(id, worker);
                    }
                    Ok(Err(join_error)) => error!(worker = id, error = %join_error, "worker cancelled"),
                    Err(_) => warn!(worker = id, "worker did not finish in time"),
                }
            }
        }
        debug!("worker monitor stopped");
    });
    task_tx
}

async fn process_request(
    task: RequestTask,
    node_service: Arc<NodeService>,
    max_frame_size: usize,
) {
    let RequestTask {
        connection_id,
        correlation_id,
        request,
        response_tx,
    } = task;
    let context = RequestContext {
        correlation_id,
        node_service,
        max_frame_size,
    };
    let response = RequestProcessor::process_request(request, &context).await;
    if response_tx.send(response).is_err() {
        debug!(connection = connection_id, "connection gone before the response was ready");
    }
}

/// Pushes the batches of one consumer as response frames carrying the
/// subscribe request's correlation id. A batch that does not fit in one
/// frame goes out as several.
struct SubscribeResponder {
    correlation_id: i32,
    max_frame_size: usize,
    writer: SharedWriter,
}

#[async_trait]
impl ConsumerStream for SubscribeResponder {
    async fn send(&mut self, messages: Vec<MessageWithOffset>) -> AppResult<()> {
        let max_payload = self
            .max_frame_size
            .saturating_sub(ResponseFrame::HEADER_SIZE);
        let batches = MessageBatch::split(messages, max_payload)?;
        let mut writer = self.writer.lock().await;
        for batch in &batches {
            let frame = ResponseFrame::encode_ok(self.correlation_id, batch);
            writer.write(&frame).await?;
        }
        Ok(())
    }
}

/// Serves one accepted socket.
struct ConnectionHandler {
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
    connection_id: u64,
    peer: String,
    connection: Connection<OwnedReadHalf>,
    max_frame_size: usize,
    writer: SharedWriter,
    task_tx: async_channel::Sender<RequestTask>,
    node_service: Arc<NodeService>,
}

impl ConnectionHandler {
    async fn serve(&mut self) -> AppResult<()> {
        let mut shutdown = Shutdown::listen(&self.notify_shutdown);
        loop {
            // None on a clean close, Err when the peer went away mid frame
            let read = tokio::select! {
                read = self.connection.read_frame() => read?,
                _ = shutdown.recv() => return Ok(()),
            };
            let Some(body) = read else {
                break;
            };
            let mut frame = RequestFrame::parse(body)?;
            let correlation_id = frame.correlation_id;
            let request = match ApiRequest::parse_from(&mut frame) {
                Ok(ApiRequest::Subscribe(request)) => {
                    // the connection now belongs to the stream
                    return self
                        .handle_subscription(correlation_id, request, &mut shutdown)
                        .await;
                }
                Ok(request) => request,
                Err(err) => {
                    warn!(connection = self.connection_id, api_key = ?frame.api_key, error = %err, "undecodable request");
                    let response = ResponseFrame::encode_error(correlation_id, &err);
                    self.writer.lock().await.write(&response).await?;
                    continue;
                }
            };

            let (response_tx, response_rx) = oneshot::channel();
            let task = RequestTask {
                connection_id: self.connection_id,
                correlation_id,
                request,
                response_tx,
            };
            self.task_tx
                .send(task)
                .await
                .map_err(|e| AppError::ChannelSendError(e.to_string()))?;

            // one request in flight per connection keeps responses in order
            let response = response_rx.await.map_err(|_| {
                AppError::IllegalStateError(format!(
                    "worker dropped the request of connection {}",
                    self.connection_id
                ))
            })?;
            self.writer.lock().await.write(&response).await?;
        }
        debug!(connection = self.connection_id, peer = %self.peer, "peer closed the connection");
        Ok(())
    }

    /// Streams the partition to the client until the consumer terminates,
    /// the client goes away or the node shuts down.
    async fn handle_subscription(
        &mut self,
        correlation_id: i32,
        request: SubscribeRequest,
        shutdown: &mut Shutdown,
    ) -> AppResult<()> {
        let SubscribeRequest {
            client_id,
            partition_id,
        } = request;
        info!(
            connection = self.connection_id,
            peer = %self.peer,
            partition = %partition_id,
            client = %client_id,
            "subscription opened"
        );
        let responder = SubscribeResponder {
            correlation_id,
            max_frame_size: self.max_frame_size,
            writer: self.writer.clone(),
        };
        let handle =
            match self
                .node_service
                .subscribe(&partition_id, client_id.clone(), Box::new(responder))
            {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(partition = %partition_id, client = %client_id, error = %err, "subscribe rejected");
                    return self.close_stream(correlation_id, Some(err)).await;
                }
            };
        let handle_id = handle.id();
        let terminated = handle.wait();
        tokio::pin!(terminated);

        let outcome = tokio::select! {
            result = &mut terminated => result.err(),
            read = self.connection.read_frame() => {
                // a subscribed client only ever closes its stream
                let err = match read {
                    Ok(None) => None,
                    Ok(Some(_)) => Some(AppError::InvalidRequest(
                        "unexpected frame on a subscription stream".into(),
                    )),
                    Err(e) => Some(AppError::ConnectionClosed(format!("{}: {}", self.peer, e))),
                };
                self.node_service
                    .unsubscribe(&partition_id, &client_id, handle_id, err);
                None
            }
            _ = shutdown.recv() => {
                self.node_service
                    .unsubscribe(&partition_id, &client_id, handle_id, None);
                None
            }
        };
        info!(
            connection = self.connection_id,
            partition = %partition_id,
            client = %client_id,
            "subscription closed"
        );
        self.close_stream(correlation_id, outcome).await
    }

    /// Reports the terminal error, if any, and shuts the write side down.
    /// After a torn push the error is dropped, the client sees the close.
    async fn close_stream(&mut self, correlation_id: i32, err: Option<AppError>) -> AppResult<()> {
        let mut writer = self.writer.lock().await;
        if let Some(err) = &err {
            let frame = ResponseFrame::encode_error(correlation_id, err);
            if let Err(e) = writer.write(&frame).await {
                debug!(error = %e, "could not report subscription error");
            }
        }
        let _ = writer.inner.shutdown().await;
        Ok(())
    }
}

#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    node_service: Arc<NodeService>,
    config: NodeConfig,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        node_service: Arc<NodeService>,
        config: NodeConfig,
    ) -> Self {
        Server {
            listener,
            limit_connections: Arc::new(Semaphore::new(config.network.max_connection)),
            notify_shutdown,
            shutdown_complete_tx,
            node_service,
            config,
        }
    }

    /// Accepts connections and serves them until the future is dropped.
    ///
    /// Each connection holds a permit of the connection limit and is served
    /// by its own `ConnectionHandler`. Unary requests go through the request
    /// handler pool; a subscribe request turns its connection into a message
    /// stream.
    ///
    // Graceful shutdown sequence:
    // 1. The owner drops the `run` future and broadcasts the shutdown signal.
    // 2. Connection handlers stop reading, subscriptions unregister their
    //    consumers, in-flight unary requests still get their response.
    // 3. Once every handler is gone the request channel closes, the workers
    //    exit and the monitor leaves on the shutdown signal.
    // 4. The owner waits until every `shutdown_complete_tx` clone is dropped.
    ///
    /// # Returns
    /// Exits with an error only if accepting new connections keeps failing.
    #[tracing::instrument(skip(self), fields(addr = ?self.listener.local_addr().ok()))]
    pub async fn run(&self) -> AppResult<()> {
        let max_frame_size = self.config.network.max_package_size;
        let task_tx = start_worker_pool(
            self.node_service.clone(),
            &self.config.request_handler_pool,
            max_frame_size,
            self.notify_shutdown.clone(),
        );

        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::IllegalStateError(format!("connection limit: {}", e)))?;

            let (socket, peer) = self.accept().await?;
            let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            debug!(connection = connection_id, %peer, "accepted");
            let (reader, writer) = socket.into_split();

            let mut handler = ConnectionHandler {
                notify_shutdown: self.notify_shutdown.clone(),
                _shutdown_complete_tx: self.shutdown_complete_tx.clone(),
                connection_id,
                peer: peer.to_string(),
                connection: Connection::new(reader, max_frame_size),
                max_frame_size,
                writer: Arc::new(Mutex::new(FrameWriter::new(writer))),
                task_tx: task_tx.clone(),
                node_service: self.node_service.clone(),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.serve().await {
                    warn!(connection = handler.connection_id, error = %err, "connection failed");
                }
                drop(permit);
            });
        }
    }

    async fn accept(&self) -> AppResult<(TcpStream, std::net::SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "giving up accepting connections: {}",
                            err
                        )));
                    }
                    warn!(error = %err, backoff, "accept failed, retrying");
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!(connection = self.connection_id, "connection handler dropped");
    }
}
