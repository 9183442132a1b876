mod client;
mod log;
mod message;
mod network;
mod partition;
mod protocol;
mod request;
mod service;

pub use client::{
    BrokerClient, ConnectionManager, Dialer, Discovery, DiscoveryConnectionManager,
    MessageStream, NodeClient, RetryPolicy, SingleAddrConnectionManager, SingleNodeDiscovery,
    Subscription, TcpDialer, TcpNodeClient, TopicBroker,
};
pub use log::{
    write_receipt, InMemoryMessageLog, LogError, LogResult, MessageLog, MessageLogCursor,
    ReceiptWriter, WriteReceipt,
};
pub use message::{
    hash_to_partition, ClientId, Message, MessageWithOffset, Offset, PartitionId, TopicMeta,
};
pub use partition::{
    AcceptAll, ConsumerHandle, ConsumerStream, MessageFilter, Partition, PredicateFilter,
};
pub use protocol::{
    ErrorCode, MessageBatch, PublishRequest, PublishResponse, SubscribeRequest,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ClientConfig, Node, NodeConfig,
    NodeService, OtelGuard, Shutdown,
};
