//! Client side of the broker: the node transport, discovery, connection
//! caching and the per-topic broker that fans partitions in and out.

pub use broker::{Subscription, TopicBroker};
pub use brokered_client::BrokerClient;
pub use connection_manager::{
    ConnectionManager, DiscoveryConnectionManager, SingleAddrConnectionManager,
};
pub use discovery::{Discovery, SingleNodeDiscovery};
pub use node_client::{Dialer, MessageStream, NodeClient, TcpDialer, TcpNodeClient};
pub use retry::RetryPolicy;

mod broker;
mod brokered_client;
mod connection_manager;
mod discovery;
mod node_client;
mod retry;
#[cfg(test)]
mod test_util;
