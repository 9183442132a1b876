mod api_request;
mod handler;
mod request_processor;

pub use request_processor::RequestProcessor;

use std::sync::Arc;

use crate::protocol::{CreateTopicRequest, GetTopicRequest, PublishRequest, SubscribeRequest};
use crate::service::NodeService;

#[derive(Debug)]
pub enum ApiRequest {
    Publish(PublishRequest),
    Subscribe(SubscribeRequest),
    CreateTopic(CreateTopicRequest),
    GetTopic(GetTopicRequest),
}

#[derive(Debug)]
pub struct RequestContext {
    pub correlation_id: i32,
    pub node_service: Arc<NodeService>,
    /// largest frame body the node may send back
    pub max_frame_size: usize,
}
