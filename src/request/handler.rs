use tracing::instrument;

use crate::message::TopicMeta;
use crate::network::ResponseFrame;
use crate::protocol::{
    CreateTopicRequest, GetTopicRequest, MessageBatch, PublishRequest, PublishResponse,
    WireEncode,
};
use crate::request::RequestContext;
use crate::{AppError, AppResult};

pub trait ApiHandler {
    type Request: Send + 'static;
    type Response: WireEncode + Send + 'static;

    // handle the request and return the response payload
    fn handle_request(
        &self,
        request: Self::Request,
        context: &RequestContext,
    ) -> impl std::future::Future<Output = AppResult<Self::Response>> + Send;
}

pub struct PublishRequestHandler;

impl ApiHandler for PublishRequestHandler {
    type Request = PublishRequest;
    type Response = PublishResponse;

    #[instrument(skip_all, fields(partition = %request.partition_id, count = request.messages.len()))]
    async fn handle_request(
        &self,
        request: PublishRequest,
        context: &RequestContext,
    ) -> AppResult<PublishResponse> {
        check_publish_fits(&request, context.max_frame_size)?;
        let offsets = context
            .node_service
            .publish(&request.partition_id, request.messages)
            .await?;
        Ok(PublishResponse { offsets })
    }
}

/// Rejects a publish whose response, or the push of one of its messages to
/// a subscriber, would not fit in a frame. Nothing is appended then.
fn check_publish_fits(request: &PublishRequest, max_frame_size: usize) -> AppResult<()> {
    let response_size =
        ResponseFrame::HEADER_SIZE + PublishResponse::encoded_len_for(request.messages.len());
    if response_size > max_frame_size {
        return Err(AppError::InvalidRequest(format!(
            "publish of {} messages would need a {} byte response, the limit is {}",
            request.messages.len(),
            response_size,
            max_frame_size
        )));
    }
    // a single message must fit in one push; the batch header is 4 bytes
    let max_entry = max_frame_size.saturating_sub(ResponseFrame::HEADER_SIZE + 4);
    for message in &request.messages {
        let entry = MessageBatch::entry_len(message);
        if entry > max_entry {
            return Err(AppError::InvalidValue(format!(
                "message of {} bytes can not be delivered within the {} byte frame limit",
                entry, max_frame_size
            )));
        }
    }
    Ok(())
}

pub struct CreateTopicRequestHandler;

impl ApiHandler for CreateTopicRequestHandler {
    type Request = CreateTopicRequest;
    type Response = ();

    async fn handle_request(
        &self,
        request: CreateTopicRequest,
        context: &RequestContext,
    ) -> AppResult<()> {
        context.node_service.create_topic(request.meta)
    }
}

pub struct GetTopicRequestHandler;

impl ApiHandler for GetTopicRequestHandler {
    type Request = GetTopicRequest;
    type Response = TopicMeta;

    async fn handle_request(
        &self,
        request: GetTopicRequest,
        context: &RequestContext,
    ) -> AppResult<TopicMeta> {
        context.node_service.get_topic(&request.topic)
    }
}
