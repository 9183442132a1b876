// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::BytesMut;
use tracing::{debug, trace};

use super::handler::{
    ApiHandler, CreateTopicRequestHandler, GetTopicRequestHandler, PublishRequestHandler,
};
use crate::network::ResponseFrame;
use crate::request::{ApiRequest, RequestContext};
use crate::AppError;

/// general async handler
async fn execute_handler<H>(handler: H, request: H::Request, context: &RequestContext) -> BytesMut
where
    H: ApiHandler + Sync,
{
    // call the specific handler to generate the response
    let response = handler.handle_request(request, context).await;
    if let Err(err) = &response {
        debug!(correlation_id = context.correlation_id, error = %err, "request failed");
    }

    // encode the response, errors included, to a frame
    ResponseFrame::encode_result(context.correlation_id, &response)
}

pub struct RequestProcessor;

impl RequestProcessor {
    /// Runs one unary request. Subscriptions stream on their connection and
    /// never reach the processor.
    pub async fn process_request(request: ApiRequest, context: &RequestContext) -> BytesMut {
        trace!(
            "Processing request: {:?} with correlation id {}",
            request,
            context.correlation_id
        );
        match request {
            ApiRequest::Publish(request) => {
                execute_handler(PublishRequestHandler, request, context).await
            }
            ApiRequest::CreateTopic(request) => {
                execute_handler(CreateTopicRequestHandler, request, context).await
            }
            ApiRequest::GetTopic(request) => {
                execute_handler(GetTopicRequestHandler, request, context).await
            }
            ApiRequest::Subscribe(request) => ResponseFrame::encode_error(
                context.correlation_id,
                &AppError::InvalidRequest(format!(
                    "subscribe to {} must open its own stream",
                    request.partition_id
                )),
            ),
        }
    }
}
