use crate::network::RequestFrame;
use crate::protocol::{
    ApiKey, CreateTopicRequest, GetTopicRequest, PublishRequest, SubscribeRequest, WireDecode,
};
use crate::request::ApiRequest;
use crate::{AppError, AppResult};

impl ApiRequest {
    /// Decodes the payload of a request frame according to its api key. The
    /// payload must be consumed exactly.
    pub fn parse_from(frame: &mut RequestFrame) -> AppResult<Self> {
        let body = &mut frame.body;
        let request = match frame.api_key {
            ApiKey::Publish => ApiRequest::Publish(PublishRequest::decode(body)?),
            ApiKey::Subscribe => ApiRequest::Subscribe(SubscribeRequest::decode(body)?),
            ApiKey::CreateTopic => ApiRequest::CreateTopic(CreateTopicRequest::decode(body)?),
            ApiKey::GetTopic => ApiRequest::GetTopic(GetTopicRequest::decode(body)?),
        };
        if !body.is_empty() {
            return Err(AppError::MalformedProtocol(format!(
                "{} trailing bytes after {:?} request",
                body.len(),
                frame.api_key
            )));
        }
        Ok(request)
    }
}
