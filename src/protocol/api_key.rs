use crate::{AppError, AppResult};

/// Identifies the operation a request frame carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ApiKey {
    Publish = 0,
    Subscribe = 1,
    CreateTopic = 2,
    GetTopic = 3,
}

impl ApiKey {
    pub fn from_i16(value: i16) -> AppResult<Self> {
        match value {
            0 => Ok(ApiKey::Publish),
            1 => Ok(ApiKey::Subscribe),
            2 => Ok(ApiKey::CreateTopic),
            3 => Ok(ApiKey::GetTopic),
            invalid => Err(AppError::MalformedProtocol(format!(
                "api key:{} is invalid",
                invalid
            ))),
        }
    }

    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}
