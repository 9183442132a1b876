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

use crate::log::LogError;
use crate::message::{ClientId, PartitionId};
use crate::protocol::ErrorCode;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// marker error, a frame is not complete yet
    #[error("incomplete frame")]
    Incomplete,

    /// log errors
    #[error(transparent)]
    Log(#[from] LogError),

    /// broker errors
    #[error("message key is empty")]
    EmptyKey,

    #[error("duplicate client id: {0}")]
    DuplicateClientId(ClientId),

    #[error("partition {0} is stopped")]
    PartitionStopped(PartitionId),

    #[error("partition {0} not found")]
    PartitionNotFound(PartitionId),

    #[error("topic {0} not found")]
    TopicNotFound(String),

    #[error("topic {0} already exists")]
    TopicAlreadyExists(String),

    #[error("no node available for partition {0}")]
    NoNodeAvailable(PartitionId),

    #[error("connection to {0} is closed")]
    ConnectionClosed(String),

    #[error("{operation} failed after {attempts} attempts: {cause}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        cause: Box<AppError>,
    },

    /// error reported by the remote node
    #[error("remote error {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },
}

impl AppError {
    /// The wire code this error is reported with. Remote errors keep the
    /// code they arrived with.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }

    /// True for failures of the connection itself, after which a client
    /// must be redialed.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AppError::IoError(_)
                | AppError::DetailedIoError(_)
                | AppError::ConnectionClosed(_)
                | AppError::MalformedProtocol(_)
                | AppError::FrameTooLarge { .. }
                | AppError::Incomplete
        )
    }
}
