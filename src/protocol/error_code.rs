use crate::log::LogError;
use crate::AppError;

/// Error codes carried in response frames. `None` marks a successful
/// response.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    None = 0,
    Unknown = 1,
    MalformedProtocol = 2,
    InvalidValue = 3,
    InvalidRequest = 4,
    EmptyKey = 5,
    DuplicateClientId = 6,
    PartitionStopped = 7,
    PartitionNotFound = 8,
    TopicNotFound = 9,
    TopicAlreadyExists = 10,
    OffsetOutOfBounds = 11,
    EmptyLog = 12,
    ReceiptNotWritten = 13,
    StorageError = 14,
    FrameTooLarge = 15,
}

impl ErrorCode {
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    pub fn is_none(&self) -> bool {
        *self == ErrorCode::None
    }
}

impl From<i16> for ErrorCode {
    fn from(value: i16) -> Self {
        match value {
            0 => ErrorCode::None,
            2 => ErrorCode::MalformedProtocol,
            3 => ErrorCode::InvalidValue,
            4 => ErrorCode::InvalidRequest,
            5 => ErrorCode::EmptyKey,
            6 => ErrorCode::DuplicateClientId,
            7 => ErrorCode::PartitionStopped,
            8 => ErrorCode::PartitionNotFound,
            9 => ErrorCode::TopicNotFound,
            10 => ErrorCode::TopicAlreadyExists,
            11 => ErrorCode::OffsetOutOfBounds,
            12 => ErrorCode::EmptyLog,
            13 => ErrorCode::ReceiptNotWritten,
            14 => ErrorCode::StorageError,
            15 => ErrorCode::FrameTooLarge,
            _ => ErrorCode::Unknown,
        }
    }
}

impl From<&AppError> for ErrorCode {
    fn from(value: &AppError) -> Self {
        match value {
            AppError::MalformedProtocol(_) | AppError::Incomplete => ErrorCode::MalformedProtocol,
            AppError::InvalidValue(_) => ErrorCode::InvalidValue,
            AppError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            AppError::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            AppError::EmptyKey => ErrorCode::EmptyKey,
            AppError::DuplicateClientId(_) => ErrorCode::DuplicateClientId,
            AppError::PartitionStopped(_) => ErrorCode::PartitionStopped,
            AppError::PartitionNotFound(_) => ErrorCode::PartitionNotFound,
            AppError::TopicNotFound(_) => ErrorCode::TopicNotFound,
            AppError::TopicAlreadyExists(_) => ErrorCode::TopicAlreadyExists,
            AppError::Log(LogError::OffsetOutOfBounds { .. }) => ErrorCode::OffsetOutOfBounds,
            AppError::Log(LogError::EmptyLog) => ErrorCode::EmptyLog,
            AppError::Log(LogError::ReceiptNotWritten) => ErrorCode::ReceiptNotWritten,
            AppError::Log(LogError::Storage(_)) => ErrorCode::StorageError,
            AppError::Remote { code, .. } => *code,
            _ => ErrorCode::Unknown,
        }
    }
}
