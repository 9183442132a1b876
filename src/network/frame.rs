use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::{
    get_i16, get_i32, get_string, put_string, ApiKey, ErrorCode, WireDecode, WireEncode,
};
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

const LENGTH_PREFIX_SIZE: usize = 4;

/// Checks whether `buffer` starts with a complete frame: an `i32` big-endian
/// body length followed by the body.
pub fn check(buffer: &mut BytesMut, max_frame_size: usize) -> AppResult<()> {
    if buffer.remaining() < LENGTH_PREFIX_SIZE {
        return Err(Incomplete);
    }
    let body_size = i32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    if body_size < 0 {
        return Err(AppError::DetailedIoError(format!(
            "frame size {} less than 0",
            body_size
        )));
    }
    if body_size as usize > max_frame_size {
        return Err(AppError::FrameTooLarge {
            size: body_size as usize,
            max: max_frame_size,
        });
    }
    if buffer.remaining() < body_size as usize + LENGTH_PREFIX_SIZE {
        buffer.reserve(body_size as usize + LENGTH_PREFIX_SIZE);
        return Err(Incomplete);
    }
    Ok(())
}

/// Splits the next complete frame body off `buffer`, `None` if more bytes are
/// needed.
pub fn split_frame(buffer: &mut BytesMut, max_frame_size: usize) -> AppResult<Option<BytesMut>> {
    match check(buffer, max_frame_size) {
        Ok(_) => {
            let body_length = buffer.get_i32();
            Ok(Some(buffer.split_to(body_length as usize)))
        }
        Err(AppError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

fn length_prefixed(write_body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buffer = BytesMut::with_capacity(64);
    buffer.put_i32(0);
    write_body(&mut buffer);
    let body_length = (buffer.len() - LENGTH_PREFIX_SIZE) as i32;
    buffer[..LENGTH_PREFIX_SIZE].copy_from_slice(&body_length.to_be_bytes());
    buffer
}

#[derive(Debug)]
pub struct RequestFrame {
    pub api_key: ApiKey,
    pub correlation_id: i32,
    pub body: Bytes,
}

impl RequestFrame {
    /// Bytes of a request body in front of the payload: api key and
    /// correlation id.
    pub const HEADER_SIZE: usize = 6;

    /// Encodes a complete request frame, length prefix included.
    pub fn encode<T: WireEncode>(api_key: ApiKey, correlation_id: i32, payload: &T) -> BytesMut {
        length_prefixed(|buffer| {
            buffer.put_i16(api_key.as_i16());
            buffer.put_i32(correlation_id);
            payload.encode(buffer);
        })
    }

    /// Parses a frame body as returned by [`split_frame`].
    pub fn parse(frame: BytesMut) -> AppResult<RequestFrame> {
        let mut body = frame.freeze();
        let api_key = ApiKey::from_i16(get_i16(&mut body)?)?;
        let correlation_id = get_i32(&mut body)?;
        Ok(RequestFrame {
            api_key,
            correlation_id,
            body,
        })
    }
}

#[derive(Debug)]
pub struct ResponseFrame {
    pub correlation_id: i32,
    pub error_code: ErrorCode,
    pub body: Bytes,
}

impl ResponseFrame {
    /// Bytes of a response body in front of the payload: correlation id and
    /// error code.
    pub const HEADER_SIZE: usize = 6;

    pub fn encode_ok<T: WireEncode>(correlation_id: i32, payload: &T) -> BytesMut {
        length_prefixed(|buffer| {
            buffer.put_i32(correlation_id);
            buffer.put_i16(ErrorCode::None.as_i16());
            payload.encode(buffer);
        })
    }

    /// An error response carries the code and the error's message.
    pub fn encode_error(correlation_id: i32, err: &AppError) -> BytesMut {
        length_prefixed(|buffer| {
            buffer.put_i32(correlation_id);
            buffer.put_i16(err.code().as_i16());
            put_string(buffer, &err.to_string());
        })
    }

    pub fn encode_result<T: WireEncode>(correlation_id: i32, result: &AppResult<T>) -> BytesMut {
        match result {
            Ok(payload) => Self::encode_ok(correlation_id, payload),
            Err(err) => Self::encode_error(correlation_id, err),
        }
    }

    pub fn parse(frame: BytesMut) -> AppResult<ResponseFrame> {
        let mut body = frame.freeze();
        let correlation_id = get_i32(&mut body)?;
        let error_code = ErrorCode::from(get_i16(&mut body)?);
        Ok(ResponseFrame {
            correlation_id,
            error_code,
            body,
        })
    }

    /// Decodes the payload, or turns an error response into
    /// [`AppError::Remote`].
    pub fn into_result<T: WireDecode>(mut self) -> AppResult<T> {
        if !self.error_code.is_none() {
            let message = get_string(&mut self.body).unwrap_or_default();
            return Err(AppError::Remote {
                code: self.error_code,
                message,
            });
        }
        T::decode(&mut self.body)
    }
}
