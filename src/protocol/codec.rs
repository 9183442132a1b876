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

use bytes::{Buf, BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;

use crate::{AppError, AppResult};

/// Writes a value in wire format.
pub trait WireEncode {
    fn encode(&self, buffer: &mut BytesMut);
}

/// Reads a value from wire format, consuming exactly the bytes it occupies.
pub trait WireDecode: Sized {
    fn decode(buffer: &mut Bytes) -> AppResult<Self>;
}

impl WireEncode for () {
    fn encode(&self, _buffer: &mut BytesMut) {}
}

impl WireDecode for () {
    fn decode(_buffer: &mut Bytes) -> AppResult<Self> {
        Ok(())
    }
}

///
/// Bounds-checked big-endian readers. `bytes` panics on short buffers, a peer
/// must never be able to trigger that.
///
macro_rules! define_checked_get {
    ($name:ident, $type:ty, $read_method:ident) => {
        pub(crate) fn $name(buffer: &mut Bytes) -> AppResult<$type> {
            if buffer.remaining() < std::mem::size_of::<$type>() {
                return Err(AppError::MalformedProtocol(format!(
                    "can not read a {}",
                    stringify!($type)
                )));
            }
            Ok(buffer.$read_method())
        }
    };
}

define_checked_get!(get_i16, i16, get_i16);
define_checked_get!(get_i32, i32, get_i32);
define_checked_get!(get_i64, i64, get_i64);

pub(crate) fn put_varint_len(buffer: &mut BytesMut, len: usize) {
    let mut scratch = [0u8; 10];
    let written = (len as u64).encode_var(&mut scratch);
    buffer.put_slice(&scratch[..written]);
}

pub(crate) fn get_varint_len(buffer: &mut Bytes) -> AppResult<usize> {
    let (len, read) = u64::decode_var(buffer.chunk())
        .ok_or_else(|| AppError::MalformedProtocol("can not read a varint length".into()))?;
    buffer.advance(read);
    usize::try_from(len)
        .map_err(|_| AppError::MalformedProtocol(format!("length {} overflows", len)))
}

/// Wire size of a length-prefixed byte string of `len` bytes.
pub(crate) fn bytes_encoded_len(len: usize) -> usize {
    (len as u64).required_space() + len
}

pub(crate) fn put_bytes(buffer: &mut BytesMut, bytes: &[u8]) {
    put_varint_len(buffer, bytes.len());
    buffer.put_slice(bytes);
}

pub(crate) fn get_bytes(buffer: &mut Bytes) -> AppResult<Bytes> {
    let len = get_varint_len(buffer)?;
    if buffer.remaining() < len {
        return Err(AppError::MalformedProtocol(format!(
            "need {} bytes, only {} left",
            len,
            buffer.remaining()
        )));
    }
    Ok(buffer.split_to(len))
}

pub(crate) fn put_string(buffer: &mut BytesMut, value: &str) {
    put_bytes(buffer, value.as_bytes());
}

pub(crate) fn get_string(buffer: &mut Bytes) -> AppResult<String> {
    let bytes = get_bytes(buffer)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| AppError::MalformedProtocol(format!("invalid utf8 string: {}", e)))
}

/// Reads an element count and sanity checks it against the remaining bytes,
/// each element occupying at least `min_element_size` bytes.
pub(crate) fn get_count(buffer: &mut Bytes, min_element_size: usize) -> AppResult<usize> {
    let count = get_i32(buffer)?;
    if count < 0 {
        return Err(AppError::MalformedProtocol(format!(
            "negative element count {}",
            count
        )));
    }
    let count = count as usize;
    if count.saturating_mul(min_element_size) > buffer.remaining() {
        return Err(AppError::MalformedProtocol(format!(
            "element count {} exceeds remaining {} bytes",
            count,
            buffer.remaining()
        )));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        let mut buffer = BytesMut::new();
        put_string(&mut buffer, "topic");
        assert_eq!(&buffer[..], b"\x05topic");

        let mut long = BytesMut::new();
        put_bytes(&mut long, &[7u8; 300]);
        // 300 = 0b10_0101100 -> 0xAC 0x02
        assert_eq!(&long[..2], &[0xAC, 0x02]);
        assert_eq!(long.len(), 302);
        assert_eq!(bytes_encoded_len(300), 302);
        assert_eq!(bytes_encoded_len(5), 6);

        let mut bytes = long.freeze();
        assert_eq!(get_bytes(&mut bytes).unwrap().len(), 300);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_short_buffers_are_rejected() {
        let mut truncated = Bytes::from_static(b"\x05top");
        assert!(matches!(
            get_string(&mut truncated),
            Err(AppError::MalformedProtocol(_))
        ));

        let mut short = Bytes::from_static(&[0, 1, 2]);
        assert!(get_i32(&mut short).is_err());
        assert_eq!(short.len(), 3);

        let mut huge_count = Bytes::from_static(&[0x7F, 0xFF, 0xFF, 0xFF, 0]);
        assert!(get_count(&mut huge_count, 1).is_err());

        let mut invalid_utf8 = Bytes::from_static(&[2, 0xC3, 0x28]);
        assert!(get_string(&mut invalid_utf8).is_err());
    }
}
