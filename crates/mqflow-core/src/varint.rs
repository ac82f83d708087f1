//! Remaining-length encoding for MQTT fixed headers.
//!
//! Seven bits of value per byte, high bit set when another byte follows.
//! At most four bytes are allowed:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - 2097152-268435455: 4 bytes

use crate::error::ProtocolError;

/// Largest value a four byte remaining length can carry.
pub const MAX_VALUE: usize = 268_435_455;

/// Most bytes a remaining length may occupy.
pub const MAX_LEN: usize = 4;

/// Decode a remaining length from the start of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` when complete, `Ok(None)` when
/// more bytes are needed, and `MalformedLength` when a fifth byte would be
/// required.
///
/// # Example
/// ```
/// use mqflow_core::varint::decode;
/// let (value, consumed) = decode(&[0x80, 0x01]).unwrap().unwrap();
/// assert_eq!(value, 128);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    let mut shift = 0u32;

    for (i, &byte) in buf.iter().take(MAX_LEN).enumerate() {
        value |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }

    if buf.len() >= MAX_LEN {
        // Fourth byte still had the continuation bit set
        return Err(ProtocolError::MalformedLength);
    }
    Ok(None)
}

/// Encode `value`, appending to `buf`. Returns the number of bytes written.
///
/// # Example
/// ```
/// use mqflow_core::varint::encode_to_vec;
/// let mut buf = Vec::new();
/// assert_eq!(encode_to_vec(300, &mut buf).unwrap(), 2);
/// assert_eq!(&buf, &[0xAC, 0x02]);
/// ```
pub fn encode_to_vec(mut value: usize, buf: &mut Vec<u8>) -> Result<usize, ProtocolError> {
    if value > MAX_VALUE {
        return Err(ProtocolError::MalformedLength);
    }
    let start = buf.len();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    Ok(buf.len() - start)
}

/// Number of bytes needed to encode `value`.
///
/// # Example
/// ```
/// use mqflow_core::varint::encoded_len;
/// assert_eq!(encoded_len(127), 1);
/// assert_eq!(encoded_len(128), 2);
/// assert_eq!(encoded_len(16384), 3);
/// ```
pub fn encoded_len(mut value: usize) -> usize {
    let mut len = 0;
    loop {
        len += 1;
        value /= 128;
        if value == 0 {
            break;
        }
    }
    len
}
