//! Name/value pair streams.
//!
//! Used for the `Params` stream and for the `GetValues`/`GetValuesResult`
//! management exchange. Each string is preceded by its length:
//!
//! ```text
//! length < 128:   0lllllll
//! otherwise:      1lllllll llllllll llllllll llllllll   (31 bits, BE)
//! ```
//!
//! A pair is encoded as `name_len value_len name value`.

use std::collections::HashMap;

use crate::error::NameValueError;

/// Largest length that fits in a single prefix byte.
const SHORT_LENGTH_MAX: usize = 0x7F;

/// Largest length that fits in the four-byte prefix.
pub const MAX_STRING_LENGTH: usize = 0x7FFF_FFFF;

/// Number of prefix bytes needed to describe `len`.
#[inline]
pub fn prefix_len(len: usize) -> usize {
    if len > SHORT_LENGTH_MAX { 4 } else { 1 }
}

/// Decodes a full name/value stream into a table.
///
/// A repeated name replaces the earlier value; the duplicate is logged.
pub fn decode(data: &[u8]) -> Result<HashMap<String, String>, NameValueError> {
    let mut pairs = HashMap::new();
    let mut index = 0;

    while index < data.len() {
        let (name, value) = read_pair(data, &mut index)?;
        tracing::trace!(name = %name, value = %value, "parameter read");

        if pairs.contains_key(&name) {
            tracing::warn!(name = %name, "duplicate parameter, overwriting earlier value");
        }
        pairs.insert(name, value);
    }

    Ok(pairs)
}

/// Encodes pairs into a flat name/value stream.
pub fn encode<I, K, V>(pairs: I) -> Result<Vec<u8>, NameValueError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut buf = Vec::new();

    for (name, value) in pairs {
        let name = name.as_ref().as_bytes();
        let value = value.as_ref().as_bytes();

        write_length(&mut buf, name.len())?;
        write_length(&mut buf, value.len())?;
        buf.extend_from_slice(name);
        buf.extend_from_slice(value);
    }

    Ok(buf)
}

fn read_pair(data: &[u8], index: &mut usize) -> Result<(String, String), NameValueError> {
    let start = *index;
    let name_len = read_length(data, index)?;
    let value_len = read_length(data, index)?;

    let name_end = index
        .checked_add(name_len)
        .ok_or(NameValueError::OutOfBounds { offset: start })?;
    let value_end = name_end
        .checked_add(value_len)
        .ok_or(NameValueError::OutOfBounds { offset: start })?;
    if value_end > data.len() {
        return Err(NameValueError::OutOfBounds { offset: start });
    }

    let name = String::from_utf8_lossy(&data[*index..name_end]).into_owned();
    let value = String::from_utf8_lossy(&data[name_end..value_end]).into_owned();
    *index = value_end;

    Ok((name, value))
}

fn read_length(data: &[u8], index: &mut usize) -> Result<usize, NameValueError> {
    let first = *data
        .get(*index)
        .ok_or(NameValueError::OutOfBounds { offset: *index })?;

    if first & 0x80 == 0 {
        *index += 1;
        return Ok(first as usize);
    }

    let bytes = data
        .get(*index..*index + 4)
        .ok_or(NameValueError::OutOfBounds { offset: *index })?;
    *index += 4;

    Ok(u32::from_be_bytes([bytes[0] & 0x7F, bytes[1], bytes[2], bytes[3]]) as usize)
}

fn write_length(buf: &mut Vec<u8>, len: usize) -> Result<(), NameValueError> {
    if len > MAX_STRING_LENGTH {
        return Err(NameValueError::TooLong(len));
    }

    if len <= SHORT_LENGTH_MAX {
        buf.push(len as u8);
    } else {
        buf.extend_from_slice(&(len as u32 | 0x8000_0000).to_be_bytes());
    }

    Ok(())
}
