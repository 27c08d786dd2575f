//! Counter encoding: a counter is an 8-byte signed big-endian integer.

use crate::error::StateError;

/// Size in bytes of an encoded counter.
pub const COUNTER_SIZE: usize = 8;

#[must_use]
pub fn encode_counter(value: i64) -> [u8; COUNTER_SIZE] {
    value.to_be_bytes()
}

/// Decodes counter bytes. An absent entry reads as 0.
///
/// # Errors
///
/// Returns [`StateError::CounterTypeConflict`] when `bytes` is present but
/// not exactly [`COUNTER_SIZE`] long, i.e. the key holds a raw value.
pub fn decode_counter(bytes: Option<&[u8]>) -> Result<i64, StateError> {
    let Some(bytes) = bytes else {
        return Ok(0);
    };
    let array: [u8; COUNTER_SIZE] = bytes
        .try_into()
        .map_err(|_| StateError::CounterTypeConflict { len: bytes.len() })?;
    Ok(i64::from_be_bytes(array))
}

/// Adds `amount` to an encoded counter, treating absence as 0.
///
/// # Errors
///
/// Returns [`StateError::CounterTypeConflict`] for non-counter bytes and
/// [`StateError::InvalidArgument`] when the sum overflows `i64`.
pub fn merge_counter(current: Option<&[u8]>, amount: i64) -> Result<i64, StateError> {
    decode_counter(current)?
        .checked_add(amount)
        .ok_or_else(|| StateError::invalid(format!("counter overflow adding {amount}")))
}
