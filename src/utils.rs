use std::time::SystemTime;

use crate::{TableError, TableResult};

/// Returns the current time as milliseconds since Unix Epoch, as needed for
/// saving in the table metadata and snapshots.
pub fn current_time_ms() -> TableResult<i64> {
    let now = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| TableError::CustomError {
            message: "system clock before Unix Epoch time".to_string()
        })?;

    i64::try_from(now.as_millis())
        .map_err(|_| TableError::CustomError {
            message: "system clock does not fit in long".to_string()
        })
}

/// Returns a timestamp that is strictly greater than `previous_ms`, so that
/// commits made within the same millisecond still order correctly.
pub fn next_timestamp_ms(previous_ms: i64) -> TableResult<i64> {
    Ok(current_time_ms()?.max(previous_ms + 1))
}
