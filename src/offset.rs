//! Feed direction and offset helpers.
//!
//! Offsets are opaque cursor strings. Many carry a UNIX timestamp prefix
//! (`1731103209.0000000001`, or composite `ts.seq.shard.hash`) which the
//! forward cooldown uses to judge how fresh the cursor is.

use chrono::Utc;

use crate::store::{
    BACKWARD_OFFSET_KEY, EARLIEST_DATE_MODIFIED_KEY, FORWARD_OFFSET_KEY, LATEST_DATE_MODIFIED_KEY,
};

/// Crawl direction. Forward tails new changes, backward drains history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// Value of the `descending` feed parameter.
    pub fn descending(self) -> &'static str {
        match self {
            Direction::Forward => "",
            Direction::Backward => "1",
        }
    }

    pub fn offset_key(self) -> &'static str {
        match self {
            Direction::Forward => FORWARD_OFFSET_KEY,
            Direction::Backward => BACKWARD_OFFSET_KEY,
        }
    }

    pub fn date_modified_key(self) -> &'static str {
        match self {
            Direction::Forward => LATEST_DATE_MODIFIED_KEY,
            Direction::Backward => EARLIEST_DATE_MODIFIED_KEY,
        }
    }
}

/// Age in seconds of an offset's timestamp prefix relative to `now_unix`.
///
/// Returns `None` when the prefix is not a UNIX timestamp.
pub fn offset_age_seconds(offset: &str, now_unix: i64) -> Option<i64> {
    let ts_part = offset.split('.').next().unwrap_or("");
    let ts = ts_part.parse::<i64>().ok()?;
    Some(now_unix - ts)
}

/// Age of an offset against the current wall clock.
pub fn offset_age_now(offset: &str) -> Option<i64> {
    offset_age_seconds(offset, Utc::now().timestamp())
}
