//! Position patch composition.
//!
//! After every non-empty page the crawler persists a patch: the
//! direction's offset, the page's derived date-modified (unless the
//! latch is engaged) and the sticky session cookie.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::offset::Direction;

/// Partial update for the persisted feed position. `None` fields are
/// left untouched by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backward_offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_date_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_date_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

/// Scan items from the tail and return the first `dateModified` whose
/// `status` is outside the skip set. Skip-status items mutate their
/// modified time while still inside one workflow phase, which would
/// make the barrier drift.
pub fn derived_date_modified<'a>(data: &'a [Value], skip_statuses: &HashSet<String>) -> Option<&'a str> {
    for item in data.iter().rev() {
        if let Some(status) = item.get("status").and_then(Value::as_str) {
            if skip_statuses.contains(status) {
                continue;
            }
        }
        return item.get("dateModified").and_then(Value::as_str);
    }
    None
}

/// Compose the patch for one non-empty page.
pub fn build_patch(
    direction: Direction,
    next_offset: &str,
    data: &[Value],
    server_id: Option<String>,
    latched: bool,
    skip_statuses: &HashSet<String>,
) -> PositionPatch {
    let mut patch = PositionPatch {
        server_id,
        ..Default::default()
    };
    match direction {
        Direction::Forward => patch.forward_offset = Some(next_offset.to_string()),
        Direction::Backward => patch.backward_offset = Some(next_offset.to_string()),
    }
    if !latched {
        if let Some(dm) = derived_date_modified(data, skip_statuses) {
            match direction {
                Direction::Forward => patch.latest_date_modified = Some(dm.to_string()),
                Direction::Backward => patch.earliest_date_modified = Some(dm.to_string()),
            }
        }
    }
    patch
}

/// In-process mirror of the persisted `lock_date_modified` flag, shared
/// by both crawl directions. The store keeps the durable copy; this one
/// answers the per-page "omit date-modified?" question without a read.
#[derive(Clone, Default)]
pub struct DateModifiedLatch {
    inner: Arc<AtomicBool>,
}

impl DateModifiedLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize from the persisted record at supervisor start.
    pub fn seed(&self, value: bool) {
        self.inner.store(value, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }

    pub fn engage(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.inner.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn skip(statuses: &[&str]) -> HashSet<String> {
        statuses.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_derived_date_modified_takes_last_item() {
        let data = vec![
            json!({"dateModified": "2024-11-08T10:00:00+02:00"}),
            json!({"dateModified": "2024-11-08T11:00:00+02:00"}),
        ];
        assert_eq!(
            derived_date_modified(&data, &HashSet::new()),
            Some("2024-11-08T11:00:00+02:00")
        );
    }

    #[test]
    fn test_derived_date_modified_skips_unstable_statuses() {
        let data = vec![
            json!({"dateModified": "A", "status": "complete"}),
            json!({"dateModified": "B", "status": "active.tendering"}),
        ];
        assert_eq!(
            derived_date_modified(&data, &skip(&["active.tendering"])),
            Some("A")
        );
    }

    #[test]
    fn test_derived_date_modified_none_when_all_skipped() {
        let data = vec![json!({"dateModified": "B", "status": "active.tendering"})];
        assert_eq!(derived_date_modified(&data, &skip(&["active.tendering"])), None);
    }

    #[test]
    fn test_derived_date_modified_item_without_status_qualifies() {
        let data = vec![
            json!({"dateModified": "A", "status": "active.tendering"}),
            json!({"dateModified": "B"}),
        ];
        assert_eq!(
            derived_date_modified(&data, &skip(&["active.tendering"])),
            Some("B")
        );
    }

    #[test]
    fn test_forward_patch_fields() {
        let data = vec![json!({"dateModified": "D"})];
        let patch = build_patch(
            Direction::Forward,
            "X",
            &data,
            Some("007".to_string()),
            false,
            &HashSet::new(),
        );
        assert_eq!(
            patch,
            PositionPatch {
                forward_offset: Some("X".to_string()),
                latest_date_modified: Some("D".to_string()),
                server_id: Some("007".to_string()),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_backward_patch_fields() {
        let data = vec![json!({"dateModified": "D"})];
        let patch = build_patch(
            Direction::Backward,
            "X",
            &data,
            Some("007".to_string()),
            false,
            &HashSet::new(),
        );
        assert_eq!(
            patch,
            PositionPatch {
                backward_offset: Some("X".to_string()),
                earliest_date_modified: Some("D".to_string()),
                server_id: Some("007".to_string()),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_latched_patch_omits_date_modified() {
        let data = vec![json!({"dateModified": "D"})];
        let patch = build_patch(Direction::Forward, "X", &data, None, true, &HashSet::new());
        assert_eq!(patch.latest_date_modified, None);
        assert_eq!(patch.forward_offset, Some("X".to_string()));
        assert_eq!(patch.server_id, None);
    }

    #[test]
    fn test_latch_round_trip() {
        let latch = DateModifiedLatch::new();
        assert!(!latch.is_set());
        latch.engage();
        assert!(latch.is_set());
        let peer = latch.clone();
        peer.clear();
        assert!(!latch.is_set());
        latch.seed(true);
        assert!(peer.is_set());
    }
}
