//! Event metadata backing snapshot-marker resolution.

use serde::{Deserialize, Serialize};

/// Per (branch, module) metadata recorded by the event store.
///
/// The sync core only reads this; writing it is the event store's
/// concern. `last_closed_date` is the most recent hard-close boundary:
/// clients holding markers older than it must fully resync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventMeta {
    /// Marker recorded at the last snapshot.
    pub last_snapshot_marker: Option<String>,
    /// Current business day (date-granularity string).
    pub current_day: Option<String>,
    /// Last recorded hard-close boundary.
    pub last_closed_date: Option<String>,
}

impl EventMeta {
    /// Returns the trimmed hard-close boundary, when one is recorded.
    pub fn closed_boundary(&self) -> Option<&str> {
        self.last_closed_date
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_boundary_ignored() {
        let meta = EventMeta {
            last_closed_date: Some("   ".into()),
            ..EventMeta::default()
        };
        assert_eq!(meta.closed_boundary(), None);
    }

    #[test]
    fn deserializes_camel_case() {
        let meta: EventMeta = serde_json::from_str(
            r#"{ "lastSnapshotMarker": "2026-08-25", "currentDay": "2026-08-26" }"#,
        )
        .unwrap();
        assert_eq!(meta.last_snapshot_marker.as_deref(), Some("2026-08-25"));
        assert_eq!(meta.current_day.as_deref(), Some("2026-08-26"));
    }
}
