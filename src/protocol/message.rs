//! Typed protocol messages.
//!
//! Every protocol message carries a `message` field naming its kind.
//! The kind set is closed: {filters, update, details, get_all_filters,
//! get_details, stop_details}. Modeling it as an internally tagged
//! enum means an unknown kind fails to decode: validation and parsing
//! are one step, and routing gets compile-time exhaustiveness.

use serde::{Deserialize, Serialize};

use crate::protocol::filter::{FilterId, FilterSnapshot};

/// One protocol message, inbound or outbound.
///
/// `Filters`/`Update`/`Details` arrive from the engine;
/// `GetAllFilters`/`GetDetails`/`StopDetails` are commands sent to it.
/// The engine never answers a command kind with a command kind, but the
/// decoder accepts all six so that routing stays a single exhaustive
/// match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum WireMessage {
    /// Full snapshot: the complete filter list, replacing the prior view.
    Filters {
        /// All filters currently in the engine's graph.
        filters: Vec<FilterSnapshot>,
    },
    /// Incremental snapshot. Same shape as `Filters` and merged
    /// identically; the engine distinguishes them, the client does not.
    Update {
        /// All filters currently in the engine's graph.
        filters: Vec<FilterSnapshot>,
    },
    /// Detail push for one filter (current-detail focus or an active
    /// subscription).
    Details {
        /// The filter's full state.
        filter: FilterSnapshot,
    },
    /// Request the full filter list.
    GetAllFilters,
    /// Start detail pushes for one filter.
    GetDetails {
        /// Target filter index.
        idx: FilterId,
    },
    /// Stop detail pushes for one filter.
    StopDetails {
        /// Target filter index.
        idx: FilterId,
    },
}

impl WireMessage {
    /// Kind tag as it appears in the `message` field.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Filters { .. } => "filters",
            WireMessage::Update { .. } => "update",
            WireMessage::Details { .. } => "details",
            WireMessage::GetAllFilters => "get_all_filters",
            WireMessage::GetDetails { .. } => "get_details",
            WireMessage::StopDetails { .. } => "stop_details",
        }
    }

    /// True for the command kinds the client sends to the engine.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            WireMessage::GetAllFilters
                | WireMessage::GetDetails { .. }
                | WireMessage::StopDetails { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_filters_message() {
        let msg: WireMessage = serde_json::from_str(
            r#"{
                "message": "filters",
                "filters": [
                    {"idx": 1, "name": "src", "type": "fin", "status": null, "bytes_done": 0},
                    {"idx": 2, "name": "vout", "type": "vout", "status": "ok", "bytes_done": 5}
                ]
            }"#,
        )
        .unwrap();

        match msg {
            WireMessage::Filters { filters } => {
                assert_eq!(filters.len(), 2);
                assert_eq!(filters[0].idx, 1);
                assert_eq!(filters[1].name, "vout");
            }
            other => panic!("expected filters, got {}", other.kind()),
        }
    }

    #[test]
    fn test_decode_update_message() {
        let msg: WireMessage = serde_json::from_str(
            r#"{"message": "update", "filters": []}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), "update");
    }

    #[test]
    fn test_decode_details_message() {
        let msg: WireMessage = serde_json::from_str(
            r#"{
                "message": "details",
                "filter": {
                    "idx": 7,
                    "name": "aout",
                    "type": "aout",
                    "status": "playing",
                    "bytes_done": 4096,
                    "ipid": {"audio1": {"buffer": 80, "buffer_total": 100, "source_idx": 3}}
                }
            }"#,
        )
        .unwrap();

        match msg {
            WireMessage::Details { filter } => {
                assert_eq!(filter.idx, 7);
                assert_eq!(filter.bytes_done, 4096);
            }
            other => panic!("expected details, got {}", other.kind()),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result: serde_json::Result<WireMessage> =
            serde_json::from_str(r#"{"message": "reboot", "force": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_kind_is_rejected() {
        let result: serde_json::Result<WireMessage> =
            serde_json::from_str(r#"{"filters": []}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_details_with_invalid_filter_is_rejected() {
        // String bytes_done must reject the whole message.
        let result: serde_json::Result<WireMessage> = serde_json::from_str(
            r#"{
                "message": "details",
                "filter": {"idx": 1, "name": "x", "type": "y", "status": null, "bytes_done": "12"}
            }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_command_serialization() {
        assert_eq!(
            serde_json::to_string(&WireMessage::GetAllFilters).unwrap(),
            r#"{"message":"get_all_filters"}"#
        );
        assert_eq!(
            serde_json::to_string(&WireMessage::GetDetails { idx: 4 }).unwrap(),
            r#"{"message":"get_details","idx":4}"#
        );
        assert_eq!(
            serde_json::to_string(&WireMessage::StopDetails { idx: 9 }).unwrap(),
            r#"{"message":"stop_details","idx":9}"#
        );
    }

    #[test]
    fn test_kind_accessor() {
        assert_eq!(WireMessage::GetAllFilters.kind(), "get_all_filters");
        assert!(WireMessage::GetDetails { idx: 0 }.is_command());
        assert!(!WireMessage::Filters { filters: vec![] }.is_command());
    }
}
