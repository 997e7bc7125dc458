//! Filter and pin payload model.
//!
//! These are the wire shapes carried inside `filters`, `update`, and
//! `details` messages. Deserialization doubles as schema validation:
//! the required fields (`idx`, `name`, `type`, `status`, `bytes_done`)
//! must be present with the right types or the whole payload is
//! rejected, so a malformed filter never partially updates state.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Engine-assigned filter index. Unique and stable for the filter's
/// lifetime; the string form doubles as the graph node id.
pub type FilterId = u32;

/// One processing filter as reported by the engine.
///
/// Unknown wire fields are ignored; optional fields default so that
/// terse snapshots (as sent in `filters` arrays) and rich detail
/// payloads share one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSnapshot {
    /// Engine-assigned index (identity).
    pub idx: FilterId,
    /// Human-readable filter name.
    pub name: String,
    /// Filter kind/type tag (e.g. "vout", "aenc").
    #[serde(rename = "type")]
    pub filter_type: String,
    /// Free-text status line. Present-but-nullable on the wire:
    /// a missing field is a schema violation, `null` is not.
    #[serde(deserialize_with = "nullable_string")]
    pub status: Option<String>,
    /// Cumulative bytes processed.
    pub bytes_done: u64,
    /// Engine-side identifier string, when assigned.
    #[serde(default, rename = "ID")]
    pub id: Option<String>,
    /// Inherited tag, when assigned.
    #[serde(default)]
    pub itag: Option<String>,
    /// Declared number of input pins. `None` when the engine did not
    /// report it, which is distinct from an explicit zero.
    #[serde(default)]
    pub nb_ipid: Option<u32>,
    /// Declared number of output pins.
    #[serde(default)]
    pub nb_opid: Option<u32>,
    /// Cumulative packets sent.
    #[serde(default)]
    pub packets_sent: u64,
    /// Cumulative packets processed.
    #[serde(default)]
    pub packets_done: u64,
    /// Input pins by name. Ordered map so "first declared" is
    /// deterministic across snapshots.
    #[serde(default)]
    pub ipid: BTreeMap<String, PinState>,
    /// Output pins by name.
    #[serde(default)]
    pub opid: BTreeMap<String, PinState>,
}

impl FilterSnapshot {
    /// First input pin in enumeration order, if any.
    ///
    /// Used for the throttled real-time metrics sample. Picking one
    /// pin is a known simplification; the ordered map at least makes
    /// the choice deterministic.
    pub fn first_input_pin(&self) -> Option<(&str, &PinState)> {
        self.ipid.iter().next().map(|(name, pin)| (name.as_str(), pin))
    }

    /// Graph node id for this filter (decimal string of `idx`).
    pub fn node_id(&self) -> String {
        self.idx.to_string()
    }
}

/// State of one named pin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PinState {
    /// Current buffer occupancy.
    #[serde(default)]
    pub buffer: i64,
    /// Buffer capacity. A value of −1 (or any value ≤ 0) means
    /// unbounded/dynamically sized, not an error.
    #[serde(default)]
    pub buffer_total: i64,
    /// For input pins: index of the producing filter. The sole source
    /// of edge information; absent on source pins.
    #[serde(default)]
    pub source_idx: Option<i64>,
}

/// Deserialize an `Option<String>` while still requiring the field to
/// be present: `null` maps to `None`, a missing field is an error.
fn nullable_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
}
