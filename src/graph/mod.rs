//! Graph projection model.
//!
//! UI-facing projections of the engine's filter pipeline: nodes derive
//! from filters, edges from input-pin source references. The
//! projections carry ephemeral view state (position, selection,
//! dragging, animation) that the reconciler preserves across snapshots
//! while recomputing everything derivable from current filter
//! attributes.

mod reconcile;

pub use reconcile::{default_position, reconcile};

use serde::{Deserialize, Serialize};

use crate::protocol::FilterSnapshot;

/// Node fill for source filters (no input pins).
pub const SOURCE_FILL: &str = "#4ade80";

/// Node fill for sink filters (no output pins).
pub const SINK_FILL: &str = "#ef4444";

/// 2D position of a node on the consumer's canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Create a position.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Media category derived from a filter's name/type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterCategory {
    Video,
    Audio,
    Text,
    Image,
    Other,
}

impl FilterCategory {
    /// Classify a filter by substring heuristics over its lowercased
    /// name and type tag. Precedence: video, audio, text, image, other.
    pub fn classify(filter_name: &str, filter_type: &str) -> Self {
        let name = filter_name.to_lowercase();
        let kind = filter_type.to_lowercase();

        if name.contains("video")
            || kind.contains("vout")
            || kind.contains("vflip")
            || kind.contains("nvdec")
        {
            FilterCategory::Video
        } else if name.contains("audio") || kind.contains("aout") || kind.contains("aenc") {
            FilterCategory::Audio
        } else if name.contains("text") || name.contains("subt") || kind.contains("text") {
            FilterCategory::Text
        } else if name.contains("image") || kind.contains("img") {
            FilterCategory::Image
        } else {
            FilterCategory::Other
        }
    }

    /// Display color for this category.
    pub fn color(self) -> &'static str {
        match self {
            FilterCategory::Video => "#3b82f6",
            FilterCategory::Audio => "#10b981",
            FilterCategory::Text => "#f59e0b",
            FilterCategory::Image => "#8b5cf6",
            FilterCategory::Other => "#6b7280",
        }
    }
}

/// One node of the projected graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    /// Node id: decimal string of the filter's `idx`.
    pub id: String,
    /// Display label (the filter's name). Recomputed every snapshot.
    pub label: String,
    /// Derived media category. Recomputed every snapshot.
    pub category: FilterCategory,
    /// Fill color: source/sink override, else the category color.
    /// Recomputed every snapshot.
    pub fill: &'static str,
    /// Canvas position. Preserved across snapshots for surviving ids.
    pub position: Position,
    /// Selection flag. Preserved across snapshots.
    pub selected: bool,
    /// True while the consumer is dragging the node. Preserved across
    /// snapshots.
    pub dragging: bool,
    /// The underlying filter state this node projects.
    pub filter: FilterSnapshot,
}

/// One edge of the projected graph (an input pin's source reference).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    /// Composite id `{source_idx}-{target_idx}-{pinName}`, unique per
    /// producer/consumer/pin triple.
    pub id: String,
    /// Producing node id.
    pub source: String,
    /// Consuming node id.
    pub target: String,
    /// Name of the input pin on the consuming filter.
    pub pin: String,
    /// Display label: `"{pin} ({percent}%)"`. Recomputed every snapshot.
    pub label: String,
    /// Buffer fill of the pin, 0 when the capacity is unbounded.
    /// Recomputed every snapshot.
    pub buffer_percent: i64,
    /// Stroke color from the target filter's category. Recomputed
    /// every snapshot.
    pub color: &'static str,
    /// Selection flag. Preserved across snapshots by edge id.
    pub selected: bool,
    /// Animation flag. New edges start animated; preserved thereafter.
    pub animated: bool,
}
