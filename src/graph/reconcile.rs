//! Snapshot reconciliation.
//!
//! Pure, synchronous projection of a filter snapshot into nodes and
//! edges. Everything derivable from current filter attributes (label,
//! category, fill, edge color, buffer percentage) is recomputed on
//! every call; everything that belongs to the consumer's view
//! (position, selection, dragging, animation) is preserved by id from
//! the previous collections. No hidden state: the same inputs always
//! produce the same outputs, which makes snapshot replay deterministic.

use std::collections::HashMap;

use crate::graph::{FilterCategory, GraphEdge, GraphNode, Position, SINK_FILL, SOURCE_FILL};
use crate::protocol::{FilterSnapshot, PinState};

/// Deterministic default position for a node that did not exist in the
/// previous snapshot: a 3-column grid indexed by the filter's position
/// within the snapshot array.
pub fn default_position(index: usize) -> Position {
    Position {
        x: 150.0 + (index % 3) as f64 * 300.0,
        y: 100.0 + (index / 3) as f64 * 200.0,
    }
}

/// Reconcile a new filter snapshot against the previous graph.
///
/// Returns the replacement node and edge collections. The previous
/// collections are only read; callers typically swap the returned
/// values in wholesale.
pub fn reconcile(
    filters: &[FilterSnapshot],
    prev_nodes: &[GraphNode],
    prev_edges: &[GraphEdge],
) -> (Vec<GraphNode>, Vec<GraphEdge>) {
    let nodes_by_id: HashMap<&str, &GraphNode> =
        prev_nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let edges_by_id: HashMap<&str, &GraphEdge> =
        prev_edges.iter().map(|e| (e.id.as_str(), e)).collect();

    let nodes = filters
        .iter()
        .enumerate()
        .map(|(index, filter)| {
            let id = filter.node_id();
            build_node(filter, index, nodes_by_id.get(id.as_str()).copied())
        })
        .collect();

    let mut edges = Vec::new();
    for filter in filters {
        for (pin_name, pin) in &filter.ipid {
            if let Some(source_idx) = pin.source_idx {
                edges.push(build_edge(filter, pin_name, pin, source_idx, &edges_by_id));
            }
        }
    }

    (nodes, edges)
}

fn build_node(filter: &FilterSnapshot, index: usize, previous: Option<&GraphNode>) -> GraphNode {
    let category = FilterCategory::classify(&filter.name, &filter.filter_type);
    let fill = if filter.nb_ipid == Some(0) {
        SOURCE_FILL
    } else if filter.nb_opid == Some(0) {
        SINK_FILL
    } else {
        category.color()
    };

    GraphNode {
        id: filter.node_id(),
        label: filter.name.clone(),
        category,
        fill,
        position: previous
            .map(|node| node.position)
            .unwrap_or_else(|| default_position(index)),
        selected: previous.map(|node| node.selected).unwrap_or(false),
        dragging: previous.map(|node| node.dragging).unwrap_or(false),
        filter: filter.clone(),
    }
}

fn build_edge(
    filter: &FilterSnapshot,
    pin_name: &str,
    pin: &PinState,
    source_idx: i64,
    previous: &HashMap<&str, &GraphEdge>,
) -> GraphEdge {
    let id = format!("{}-{}-{}", source_idx, filter.idx, pin_name);
    let category = FilterCategory::classify(&filter.name, &filter.filter_type);

    let buffer_percent = if pin.buffer_total > 0 {
        (pin.buffer as f64 / pin.buffer_total as f64 * 100.0).round() as i64
    } else {
        0
    };

    let prior = previous.get(id.as_str()).copied();

    GraphEdge {
        source: source_idx.to_string(),
        target: filter.idx.to_string(),
        pin: pin_name.to_string(),
        label: format!("{} ({}%)", pin_name, buffer_percent),
        buffer_percent,
        color: category.color(),
        selected: prior.map(|edge| edge.selected).unwrap_or(false),
        animated: prior.map(|edge| edge.animated).unwrap_or(true),
        id,
    }
}
