//! # graphmon-client
//!
//! Live monitoring client for a remote media filter engine.
//!
//! Connects to the engine's WebSocket endpoint, mirrors its filter
//! graph as renderable nodes and edges, and maintains buffer and
//! throughput metrics for filters under active monitoring. Consumers
//! get a non-blocking command API, snapshot queries, and a broadcast
//! event stream; one background session task owns the connection and
//! all protocol state.
//!
//! ## Architecture
//!
//! - **transport**: WebSocket reader/writer halves over `tokio-tungstenite`
//! - **protocol**: wire framing (`CONI` control tag + JSON) and the
//!   typed message set, validated at the boundary
//! - **session**: connection state machine with exponential reconnect,
//!   command handling, and inbound routing
//! - **graph**: pure snapshot-to-graph reconciliation preserving
//!   per-node view state
//! - **metrics**: buffer health, byte-rates, and bounded history with
//!   throttled real-time emissions
//!
//! ## Example
//!
//! ```no_run
//! use graphmon_client::{ClientEvent, MonitorClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = MonitorClient::builder()
//!         .address("ws://127.0.0.1:17815/rmt")
//!         .build();
//!
//!     let mut events = client.events();
//!     client.connect()?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let ClientEvent::GraphUpdated { nodes, edges } = event {
//!             println!("{} filters, {} connections", nodes.len(), edges.len());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod graph;
pub mod metrics;
pub mod protocol;
pub mod transport;

mod client;
mod session;

pub use client::{
    ClientConfig, ClientEvent, ConnectionState, MonitorClient, MonitorClientBuilder,
    DEFAULT_ENDPOINT, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_MONITORS,
};
pub use error::{MonitorError, Result};
