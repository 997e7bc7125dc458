//! Client handle, builder, and shared view state.
//!
//! [`MonitorClientBuilder`] provides a fluent API for configuring the
//! endpoint and limits; [`MonitorClient`] is the cheaply cloneable
//! handle it produces. Every command method is a non-blocking send to
//! the background session task, every query reads a consistent
//! snapshot from shared state, and push-style consumers subscribe via
//! [`MonitorClient::events`].
//!
//! # Example
//!
//! ```no_run
//! use graphmon_client::{ClientEvent, MonitorClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = MonitorClient::builder()
//!         .address("ws://127.0.0.1:17815/rmt")
//!         .max_monitors(4)
//!         .build();
//!
//!     let mut events = client.events();
//!     client.connect()?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             ClientEvent::GraphUpdated { nodes, .. } => {
//!                 println!("graph has {} filters", nodes.len());
//!             }
//!             ClientEvent::Error { message } => eprintln!("error: {}", message),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::error::{MonitorError, Result};
use crate::graph::{GraphEdge, GraphNode, Position};
use crate::metrics::{
    FilterMetric, MetricsEngine, PinBufferReport, RealtimeMetrics, DEFAULT_MAX_HISTORY,
    DEFAULT_METRICS_WINDOW,
};
use crate::protocol::{FilterId, FilterSnapshot, WireMessage};
use crate::session::{Session, SessionCommand};

/// Default engine endpoint.
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:17815/rmt";

/// Default bound on concurrent filter subscriptions.
pub const DEFAULT_MAX_MONITORS: usize = 6;

/// Default capacity of the broadcast event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Connection configuration and limits.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the engine.
    pub address: String,
    /// Budget for one connection attempt, handshake included.
    pub connect_timeout: Duration,
    /// First reconnect delay; doubles per consecutive failure.
    pub reconnect_base: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_cap: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// Per-filter real-time metrics emission window.
    pub metrics_window: Duration,
    /// Bound on concurrent filter subscriptions, clamped to `[1, 12]`.
    pub max_monitors: usize,
    /// Bound on per-filter metric history.
    pub max_history: usize,
    /// Capacity of the broadcast event channel; slow consumers that
    /// fall further behind start losing the oldest events.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            metrics_window: DEFAULT_METRICS_WINDOW,
            max_monitors: DEFAULT_MAX_MONITORS,
            max_history: DEFAULT_MAX_HISTORY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Where the session currently stands with the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and none in progress.
    #[default]
    Disconnected,
    /// First attempt of a connection cycle in flight.
    Connecting,
    /// Connected and serving traffic.
    Connected,
    /// Connection lost or attempt failed; retry number `attempt` is
    /// scheduled.
    Reconnecting {
        /// 1-based reconnect attempt.
        attempt: u32,
    },
    /// The attempt budget is exhausted; only an explicit
    /// [`MonitorClient::connect`] leaves this state.
    Failed,
}

/// Push notification from the session task.
///
/// Delivered on a broadcast channel: every subscriber sees every
/// event, and a subscriber that lags beyond the channel capacity
/// loses the oldest events first.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established; a graph snapshot has been requested.
    Connected,
    /// Connection ended, manually (`reason` is `None`) or not.
    Disconnected {
        /// Close reason supplied by the peer, when there was one.
        reason: Option<String>,
    },
    /// Something went wrong that the consumer should surface.
    Error {
        /// Human-readable description, also available via
        /// [`MonitorClient::last_error`].
        message: String,
    },
    /// The graph was rebuilt from a snapshot.
    GraphUpdated {
        /// New node collection, shared with the view state.
        nodes: Arc<Vec<GraphNode>>,
        /// New edge collection, shared with the view state.
        edges: Arc<Vec<GraphEdge>>,
    },
    /// Fresh details for the current-detail filter.
    FilterDetail {
        /// Validated detail payload.
        filter: FilterSnapshot,
    },
    /// Fresh details for a subscribed filter.
    FilterData {
        /// Validated detail payload.
        filter: FilterSnapshot,
    },
    /// A subscription was added.
    FilterSubscribed {
        /// Subscribed filter.
        id: FilterId,
    },
    /// A subscription was removed, explicitly or by a limit change.
    FilterUnsubscribed {
        /// Unsubscribed filter.
        id: FilterId,
    },
    /// Throttled real-time byte counters for a subscribed filter.
    RealtimeMetrics {
        /// Monitored filter.
        id: FilterId,
        /// Counters after this sample.
        metrics: RealtimeMetrics,
    },
    /// The selected node changed.
    SelectionChanged {
        /// Newly selected node id, `None` for deselection.
        node: Option<String>,
    },
}

/// Everything query methods can see. Written only by the session
/// task.
#[derive(Debug)]
pub(crate) struct ViewState {
    pub(crate) connection: ConnectionState,
    pub(crate) loading: bool,
    pub(crate) last_error: Option<String>,
    pub(crate) filters: Vec<FilterSnapshot>,
    pub(crate) nodes: Arc<Vec<GraphNode>>,
    pub(crate) edges: Arc<Vec<GraphEdge>>,
    pub(crate) selected_node: Option<String>,
    pub(crate) current_filter: Option<FilterId>,
    pub(crate) filter_detail: Option<FilterSnapshot>,
    pub(crate) subscriptions: Vec<FilterId>,
    pub(crate) monitored: HashMap<FilterId, FilterSnapshot>,
    pub(crate) max_monitors: usize,
    pub(crate) metrics: MetricsEngine,
}

impl ViewState {
    pub(crate) fn new(config: &ClientConfig) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            loading: false,
            last_error: None,
            filters: Vec::new(),
            nodes: Arc::new(Vec::new()),
            edges: Arc::new(Vec::new()),
            selected_node: None,
            current_filter: None,
            filter_detail: None,
            subscriptions: Vec::new(),
            monitored: HashMap::new(),
            max_monitors: config.max_monitors.clamp(1, 12),
            metrics: MetricsEngine::new(config.max_history, config.metrics_window),
        }
    }
}

/// Shared, read-mostly view state behind a synchronous lock. Critical
/// sections are short and never held across awaits.
pub(crate) type SharedView = Arc<RwLock<ViewState>>;

/// Builder for configuring and creating a [`MonitorClient`].
#[derive(Debug, Default)]
pub struct MonitorClientBuilder {
    config: ClientConfig,
}

impl MonitorClientBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine endpoint.
    ///
    /// Default: `ws://127.0.0.1:17815/rmt`
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    /// Set the per-attempt connection timeout.
    ///
    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the first reconnect delay. Subsequent delays double per
    /// consecutive failure.
    ///
    /// Default: 1 second
    pub fn reconnect_base(mut self, base: Duration) -> Self {
        self.config.reconnect_base = base;
        self
    }

    /// Set the upper bound on reconnect delays.
    ///
    /// Default: 10 seconds
    pub fn reconnect_cap(mut self, cap: Duration) -> Self {
        self.config.reconnect_cap = cap;
        self
    }

    /// Set how many consecutive connection failures are tolerated
    /// before the session parks at [`ConnectionState::Failed`].
    ///
    /// Default: 5
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    /// Set the real-time metrics emission window per filter.
    ///
    /// Default: 1 second
    pub fn metrics_window(mut self, window: Duration) -> Self {
        self.config.metrics_window = window;
        self
    }

    /// Set the subscription limit. Clamped to `[1, 12]`.
    ///
    /// Default: 6
    pub fn max_monitors(mut self, limit: usize) -> Self {
        self.config.max_monitors = limit;
        self
    }

    /// Set the per-filter metric history bound.
    ///
    /// Default: 50
    pub fn max_history(mut self, limit: usize) -> Self {
        self.config.max_history = limit;
        self
    }

    /// Set the broadcast event channel capacity.
    ///
    /// Default: 256
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Spawn the session task and return the client handle.
    ///
    /// The session idles until [`MonitorClient::connect`] is called.
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> MonitorClient {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(self.config.event_capacity);
        let shared: SharedView = Arc::new(RwLock::new(ViewState::new(&self.config)));

        let session = Session::new(self.config, command_rx, events.clone(), Arc::clone(&shared));
        tokio::spawn(session.run());

        MonitorClient {
            commands,
            events,
            shared,
        }
    }
}

/// Handle to a running monitor session.
///
/// Clones share the same session, state, and event stream. The
/// session task exits once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct MonitorClient {
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<ClientEvent>,
    shared: SharedView,
}

impl MonitorClient {
    /// Create a builder with default configuration.
    pub fn builder() -> MonitorClientBuilder {
        MonitorClientBuilder::new()
    }

    /// Create a client with default configuration.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect_default() -> Self {
        Self::builder().build()
    }

    /// Subscribe to the event stream.
    ///
    /// Each receiver sees every event emitted after this call.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    // ---- Commands ------------------------------------------------

    /// Start a connection cycle against the configured endpoint. No-op
    /// while a cycle is already running; from
    /// [`ConnectionState::Failed`] it starts a fresh cycle.
    pub fn connect(&self) -> Result<()> {
        self.command(SessionCommand::Connect { address: None })
    }

    /// Start a connection cycle against `address`, which replaces the
    /// configured endpoint for this and all later cycles. During a
    /// backoff wait this retries immediately at the new address.
    pub fn connect_to(&self, address: impl Into<String>) -> Result<()> {
        self.command(SessionCommand::Connect {
            address: Some(address.into()),
        })
    }

    /// Stop the session cleanly: no reconnection, subscriptions and
    /// the current-detail filter are cleared, graph and metric data
    /// survive.
    pub fn disconnect(&self) -> Result<()> {
        self.command(SessionCommand::Disconnect)
    }

    /// Subscribe to a filter's detail stream. Ignored when already
    /// subscribed; refused with a warning when the monitor limit is
    /// reached.
    pub fn subscribe_to_filter(&self, id: FilterId) -> Result<()> {
        self.command(SessionCommand::Subscribe(id))
    }

    /// Remove a subscription and drop the filter's monitoring data.
    pub fn unsubscribe_from_filter(&self, id: FilterId) -> Result<()> {
        self.command(SessionCommand::Unsubscribe(id))
    }

    /// Switch the single current-detail filter. `None` stops the
    /// active detail stream without starting a new one.
    pub fn set_current_filter(&self, id: Option<FilterId>) -> Result<()> {
        self.command(SessionCommand::SetCurrentFilter(id))
    }

    /// Mark a node as selected, `None` to deselect.
    pub fn select_node(&self, node: Option<String>) -> Result<()> {
        self.command(SessionCommand::SelectNode(node))
    }

    /// Sync a node position back from a layout layer so it survives
    /// snapshot reconciliation.
    pub fn set_node_position(
        &self,
        id: impl Into<String>,
        position: Position,
        dragging: bool,
    ) -> Result<()> {
        self.command(SessionCommand::SetNodePosition {
            id: id.into(),
            position,
            dragging,
        })
    }

    /// Change the subscription limit (clamped to `[1, 12]`),
    /// truncating the newest subscriptions over it.
    pub fn set_max_monitors(&self, limit: usize) -> Result<()> {
        self.command(SessionCommand::SetMaxMonitors(limit))
    }

    /// Change the per-filter metric history bound, truncating
    /// existing history to the most recent points.
    pub fn set_max_history(&self, limit: usize) -> Result<()> {
        self.command(SessionCommand::SetMaxHistory(limit))
    }

    /// Send a raw protocol message. Skipped with a warning while
    /// disconnected.
    pub fn send_command(&self, message: WireMessage) -> Result<()> {
        self.command(SessionCommand::Send(message))
    }

    // ---- Queries -------------------------------------------------

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.view().connection
    }

    /// Whether the session is connected right now.
    pub fn is_connected(&self) -> bool {
        self.view().connection == ConnectionState::Connected
    }

    /// Whether a connection cycle is underway and the first snapshot
    /// has not arrived yet.
    pub fn is_loading(&self) -> bool {
        self.view().loading
    }

    /// Most recent error surfaced to consumers, cleared on a
    /// successful connect.
    pub fn last_error(&self) -> Option<String> {
        self.view().last_error.clone()
    }

    /// Last filter snapshot received from the engine.
    pub fn filters(&self) -> Vec<FilterSnapshot> {
        self.view().filters.clone()
    }

    /// Current graph nodes.
    pub fn nodes(&self) -> Arc<Vec<GraphNode>> {
        Arc::clone(&self.view().nodes)
    }

    /// Current graph edges.
    pub fn edges(&self) -> Arc<Vec<GraphEdge>> {
        Arc::clone(&self.view().edges)
    }

    /// Currently selected node id.
    pub fn selected_node(&self) -> Option<String> {
        self.view().selected_node.clone()
    }

    /// Filter whose detail stream feeds [`MonitorClient::filter_detail`].
    pub fn current_filter(&self) -> Option<FilterId> {
        self.view().current_filter
    }

    /// Latest details for the current-detail filter.
    pub fn filter_detail(&self) -> Option<FilterSnapshot> {
        self.view().filter_detail.clone()
    }

    /// Subscribed filters in subscription order.
    pub fn active_subscriptions(&self) -> Vec<FilterId> {
        self.view().subscriptions.clone()
    }

    /// Latest detail snapshot for a subscribed filter.
    pub fn monitored_filter(&self, id: FilterId) -> Option<FilterSnapshot> {
        self.view().monitored.get(&id).cloned()
    }

    /// Current subscription limit.
    pub fn max_monitors(&self) -> usize {
        self.view().max_monitors
    }

    /// Metric history for a filter, oldest first.
    pub fn metric_history(&self, id: FilterId) -> Vec<FilterMetric> {
        self.view().metrics.history(id)
    }

    /// Latest real-time byte counters for a filter.
    pub fn realtime_metrics(&self, id: FilterId) -> Option<RealtimeMetrics> {
        self.view().metrics.realtime(id).cloned()
    }

    /// Latest per-pin buffer analysis for a filter.
    pub fn buffer_stats(&self, id: FilterId) -> Option<PinBufferReport> {
        self.view().metrics.buffer_report(id).cloned()
    }

    /// Estimated processing rate for a filter in bytes per second.
    pub fn processing_rate(&self, id: FilterId) -> f64 {
        let view = self.view();
        let status = view
            .monitored
            .get(&id)
            .and_then(|filter| filter.status.as_deref())
            .or_else(|| {
                view.filter_detail
                    .as_ref()
                    .filter(|filter| filter.idx == id)
                    .and_then(|filter| filter.status.as_deref())
            });
        view.metrics.processing_rate(id, status)
    }

    fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| MonitorError::SessionClosed)
    }

    fn view(&self) -> RwLockReadGuard<'_, ViewState> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.address, DEFAULT_ENDPOINT);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_base, Duration::from_secs(1));
        assert_eq!(config.reconnect_cap, Duration::from_secs(10));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.max_monitors, 6);
        assert_eq!(config.max_history, 50);
    }

    #[test]
    fn test_builder_configuration() {
        let builder = MonitorClient::builder()
            .address("ws://10.0.0.2:9000/rmt")
            .connect_timeout(Duration::from_secs(3))
            .reconnect_base(Duration::from_millis(100))
            .reconnect_cap(Duration::from_secs(2))
            .max_reconnect_attempts(2)
            .metrics_window(Duration::from_millis(250))
            .max_monitors(4)
            .max_history(10)
            .event_capacity(16);

        assert_eq!(builder.config.address, "ws://10.0.0.2:9000/rmt");
        assert_eq!(builder.config.connect_timeout, Duration::from_secs(3));
        assert_eq!(builder.config.reconnect_base, Duration::from_millis(100));
        assert_eq!(builder.config.reconnect_cap, Duration::from_secs(2));
        assert_eq!(builder.config.max_reconnect_attempts, 2);
        assert_eq!(builder.config.metrics_window, Duration::from_millis(250));
        assert_eq!(builder.config.max_monitors, 4);
        assert_eq!(builder.config.max_history, 10);
        assert_eq!(builder.config.event_capacity, 16);
    }

    #[test]
    fn test_view_state_clamps_monitor_limit() {
        let oversized = ClientConfig {
            max_monitors: 50,
            ..ClientConfig::default()
        };
        assert_eq!(ViewState::new(&oversized).max_monitors, 12);

        let undersized = ClientConfig {
            max_monitors: 0,
            ..ClientConfig::default()
        };
        assert_eq!(ViewState::new(&undersized).max_monitors, 1);
    }

    #[tokio::test]
    async fn test_fresh_client_is_disconnected_and_empty() {
        let client = MonitorClient::builder().build();

        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(!client.is_loading());
        assert!(client.last_error().is_none());
        assert!(client.nodes().is_empty());
        assert!(client.edges().is_empty());
        assert!(client.active_subscriptions().is_empty());
        assert_eq!(client.max_monitors(), DEFAULT_MAX_MONITORS);
        assert_eq!(client.processing_rate(1), 0.0);
    }

    #[tokio::test]
    async fn test_subscriptions_apply_while_offline() {
        let client = MonitorClient::builder().build();
        let mut events = client.events();

        client.subscribe_to_filter(3).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event within deadline")
            .expect("event stream open");
        assert!(matches!(event, ClientEvent::FilterSubscribed { id: 3 }));
        assert_eq!(client.active_subscriptions(), vec![3]);
    }

    #[tokio::test]
    async fn test_subscription_limit_refuses_excess() {
        let client = MonitorClient::builder().max_monitors(2).build();
        let mut events = client.events();

        client.subscribe_to_filter(1).unwrap();
        client.subscribe_to_filter(2).unwrap();
        client.subscribe_to_filter(3).unwrap();
        // Processed strictly in order, so one extra round-trip proves
        // the refusal happened.
        client.unsubscribe_from_filter(1).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("event within deadline")
                .expect("event stream open");
            seen.push(event);
        }
        assert!(matches!(seen[0], ClientEvent::FilterSubscribed { id: 1 }));
        assert!(matches!(seen[1], ClientEvent::FilterSubscribed { id: 2 }));
        assert!(matches!(seen[2], ClientEvent::FilterUnsubscribed { id: 1 }));
        assert_eq!(client.active_subscriptions(), vec![2]);
    }

    #[tokio::test]
    async fn test_set_max_monitors_truncates_newest() {
        let client = MonitorClient::builder().build();
        let mut events = client.events();

        client.subscribe_to_filter(1).unwrap();
        client.subscribe_to_filter(2).unwrap();
        client.subscribe_to_filter(3).unwrap();
        client.set_max_monitors(1).unwrap();

        let mut unsubscribed = Vec::new();
        for _ in 0..5 {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("event within deadline")
                .expect("event stream open");
            if let ClientEvent::FilterUnsubscribed { id } = event {
                unsubscribed.push(id);
            }
        }
        assert_eq!(unsubscribed, vec![2, 3]);
        assert_eq!(client.active_subscriptions(), vec![1]);
        assert_eq!(client.max_monitors(), 1);
    }

    #[tokio::test]
    async fn test_select_node_round_trip() {
        let client = MonitorClient::builder().build();
        let mut events = client.events();

        client.select_node(Some("3".to_string())).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event within deadline")
            .expect("event stream open");
        match event {
            ClientEvent::SelectionChanged { node } => {
                assert_eq!(node.as_deref(), Some("3"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(client.selected_node().as_deref(), Some("3"));
    }
}
