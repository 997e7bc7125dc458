//! Connection session state machine.
//!
//! One background task owns the protocol end to end: dialing, the
//! exponential reconnect schedule, outbound command encoding, inbound
//! frame routing, and every mutation of the shared view state.
//! Consumer handles talk to the task exclusively through
//! [`SessionCommand`]s on an unbounded channel, which keeps the public
//! API non-blocking and makes the session the single writer of the
//! view state.
//!
//! # Lifecycle
//!
//! The task idles until a `Connect` command starts a connection cycle.
//! Within a cycle, failed attempts back off exponentially
//! (`base × 2^(attempt-1)`, capped) until either a connection is
//! established or the attempt budget is exhausted, which parks the
//! state at `Failed` until the next explicit `Connect`. A manual
//! `Disconnect` ends the cycle cleanly and never auto-reconnects.
//! State-mutating commands are honored in every phase, including
//! while offline; only the outbound sends they imply are skipped with
//! a warning when no connection exists.

use std::sync::{Arc, PoisonError, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use crate::client::{ClientConfig, ClientEvent, ConnectionState, SharedView, ViewState};
use crate::error::MonitorError;
use crate::graph::{reconcile, GraphNode, Position};
use crate::protocol::{decode_frame, encode_command, FilterId, FilterSnapshot, WireMessage};
use crate::transport::{self, TransportEvent, TransportReader, TransportWriter};

/// Instruction from a [`crate::MonitorClient`] handle to the session
/// task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Start a connection cycle; `Some` redirects the session to a new
    /// endpoint, `None` keeps the configured one.
    Connect { address: Option<String> },
    Disconnect,
    Send(WireMessage),
    Subscribe(FilterId),
    Unsubscribe(FilterId),
    SetCurrentFilter(Option<FilterId>),
    SelectNode(Option<String>),
    SetNodePosition {
        id: String,
        position: Position,
        dragging: bool,
    },
    SetMaxMonitors(usize),
    SetMaxHistory(usize),
}

/// How a connection cycle ended.
enum CycleEnd {
    /// Back to idle; the task keeps serving commands.
    Idle,
    /// The command channel closed; the task exits.
    Shutdown,
}

/// Outcome of a single dial attempt.
enum Attempt {
    Established(TransportWriter, TransportReader),
    Failed(MonitorError),
    ManualStop,
    Shutdown,
}

/// Why the connected message loop returned.
enum MessageLoopEnd {
    Manual,
    Lost { reason: Option<String> },
    Shutdown,
}

/// What interrupted (or ended) a backoff wait.
enum BackoffOutcome {
    Elapsed,
    RetryNow,
    Cancel,
    Shutdown,
}

/// Delay before reconnect attempt `attempt` (1-based):
/// `base × 2^(attempt-1)`, capped.
fn reconnect_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    config
        .reconnect_base
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(config.reconnect_cap)
}

pub(crate) struct Session {
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: broadcast::Sender<ClientEvent>,
    shared: SharedView,
}

impl Session {
    pub(crate) fn new(
        config: ClientConfig,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        events: broadcast::Sender<ClientEvent>,
        shared: SharedView,
    ) -> Self {
        Self {
            config,
            commands,
            events,
            shared,
        }
    }

    /// Session task entry point. Returns when every client handle has
    /// been dropped.
    pub(crate) async fn run(mut self) {
        tracing::debug!("session task started");
        loop {
            let Some(command) = self.commands.recv().await else {
                break;
            };
            match command {
                SessionCommand::Connect { address } => {
                    if let Some(address) = address {
                        self.config.address = address;
                    }
                    if let CycleEnd::Shutdown = self.run_connection_cycle().await {
                        break;
                    }
                }
                SessionCommand::Disconnect => {
                    tracing::debug!("already disconnected");
                }
                other => self.handle_command(other, None).await,
            }
        }
        tracing::debug!("session task stopped");
    }

    /// One connection cycle: dial, serve, reconnect on loss, until a
    /// manual disconnect, terminal failure, or shutdown.
    async fn run_connection_cycle(&mut self) -> CycleEnd {
        // Consecutive connection failures in this cycle; reset to zero
        // by every established connection.
        let mut attempt: u32 = 0;
        loop {
            self.begin_attempt(attempt);

            match self.try_connect().await {
                Attempt::Established(mut writer, mut reader) => {
                    attempt = 0;
                    self.on_established(&mut writer).await;
                    match self.run_message_loop(&mut writer, &mut reader).await {
                        MessageLoopEnd::Manual => {
                            if let Err(e) = writer.close().await {
                                tracing::debug!("close handshake failed: {}", e);
                            }
                            self.finish_manual_disconnect();
                            return CycleEnd::Idle;
                        }
                        MessageLoopEnd::Lost { reason } => {
                            tracing::warn!(
                                "connection to {} lost: {}",
                                self.config.address,
                                reason.as_deref().unwrap_or("stream ended")
                            );
                            self.emit(ClientEvent::Disconnected { reason });
                            attempt = 1;
                        }
                        MessageLoopEnd::Shutdown => {
                            if let Err(e) = writer.close().await {
                                tracing::debug!("close handshake failed: {}", e);
                            }
                            return CycleEnd::Shutdown;
                        }
                    }
                }
                Attempt::Failed(e) => {
                    tracing::warn!("connection attempt to {} failed: {}", self.config.address, e);
                    attempt += 1;
                }
                Attempt::ManualStop => {
                    self.finish_manual_disconnect();
                    return CycleEnd::Idle;
                }
                Attempt::Shutdown => return CycleEnd::Shutdown,
            }

            if attempt > self.config.max_reconnect_attempts {
                self.fail_terminal(attempt);
                return CycleEnd::Idle;
            }

            self.set_connection_state(ConnectionState::Reconnecting { attempt });
            match self.wait_backoff(attempt).await {
                BackoffOutcome::Elapsed => {}
                BackoffOutcome::RetryNow => {
                    tracing::debug!("retrying immediately on explicit connect");
                }
                BackoffOutcome::Cancel => {
                    self.finish_manual_disconnect();
                    return CycleEnd::Idle;
                }
                BackoffOutcome::Shutdown => return CycleEnd::Shutdown,
            }
        }
    }

    /// Dial the endpoint, racing the attempt against the command
    /// channel and the connect timeout.
    async fn try_connect(&mut self) -> Attempt {
        let address = self.config.address.clone();
        tracing::debug!("connecting to {}", address);

        let connect = transport::connect(&address);
        tokio::pin!(connect);
        let timeout = tokio::time::sleep(self.config.connect_timeout);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok((writer, reader)) => Attempt::Established(writer, reader),
                        Err(e) => Attempt::Failed(e),
                    };
                }
                _ = &mut timeout => return Attempt::Failed(MonitorError::ConnectTimeout),
                command = self.commands.recv() => match command {
                    None => return Attempt::Shutdown,
                    Some(SessionCommand::Disconnect) => return Attempt::ManualStop,
                    Some(SessionCommand::Connect { .. }) => {
                        // Idempotent while an attempt is in flight.
                        tracing::debug!("connect already in progress");
                    }
                    Some(other) => self.handle_command(other, None).await,
                },
            }
        }
    }

    async fn on_established(&mut self, writer: &mut TransportWriter) {
        {
            let mut view = self.view_mut();
            view.connection = ConnectionState::Connected;
            view.last_error = None;
        }
        tracing::info!("connected to {}", self.config.address);
        self.emit(ClientEvent::Connected);
        self.send_message(&WireMessage::GetAllFilters, Some(writer)).await;
    }

    /// Serve an established connection until it drops or is told to
    /// stop.
    async fn run_message_loop(
        &mut self,
        writer: &mut TransportWriter,
        reader: &mut TransportReader,
    ) -> MessageLoopEnd {
        loop {
            let flush_deadline = self.view().metrics.pending_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    None => return MessageLoopEnd::Shutdown,
                    Some(SessionCommand::Disconnect) => return MessageLoopEnd::Manual,
                    Some(SessionCommand::Connect { .. }) => {
                        tracing::warn!("connect ignored: already connected");
                    }
                    Some(other) => self.handle_command(other, Some(&mut *writer)).await,
                },
                event = reader.next_event() => match event {
                    None => return MessageLoopEnd::Lost { reason: None },
                    Some(Ok(TransportEvent::Frame(payload))) => self.handle_frame(&payload),
                    Some(Ok(TransportEvent::Ping(payload))) => {
                        if let Err(e) = writer.send_pong(payload).await {
                            tracing::warn!("failed to answer ping: {}", e);
                        }
                    }
                    Some(Ok(TransportEvent::Close { code, reason })) => {
                        tracing::debug!("peer closed connection (code {:?})", code);
                        let reason = (!reason.is_empty()).then_some(reason);
                        return MessageLoopEnd::Lost { reason };
                    }
                    Some(Err(e)) => {
                        return MessageLoopEnd::Lost { reason: Some(e.to_string()) };
                    }
                },
                _ = flush_timer(flush_deadline) => {
                    let flushed = {
                        let mut view = self.view_mut();
                        view.metrics.flush_due(Instant::now(), Utc::now().timestamp_millis())
                    };
                    for (id, metrics) in flushed {
                        self.emit(ClientEvent::RealtimeMetrics { id, metrics });
                    }
                }
            }
        }
    }

    /// Decode one wire frame and route the message it carries.
    ///
    /// Malformed control envelopes are dropped with a log line only;
    /// payloads that are recognizably protocol JSON but fail to decode
    /// additionally surface an error event.
    fn handle_frame(&mut self, payload: &[u8]) {
        match decode_frame(payload) {
            Ok(Some(message)) => self.dispatch_message(message),
            Ok(None) => tracing::debug!("discarding unrecognized frame"),
            Err(MonitorError::Frame(reason)) => {
                tracing::warn!("dropping malformed control frame: {}", reason);
            }
            Err(e) => {
                tracing::warn!("failed to decode protocol message: {}", e);
                self.emit_error(format!("failed to decode protocol message: {}", e));
            }
        }
    }

    fn dispatch_message(&mut self, message: WireMessage) {
        match message {
            WireMessage::Filters { filters } | WireMessage::Update { filters } => {
                self.apply_graph_snapshot(filters);
            }
            WireMessage::Details { filter } => self.apply_details(filter),
            other => tracing::debug!("ignoring echoed {} command", other.kind()),
        }
    }

    /// Replace the graph from a full or partial snapshot, preserving
    /// per-node view state by id.
    fn apply_graph_snapshot(&mut self, filters: Vec<FilterSnapshot>) {
        let (nodes, edges) = {
            let mut view = self.view_mut();
            let (nodes, edges) = reconcile(&filters, &view.nodes, &view.edges);
            let nodes = Arc::new(nodes);
            let edges = Arc::new(edges);
            view.filters = filters;
            view.nodes = Arc::clone(&nodes);
            view.edges = Arc::clone(&edges);
            view.loading = false;
            (nodes, edges)
        };
        self.emit(ClientEvent::GraphUpdated { nodes, edges });
    }

    /// Route a detail payload to the current-filter slot and/or the
    /// monitored set. Both can apply to the same payload.
    fn apply_details(&mut self, filter: FilterSnapshot) {
        let now = Instant::now();
        let now_ms = Utc::now().timestamp_millis();
        let id = filter.idx;

        let mut events = Vec::new();
        {
            let mut view = self.view_mut();
            let current = view.current_filter == Some(id);
            let subscribed = view.subscriptions.contains(&id);

            if current {
                view.filter_detail = Some(filter.clone());
                events.push(ClientEvent::FilterDetail {
                    filter: filter.clone(),
                });
            }
            if subscribed {
                view.monitored.insert(id, filter.clone());
                events.push(ClientEvent::FilterData {
                    filter: filter.clone(),
                });
                if let Some(metrics) = view.metrics.record_detail(&filter, now, now_ms) {
                    events.push(ClientEvent::RealtimeMetrics { id, metrics });
                }
            }
            if !current && !subscribed {
                tracing::debug!("details for filter {} without active interest", id);
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    /// Apply one non-lifecycle command, online (`writer` present) or
    /// offline.
    async fn handle_command(
        &mut self,
        command: SessionCommand,
        writer: Option<&mut TransportWriter>,
    ) {
        match command {
            SessionCommand::Send(message) => self.send_message(&message, writer).await,
            SessionCommand::Subscribe(id) => self.subscribe(id, writer).await,
            SessionCommand::Unsubscribe(id) => self.unsubscribe(id, writer).await,
            SessionCommand::SetCurrentFilter(id) => self.set_current_filter(id, writer).await,
            SessionCommand::SelectNode(node) => self.select_node(node),
            SessionCommand::SetNodePosition {
                id,
                position,
                dragging,
            } => self.set_node_position(&id, position, dragging),
            SessionCommand::SetMaxMonitors(limit) => self.set_max_monitors(limit, writer).await,
            SessionCommand::SetMaxHistory(limit) => {
                self.view_mut().metrics.set_max_history(limit);
            }
            SessionCommand::Connect { .. } | SessionCommand::Disconnect => {
                // Lifecycle commands are consumed by the surrounding
                // loops before reaching here.
                tracing::debug!("lifecycle command ignored");
            }
        }
    }

    /// Encode and send one protocol message as a single text frame.
    /// Without a connection the state mutation (if any) has already
    /// happened; only the send is skipped.
    async fn send_message(&mut self, message: &WireMessage, writer: Option<&mut TransportWriter>) {
        let Some(writer) = writer else {
            tracing::warn!("not connected, skipping outbound {} message", message.kind());
            return;
        };
        match encode_command(message) {
            Ok(text) => {
                if let Err(e) = writer.send_text(text).await {
                    tracing::warn!("failed to send {} message: {}", message.kind(), e);
                }
            }
            Err(e) => {
                tracing::warn!("failed to encode {} message: {}", message.kind(), e);
            }
        }
    }

    async fn subscribe(&mut self, id: FilterId, writer: Option<&mut TransportWriter>) {
        {
            let mut view = self.view_mut();
            if view.subscriptions.contains(&id) {
                tracing::debug!("filter {} already subscribed", id);
                return;
            }
            if view.subscriptions.len() >= view.max_monitors {
                tracing::warn!(
                    "monitor limit {} reached, refusing subscription to filter {}",
                    view.max_monitors,
                    id
                );
                return;
            }
            view.subscriptions.push(id);
        }
        self.emit(ClientEvent::FilterSubscribed { id });
        self.send_message(&WireMessage::GetDetails { idx: id }, writer).await;
    }

    async fn unsubscribe(&mut self, id: FilterId, writer: Option<&mut TransportWriter>) {
        {
            let mut view = self.view_mut();
            let Some(index) = view.subscriptions.iter().position(|&sub| sub == id) else {
                tracing::debug!("filter {} not subscribed", id);
                return;
            };
            view.subscriptions.remove(index);
            view.monitored.remove(&id);
            view.metrics.remove_filter(id);
        }
        self.emit(ClientEvent::FilterUnsubscribed { id });
        self.send_message(&WireMessage::StopDetails { idx: id }, writer).await;
    }

    /// Switch the single current-detail filter: stop the previous
    /// stream, then request the new one.
    async fn set_current_filter(
        &mut self,
        id: Option<FilterId>,
        mut writer: Option<&mut TransportWriter>,
    ) {
        let previous = {
            let mut view = self.view_mut();
            if view.current_filter == id {
                return;
            }
            let previous = view.current_filter;
            view.current_filter = id;
            view.filter_detail = None;
            previous
        };
        if let Some(previous) = previous {
            self.send_message(
                &WireMessage::StopDetails { idx: previous },
                writer.as_deref_mut(),
            )
            .await;
        }
        if let Some(next) = id {
            self.send_message(&WireMessage::GetDetails { idx: next }, writer).await;
        }
    }

    fn select_node(&mut self, node: Option<String>) {
        {
            let mut view = self.view_mut();
            if view.selected_node == node {
                return;
            }
            view.selected_node = node.clone();
            let nodes: Vec<GraphNode> = view
                .nodes
                .iter()
                .cloned()
                .map(|mut entry| {
                    entry.selected = node.as_deref() == Some(entry.id.as_str());
                    entry
                })
                .collect();
            view.nodes = Arc::new(nodes);
        }
        self.emit(ClientEvent::SelectionChanged { node });
    }

    fn set_node_position(&mut self, id: &str, position: Position, dragging: bool) {
        let mut view = self.view_mut();
        if !view.nodes.iter().any(|node| node.id == id) {
            tracing::debug!("ignoring position update for unknown node {}", id);
            return;
        }
        let nodes: Vec<GraphNode> = view
            .nodes
            .iter()
            .cloned()
            .map(|mut node| {
                if node.id == id {
                    node.position = position;
                    node.dragging = dragging;
                }
                node
            })
            .collect();
        view.nodes = Arc::new(nodes);
    }

    /// Clamp the monitor limit and drop the newest subscriptions over
    /// it, stopping their detail streams.
    async fn set_max_monitors(&mut self, limit: usize, mut writer: Option<&mut TransportWriter>) {
        let dropped = {
            let mut view = self.view_mut();
            let limit = limit.clamp(1, 12);
            view.max_monitors = limit;
            if view.subscriptions.len() > limit {
                let dropped = view.subscriptions.split_off(limit);
                for id in &dropped {
                    view.monitored.remove(id);
                    view.metrics.remove_filter(*id);
                }
                dropped
            } else {
                Vec::new()
            }
        };
        for id in dropped {
            self.emit(ClientEvent::FilterUnsubscribed { id });
            self.send_message(&WireMessage::StopDetails { idx: id }, writer.as_deref_mut())
                .await;
        }
    }

    /// Backoff wait, still serving commands. An explicit connect cuts
    /// the wait short, a disconnect cancels the cycle.
    async fn wait_backoff(&mut self, attempt: u32) -> BackoffOutcome {
        let delay = reconnect_delay(&self.config, attempt);
        tracing::info!("reconnect attempt {} in {:?}", attempt, delay);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return BackoffOutcome::Elapsed,
                command = self.commands.recv() => match command {
                    None => return BackoffOutcome::Shutdown,
                    Some(SessionCommand::Connect { address }) => {
                        if let Some(address) = address {
                            self.config.address = address;
                        }
                        return BackoffOutcome::RetryNow;
                    }
                    Some(SessionCommand::Disconnect) => return BackoffOutcome::Cancel,
                    Some(other) => self.handle_command(other, None).await,
                },
            }
        }
    }

    fn begin_attempt(&self, attempt: u32) {
        let state = if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting { attempt }
        };
        let mut view = self.view_mut();
        view.connection = state;
        view.loading = true;
    }

    /// Clean stop: subscriptions and the current-detail filter are
    /// cleared, graph and metric data survive for inspection.
    fn finish_manual_disconnect(&mut self) {
        {
            let mut view = self.view_mut();
            view.connection = ConnectionState::Disconnected;
            view.loading = false;
            view.subscriptions.clear();
            view.current_filter = None;
            view.filter_detail = None;
        }
        tracing::info!("disconnected from {}", self.config.address);
        self.emit(ClientEvent::Disconnected { reason: None });
    }

    fn fail_terminal(&mut self, failures: u32) {
        let message = format!(
            "giving up on {} after {} consecutive connection failures",
            self.config.address, failures
        );
        tracing::error!("{}", message);
        {
            let mut view = self.view_mut();
            view.connection = ConnectionState::Failed;
            view.loading = false;
        }
        self.emit_error(message);
    }

    fn set_connection_state(&self, state: ConnectionState) {
        self.view_mut().connection = state;
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine; events are best-effort.
        let _ = self.events.send(event);
    }

    fn emit_error(&self, message: String) {
        self.view_mut().last_error = Some(message.clone());
        self.emit(ClientEvent::Error { message });
    }

    fn view(&self) -> RwLockReadGuard<'_, ViewState> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn view_mut(&self) -> RwLockWriteGuard<'_, ViewState> {
        self.shared.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sleep until the throttle deadline, or forever when nothing is
/// pending.
async fn flush_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
