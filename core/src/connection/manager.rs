//! Connection Manager
//!
//! Owns the current state, the active transport, queued outbound messages,
//! fallback host bookkeeping and the acknowledgement tracker. Only the
//! workflow loop calls into it, one command at a time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use super::backoff::retry_delay;
use super::command::RealtimeCommand;
use super::state::{
    ConnectedInfo, ConnectionEvent, ConnectionState, ConnectionStateChange, Decision, Facts,
    RetryPlan, State, StateEvent,
};
use super::workflow::CommandQueue;
use super::{ConnectionInfo, RecoveryKey};
use crate::ack::{AckCallback, AckTracker};
use crate::auth::{ArcAuthProvider, Token};
use crate::codec::PayloadCodec;
use crate::config::ClientOptions;
use crate::error::{ErrorInfo, RealtimeError, Reason, Result};
use crate::heartbeat::{PingCallback, PingTracker};
use crate::protocol::{Action, AuthDetails, ConnectionDetails, ProtocolMessage};
use crate::timer::{CountdownTimer, TimerFactory};
use crate::transport::{
    ArcReachability, ArcTransportFactory, FallbackHosts, Transport, TransportEvent,
    TransportEventSink, TransportParams,
};

/// External capabilities the manager drives
pub(crate) struct Collaborators {
    pub transport_factory: ArcTransportFactory,
    pub auth: ArcAuthProvider,
    pub reachability: ArcReachability,
    pub codec: Arc<dyn PayloadCodec>,
    pub timers: Arc<dyn TimerFactory>,
}

/// Channels through which state becomes observable
pub(crate) struct Outputs {
    pub info_tx: watch::Sender<ConnectionInfo>,
    pub state_tx: broadcast::Sender<ConnectionStateChange>,
    pub message_tx: broadcast::Sender<ProtocolMessage>,
}

struct ActiveTransport {
    id: u64,
    host: String,
    /// Socket open (transport reported Connected)
    connected: bool,
    inner: Box<dyn Transport>,
}

struct QueuedMessage {
    message: ProtocolMessage,
    callback: Option<AckCallback>,
}

pub(crate) struct ConnectionManager {
    options: ClientOptions,
    state: State,
    /// Incremented whenever the state timer's owner changes
    epoch: u64,
    state_timer: Box<dyn CountdownTimer>,
    transport: Option<ActiveTransport>,
    next_transport_id: u64,
    collaborators: Collaborators,
    outputs: Outputs,
    queue: CommandQueue,
    hosts: FallbackHosts,
    acks: AckTracker,
    queued: VecDeque<QueuedMessage>,
    pings: PingTracker,

    connection_id: Option<String>,
    connection_key: Option<String>,
    connection_serial: Option<i64>,
    error_reason: Option<ErrorInfo>,
    recover: Option<String>,
    renewed_token: Option<Token>,
    auth_retried: bool,

    /// Start of the current retry sequence, for the suspend check
    first_attempt_at: Option<Instant>,
    attempts: u32,
}

impl ConnectionManager {
    pub(crate) fn new(
        options: ClientOptions,
        collaborators: Collaborators,
        outputs: Outputs,
        queue: CommandQueue,
    ) -> Self {
        let hosts = FallbackHosts::new(
            options.realtime_host.clone(),
            options.resolved_fallback_hosts(),
            options.fallback_retry_timeout,
        );
        let state_timer = collaborators.timers.create("state");
        let recover = options.recover.clone();

        ConnectionManager {
            options,
            state: State::Initialized,
            epoch: 0,
            state_timer,
            transport: None,
            next_transport_id: 0,
            collaborators,
            outputs,
            queue,
            hosts,
            acks: AckTracker::new(),
            queued: VecDeque::new(),
            pings: PingTracker::new(),
            connection_id: None,
            connection_key: None,
            connection_serial: None,
            error_reason: None,
            recover,
            renewed_token: None,
            auth_retried: false,
            first_attempt_at: None,
            attempts: 0,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.tag()
    }

    pub(crate) fn snapshot(&self) -> ConnectionInfo {
        ConnectionInfo {
            state: self.state.tag(),
            id: self.connection_id.clone(),
            key: self.connection_key.clone(),
            serial: self.connection_serial,
            msg_serial: self.acks.msg_serial(),
            error_reason: self.error_reason.clone(),
            retry_in: self.state.retry_in(),
            host: self.hosts.current().to_string(),
        }
    }

    pub(crate) async fn execute(&mut self, command: RealtimeCommand) -> Result<()> {
        match command {
            RealtimeCommand::Connect => {
                if matches!(
                    self.state.tag(),
                    ConnectionState::Initialized | ConnectionState::Closed | ConnectionState::Failed
                ) {
                    self.reset_retry_sequence();
                }
                self.dispatch(StateEvent::Connect).await
            }
            RealtimeCommand::Close => {
                self.reset_retry_sequence();
                self.dispatch(StateEvent::Close).await
            }
            RealtimeCommand::SetConnectingState { use_fallback_host } => {
                self.force(State::Connecting { use_fallback_host }).await
            }
            RealtimeCommand::SetConnectedState { message } => {
                if message.action != Action::Connected {
                    return Err(RealtimeError::InvalidCommand(format!(
                        "SetConnectedState requires a Connected message, got {:?}",
                        message.action
                    )));
                }
                let info = ConnectedInfo::from_message(&message);
                if self.state.tag() == ConnectionState::Connected {
                    self.update(info);
                    Ok(())
                } else {
                    self.force(State::Connected(info)).await
                }
            }
            RealtimeCommand::SetDisconnectedState {
                error,
                retry_instantly,
                use_fallback_host,
                clear_connection_key,
            } => {
                if clear_connection_key {
                    self.connection_key = None;
                }
                self.force(State::Disconnected(RetryPlan {
                    error,
                    retry_in: None,
                    retry_instantly,
                    use_fallback_host,
                }))
                .await
            }
            RealtimeCommand::SetSuspendedState { error } => {
                self.force(State::Suspended {
                    error,
                    retry_in: None,
                })
                .await
            }
            RealtimeCommand::SetClosingState => self.force(State::Closing).await,
            RealtimeCommand::SetClosedState { error } => self.force(State::Closed { error }).await,
            RealtimeCommand::SetFailedState { error } => self.force(State::Failed { error }).await,
            RealtimeCommand::RetryAuth { error } => self.retry_auth(error).await,
            RealtimeCommand::ProcessMessage(message) => self.process_message(message).await,
            RealtimeCommand::Ping { callback } => {
                self.ping(callback);
                Ok(())
            }
            RealtimeCommand::Send { message, callback } => {
                self.send(message, callback);
                Ok(())
            }
            RealtimeCommand::Delay { delay, command } => {
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.push(*command);
                });
                Ok(())
            }
            RealtimeCommand::HandleTransportEvent {
                transport_id,
                event,
            } => self.handle_transport_event(transport_id, event).await,
            RealtimeCommand::HandleStateTimeout { epoch } => {
                if epoch != self.epoch {
                    tracing::debug!("Stale state timeout (epoch {}, now {})", epoch, self.epoch);
                    return Ok(());
                }
                self.dispatch(StateEvent::Timeout).await
            }
            RealtimeCommand::HandlePingTimeout { ping_id } => {
                self.pings.on_timeout(&ping_id);
                Ok(())
            }
        }
    }

    // ── Decisions ───────────────────────────────────────────────────────────

    async fn dispatch(&mut self, event: StateEvent<'_>) -> Result<()> {
        let facts = self.facts(&event).await;
        let decision = self.state.decide(&event, &facts);
        self.apply(decision).await
    }

    async fn facts(&mut self, event: &StateEvent<'_>) -> Facts {
        let can_reach_service = if self.state.needs_reachability(event) {
            let reachability = self.collaborators.reachability.clone();
            reachability.can_reach_service().await
        } else {
            true
        };

        Facts {
            transport_connected: self.transport.as_ref().is_some_and(|t| t.connected),
            should_suspend: self.should_suspend(),
            fallback_available: self.hosts.has_fallbacks(),
            can_reach_service,
            token_renewable: !self.auth_retried && self.collaborators.auth.is_token_renewable(),
            resumable: self.connection_key.is_some(),
        }
    }

    async fn apply(&mut self, decision: Decision) -> Result<()> {
        match decision {
            Decision::Ignore | Decision::Unhandled => Ok(()),
            Decision::Transition(transition) => {
                if transition.clear_connection_key {
                    tracing::debug!("Clearing connection key");
                    self.connection_key = None;
                }
                self.commit(transition.next).await
            }
            Decision::RetryAuth(error) => self.retry_auth(error).await,
            Decision::Update(info) => {
                self.update(info);
                Ok(())
            }
        }
    }

    fn should_suspend(&self) -> bool {
        self.first_attempt_at
            .is_some_and(|started| started.elapsed() >= self.options.connection_state_ttl)
    }

    fn reset_retry_sequence(&mut self) {
        self.attempts = 0;
        self.first_attempt_at = None;
        self.auth_retried = false;
    }

    /// Commit a transition requested directly by a command
    async fn force(&mut self, next: State) -> Result<()> {
        let tag = next.tag();
        if tag == self.state.tag() {
            tracing::debug!("Already {}, ignoring request", tag);
            return Ok(());
        }
        self.commit(next).await
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    /// Commit `next` and any follow-up transitions its entry requires
    async fn commit(&mut self, next: State) -> Result<()> {
        let mut pending = Some(next);
        while let Some(state) = pending.take() {
            pending = self.transition(state).await;
        }
        Ok(())
    }

    fn prepare(&mut self, next: &mut State) {
        match next {
            State::Disconnected(plan) => {
                self.attempts += 1;
                self.auth_retried = false;
                plan.retry_in = Some(if plan.retry_instantly {
                    Duration::ZERO
                } else {
                    retry_delay(self.options.disconnected_retry_timeout, self.attempts)
                });
            }
            State::Suspended { retry_in, .. } => {
                *retry_in = Some(self.options.suspended_retry_timeout);
            }
            _ => {}
        }
    }

    async fn transition(&mut self, mut next: State) -> Option<State> {
        self.prepare(&mut next);

        // Leave the current state
        self.state_timer.abort();
        let previous = std::mem::replace(&mut self.state, next).tag();
        self.epoch += 1;
        let current = self.state.tag();

        tracing::info!(
            "Connection state {} -> {} (reason: {}, retry in: {:?})",
            previous,
            current,
            Reason(self.state.error()),
            self.state.retry_in()
        );

        let mut resumed = false;
        let mut recovered_serial = None;
        if let State::Connected(info) = &self.state {
            let info = info.clone();
            resumed = self.adopt_connection(&info);
            if let Some(recover) = self.recover.take() {
                if info.error.is_none() {
                    recovered_serial = RecoveryKey::parse(&recover).map(|k| k.msg_serial);
                }
            }
        }

        match current {
            ConnectionState::Closed | ConnectionState::Failed => {
                self.connection_id = None;
                self.connection_key = None;
                self.connection_serial = None;
            }
            ConnectionState::Suspended => {
                // The server no longer holds state for this connection
                self.connection_key = None;
                self.connection_serial = None;
            }
            _ => {}
        }

        if previous == ConnectionState::Connected && current != ConnectionState::Connected {
            let reason = self.state.error().cloned().unwrap_or_else(ErrorInfo::not_connected);
            self.pings.fail_all(&reason);
        }

        self.acks.on_state_changed(current, self.state.error(), resumed);
        if let Some(serial) = recovered_serial {
            tracing::info!("Recovered connection, msgSerial continues at {}", serial);
            self.acks.set_msg_serial(serial);
        }

        if let Some(error) = self.state.error() {
            self.error_reason = Some(error.clone());
        } else if current == ConnectionState::Connected {
            self.error_reason = None;
        }

        self.publish_info();
        self.emit(ConnectionStateChange {
            previous,
            current,
            event: ConnectionEvent::State(current),
            reason: self.state.error().cloned(),
            retry_in: self.state.retry_in(),
        });

        self.attach().await
    }

    /// Entry behaviour of the new state. Returns a follow-up state when the
    /// new state is left immediately.
    async fn attach(&mut self) -> Option<State> {
        match self.state.clone() {
            State::Initialized => None,
            State::Connecting { use_fallback_host } => self.attach_connecting(use_fallback_host).await,
            State::Connected(info) => {
                self.attach_connected(&info.details);
                None
            }
            State::Disconnected(plan) => {
                self.destroy_transport();
                if plan.retry_instantly {
                    return Some(State::Connecting {
                        use_fallback_host: plan.use_fallback_host,
                    });
                }
                let delay = plan
                    .retry_in
                    .unwrap_or(self.options.disconnected_retry_timeout);
                self.start_state_timer(delay);
                None
            }
            State::Suspended { error, retry_in } => {
                self.destroy_transport();
                self.fail_queued(&error.unwrap_or_else(ErrorInfo::suspended));
                self.start_state_timer(retry_in.unwrap_or(self.options.suspended_retry_timeout));
                None
            }
            State::Closing => {
                if !self.transport.as_ref().is_some_and(|t| t.connected) {
                    return Some(State::Closed { error: None });
                }
                match self.transmit(&ProtocolMessage::new(Action::Close)) {
                    Ok(()) => {
                        self.start_state_timer(self.options.realtime_request_timeout);
                        None
                    }
                    Err(e) => {
                        tracing::warn!("Failed to send Close: {}", e);
                        Some(State::Closed { error: None })
                    }
                }
            }
            State::Closed { error } => {
                self.destroy_transport();
                self.clear_ack_queue_and_fail_messages(&error.unwrap_or_else(ErrorInfo::closed));
                None
            }
            State::Failed { error } => {
                self.destroy_transport();
                self.clear_ack_queue_and_fail_messages(&error);
                None
            }
        }
    }

    async fn attach_connecting(&mut self, use_fallback_host: bool) -> Option<State> {
        self.first_attempt_at.get_or_insert_with(Instant::now);

        if use_fallback_host || self.transport.is_none() {
            self.destroy_transport();
            if let Err(error) = self.open_transport(use_fallback_host).await {
                tracing::warn!("Unable to open transport: {}", error);
                let facts = Facts {
                    should_suspend: self.should_suspend(),
                    ..Default::default()
                };
                return Some(State::disconnected_or_suspended(&facts, error, false));
            }
        }

        if let Some(transport) = self.transport.as_mut() {
            tracing::debug!("Connecting transport {} to {}", transport.id, transport.host);
            transport.inner.connect();
        }
        self.start_state_timer(self.options.realtime_request_timeout);
        None
    }

    fn attach_connected(&mut self, details: &ConnectionDetails) {
        let host = self
            .transport
            .as_ref()
            .map(|t| t.host.clone())
            .unwrap_or_else(|| self.hosts.current().to_string());
        self.hosts.on_connected(&host);
        self.reset_retry_sequence();
        self.arm_idle_timer(details);
        self.flush_queued();
    }

    /// Take over id, key and serial from a Connected message. Returns
    /// whether this continues the previous connection.
    fn adopt_connection(&mut self, info: &ConnectedInfo) -> bool {
        let resumed = self.connection_key.is_some()
            && info.connection_id.is_some()
            && info.connection_id == self.connection_id;

        self.connection_id = info.connection_id.clone();
        self.connection_key = info.connection_key.clone();
        if info.connection_serial.is_some() || !resumed {
            self.connection_serial = info.connection_serial;
        }
        resumed
    }

    /// Connected message while already connected
    fn update(&mut self, info: ConnectedInfo) {
        let resumed = self.adopt_connection(&info);
        if !resumed {
            tracing::warn!("Connection id changed to {:?} on update", info.connection_id);
        }
        if let Some(error) = &info.error {
            self.error_reason = Some(error.clone());
        }
        self.arm_idle_timer(&info.details);
        let reason = info.error.clone();
        self.state = State::Connected(info);

        tracing::info!("Connection updated (reason: {})", Reason(reason.as_ref()));
        self.publish_info();
        self.emit(ConnectionStateChange {
            previous: ConnectionState::Connected,
            current: ConnectionState::Connected,
            event: ConnectionEvent::Update,
            reason,
            retry_in: None,
        });
    }

    fn emit(&self, change: ConnectionStateChange) {
        if self.outputs.state_tx.send(change).is_err() {
            tracing::trace!("No state change listeners");
        }
    }

    fn publish_info(&self) {
        self.outputs.info_tx.send_replace(self.snapshot());
    }

    // ── Timers ──────────────────────────────────────────────────────────────

    fn start_state_timer(&mut self, delay: Duration) {
        let queue = self.queue.clone();
        let epoch = self.epoch;
        self.state_timer.start(
            delay,
            Box::new(move || {
                queue.push(RealtimeCommand::HandleStateTimeout { epoch });
            }),
        );
    }

    fn arm_idle_timer(&mut self, details: &ConnectionDetails) {
        if let Some(idle) = details.max_idle_interval() {
            self.start_state_timer(idle + self.options.realtime_request_timeout);
        }
    }

    // ── Transport ───────────────────────────────────────────────────────────

    async fn open_transport(&mut self, use_fallback_host: bool) -> std::result::Result<(), ErrorInfo> {
        let token = match self.renewed_token.take() {
            Some(token) => Some(token),
            None => {
                let auth = self.collaborators.auth.clone();
                auth.current_token().await?
            }
        };

        let host = self
            .hosts
            .select(use_fallback_host && self.hosts.has_fallbacks());
        let params = TransportParams {
            host: host.clone(),
            token,
            connection_key: self.connection_key.clone(),
            connection_serial: self.connection_serial,
            recover: if self.connection_key.is_none() {
                self.recover.clone()
            } else {
                None
            },
            client_id: self.options.client_id.clone(),
            echo_messages: self.options.echo_messages,
        };

        self.next_transport_id += 1;
        let id = self.next_transport_id;
        let sink = TransportEventSink::new(id, self.queue.clone());
        let inner = self.collaborators.transport_factory.create(params, sink)?;

        tracing::info!("Created transport {} for {}", id, host);
        self.transport = Some(ActiveTransport {
            id,
            host,
            connected: false,
            inner,
        });
        self.publish_info();
        Ok(())
    }

    fn destroy_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let send_disconnect = transport.connected
                && matches!(
                    self.state.tag(),
                    ConnectionState::Disconnected | ConnectionState::Suspended
                );
            tracing::debug!("Destroying transport {} ({})", transport.id, transport.host);
            transport.inner.close(send_disconnect);
        }
    }

    fn transmit(&mut self, message: &ProtocolMessage) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| RealtimeError::Transport(ErrorInfo::not_connected()))?;
        transport.inner.send(message).map_err(RealtimeError::Transport)
    }

    async fn handle_transport_event(&mut self, transport_id: u64, event: TransportEvent) -> Result<()> {
        let current = self.transport.as_ref().map(|t| t.id);
        if current != Some(transport_id) {
            tracing::debug!(
                "Dropping {:?} from stale transport {} (current {:?})",
                event,
                transport_id,
                current
            );
            return Ok(());
        }

        match event {
            TransportEvent::Connected => {
                if let Some(transport) = self.transport.as_mut() {
                    transport.connected = true;
                    tracing::debug!("Transport {} opened", transport.id);
                }
                Ok(())
            }
            TransportEvent::Disconnected { error } => {
                self.mark_transport_closed();
                self.dispatch(StateEvent::TransportLost(error.as_ref())).await
            }
            TransportEvent::Error(error) => {
                tracing::warn!("Transport {} error: {}", transport_id, error);
                self.mark_transport_closed();
                self.dispatch(StateEvent::TransportLost(Some(&error))).await
            }
            TransportEvent::MessageReceived(message) => self.process_message(message).await,
        }
    }

    fn mark_transport_closed(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.connected = false;
        }
    }

    // ── Messages ────────────────────────────────────────────────────────────

    async fn process_message(&mut self, mut message: ProtocolMessage) -> Result<()> {
        if let Err(e) = self.collaborators.codec.decode(&mut message) {
            tracing::warn!("Failed to decode {:?} payload, delivering raw: {}", message.action, e);
        }

        if let Some(serial) = message.connection_serial {
            if self.connection_serial != Some(serial) {
                self.connection_serial = Some(serial);
                self.publish_info();
            }
        }

        // Any inbound traffic counts as activity for idle monitoring
        if let State::Connected(info) = &self.state {
            let details = info.details.clone();
            self.arm_idle_timer(&details);
        }

        if self.acks.on_message_received(&message) {
            return Ok(());
        }
        if message.action == Action::Heartbeat {
            self.pings.on_heartbeat(&message);
            return Ok(());
        }

        let event = StateEvent::Message(&message);
        let facts = self.facts(&event).await;
        match self.state.decide(&event, &facts) {
            Decision::Unhandled => {
                self.forward(message);
                Ok(())
            }
            decision => self.apply(decision).await,
        }
    }

    /// Hand a channel-level message to the channel layer
    fn forward(&self, message: ProtocolMessage) {
        tracing::trace!("Forwarding {:?} for {:?}", message.action, message.channel);
        if self.outputs.message_tx.send(message).is_err() {
            tracing::trace!("No channel listeners");
        }
    }

    fn send(&mut self, message: ProtocolMessage, callback: Option<AckCallback>) {
        let state = self.state.tag();
        if state.can_send() {
            self.send_now(message, callback);
        } else if state.can_queue() && self.options.queue_messages {
            tracing::debug!("Queueing {:?} while {}", message.action, state);
            self.queued.push_back(QueuedMessage { message, callback });
        } else if let Some(callback) = callback {
            callback(Err(ErrorInfo::not_connected()));
        } else {
            tracing::debug!("Dropping {:?} while {}", message.action, state);
        }
    }

    fn send_now(&mut self, mut message: ProtocolMessage, callback: Option<AckCallback>) {
        if let Err(e) = self.collaborators.codec.encode(&mut message) {
            tracing::warn!("Failed to encode {:?} payload: {}", message.action, e);
            if let Some(callback) = callback {
                callback(Err(e.to_error_info()));
            }
            return;
        }

        // Messages without an ack resolve as soon as they are written
        let (tracked, immediate) = if message.requires_ack() {
            (callback, None)
        } else {
            (None, callback)
        };
        self.acks.send_message(&mut message, tracked);
        let sent = self.transmit(&message);
        if let Err(e) = &sent {
            // A tracked message stays pending until acked or failed with the connection
            tracing::warn!("Failed to send {:?} (msgSerial {:?}): {}", message.action, message.msg_serial, e);
        }
        if let Some(callback) = immediate {
            callback(sent.map_err(|e| e.to_error_info()));
        }
        if message.msg_serial.is_some() {
            self.publish_info();
        }
    }

    fn flush_queued(&mut self) {
        if self.queued.is_empty() {
            return;
        }
        tracing::info!("Sending {} queued messages", self.queued.len());
        while let Some(QueuedMessage { message, callback }) = self.queued.pop_front() {
            self.send_now(message, callback);
        }
    }

    fn fail_queued(&mut self, error: &ErrorInfo) {
        if !self.queued.is_empty() {
            tracing::info!("Failing {} queued messages: {}", self.queued.len(), error);
        }
        for QueuedMessage { callback, .. } in self.queued.drain(..) {
            if let Some(callback) = callback {
                callback(Err(error.clone()));
            }
        }
    }

    /// Fail every message awaiting an ack and every queued message
    fn clear_ack_queue_and_fail_messages(&mut self, error: &ErrorInfo) {
        self.acks.fail_all(error);
        self.fail_queued(error);
    }

    fn ping(&mut self, callback: PingCallback) {
        if !self.state.can_send() {
            callback(Err(ErrorInfo::not_connected()));
            return;
        }

        let ping_id = PingTracker::new_ping_id();
        if let Err(e) = self.transmit(&PingTracker::heartbeat(&ping_id)) {
            callback(Err(e.to_error_info()));
            return;
        }

        let mut timer = self.collaborators.timers.create("ping");
        let queue = self.queue.clone();
        let timeout_id = ping_id.clone();
        timer.start(
            self.options.realtime_request_timeout,
            Box::new(move || {
                queue.push(RealtimeCommand::HandlePingTimeout {
                    ping_id: timeout_id,
                });
            }),
        );
        tracing::debug!("Ping {} sent", ping_id);
        self.pings.register(ping_id, callback, timer);
    }

    // ── Auth ────────────────────────────────────────────────────────────────

    async fn retry_auth(&mut self, error: Option<ErrorInfo>) -> Result<()> {
        tracing::info!("Renewing token (reason: {})", Reason(error.as_ref()));
        if error.is_some() {
            self.auth_retried = true;
        }

        let auth = self.collaborators.auth.clone();
        match auth.renew_token().await {
            Ok(token) if error.is_none() && self.state.can_send() => {
                let mut message = ProtocolMessage::new(Action::Auth);
                message.auth = token.map(|t| AuthDetails {
                    access_token: t.token,
                });
                self.transmit(&message)
            }
            Ok(token) => {
                self.renewed_token = token;
                if let State::Connecting { use_fallback_host } = self.state {
                    // Retry in place with the new token
                    self.state_timer.abort();
                    self.epoch += 1;
                    self.destroy_transport();
                    if let Some(next) = self.attach_connecting(use_fallback_host).await {
                        return self.commit(next).await;
                    }
                    Ok(())
                } else {
                    // The old socket was opened with the rejected token
                    self.destroy_transport();
                    self.commit(State::Connecting {
                        use_fallback_host: false,
                    })
                    .await
                }
            }
            Err(auth_error) if error.is_none() && self.state.can_send() => {
                Err(RealtimeError::Auth(auth_error))
            }
            Err(auth_error) => {
                tracing::warn!("Token renewal failed: {}", auth_error);
                let next = if auth_error.status_code == 403 {
                    State::Failed { error: auth_error }
                } else {
                    let facts = Facts {
                        should_suspend: self.should_suspend(),
                        ..Default::default()
                    };
                    State::disconnected_or_suspended(&facts, auth_error, false)
                };
                self.commit(next).await
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.state_timer.abort();
        self.pings.fail_all(&ErrorInfo::closed());
        self.destroy_transport();
    }
}
