//! Connection Module
//!
//! Public [`Connection`] facade over the workflow loop. User calls become
//! commands; state is observed through a watch snapshot and a broadcast of
//! state changes.

pub mod backoff;
pub mod command;
pub(crate) mod manager;
pub mod state;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::ack::AckCallback;
use crate::auth::{ArcAuthProvider, StaticAuth};
use crate::codec::{JsonPayloadCodec, PayloadCodec};
use crate::config::ClientOptions;
use crate::error::{ErrorInfo, Result};
use crate::heartbeat::PingCallback;
use crate::protocol::{Message, ProtocolMessage};
use crate::timer::{TimerFactory, TokioTimerFactory};
use crate::transport::{AlwaysReachable, ArcReachability, ArcTransportFactory};

pub use command::RealtimeCommand;
pub use state::{ConnectionEvent, ConnectionState, ConnectionStateChange, State};
pub use workflow::CommandQueue;

use manager::{Collaborators, ConnectionManager, Outputs};
use workflow::WorkflowLoop;

const EVENT_CAPACITY: usize = 64;
const MESSAGE_CAPACITY: usize = 256;

/// Snapshot of the observable connection state
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub id: Option<String>,
    pub key: Option<String>,
    pub serial: Option<i64>,
    /// Next msgSerial to be assigned
    pub msg_serial: u64,
    pub error_reason: Option<ErrorInfo>,
    pub retry_in: Option<Duration>,
    pub host: String,
}

impl ConnectionInfo {
    fn initial(host: impl Into<String>) -> Self {
        ConnectionInfo {
            state: ConnectionState::Initialized,
            id: None,
            key: None,
            serial: None,
            msg_serial: 0,
            error_reason: None,
            retry_in: None,
            host: host.into(),
        }
    }

    /// `key:serial:msgSerial`, available while a connection key is held
    pub fn recovery_key(&self) -> Option<String> {
        let key = self.key.as_ref()?;
        Some(
            RecoveryKey {
                connection_key: key.clone(),
                connection_serial: self.serial.unwrap_or(-1),
                msg_serial: self.msg_serial,
            }
            .to_string(),
        )
    }
}

/// Parsed form of a recovery key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryKey {
    pub connection_key: String,
    pub connection_serial: i64,
    pub msg_serial: u64,
}

impl RecoveryKey {
    pub fn parse(value: &str) -> Option<Self> {
        // The connection key itself may contain ':'
        let mut parts = value.rsplitn(3, ':');
        let msg_serial = parts.next()?.parse().ok()?;
        let connection_serial = parts.next()?.parse().ok()?;
        let connection_key = parts.next().filter(|k| !k.is_empty())?;
        Some(RecoveryKey {
            connection_key: connection_key.to_string(),
            connection_serial,
            msg_serial,
        })
    }
}

impl std::fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.connection_key, self.connection_serial, self.msg_serial)
    }
}

/// Assembles a [`Connection`] from options and collaborators
pub struct ConnectionBuilder {
    options: ClientOptions,
    transport_factory: ArcTransportFactory,
    auth: ArcAuthProvider,
    reachability: ArcReachability,
    codec: Arc<dyn PayloadCodec>,
    timers: Arc<dyn TimerFactory>,
}

impl ConnectionBuilder {
    pub fn new(options: ClientOptions, transport_factory: ArcTransportFactory) -> Self {
        ConnectionBuilder {
            options,
            transport_factory,
            auth: Arc::new(StaticAuth::anonymous()),
            reachability: Arc::new(AlwaysReachable),
            codec: Arc::new(JsonPayloadCodec),
            timers: Arc::new(TokioTimerFactory),
        }
    }

    pub fn auth(mut self, auth: ArcAuthProvider) -> Self {
        self.auth = auth;
        self
    }

    pub fn reachability(mut self, reachability: ArcReachability) -> Self {
        self.reachability = reachability;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn timers(mut self, timers: Arc<dyn TimerFactory>) -> Self {
        self.timers = timers;
        self
    }

    /// Validate the options and start the workflow loop.
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Connection> {
        self.options.validate()?;

        let (queue, rx) = CommandQueue::new();
        let (info_tx, info_rx) = watch::channel(ConnectionInfo::initial(&self.options.realtime_host));
        let (state_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (message_tx, _) = broadcast::channel(MESSAGE_CAPACITY);
        let auto_connect = self.options.auto_connect;

        let manager = ConnectionManager::new(
            self.options,
            Collaborators {
                transport_factory: self.transport_factory,
                auth: self.auth,
                reachability: self.reachability,
                codec: self.codec,
                timers: self.timers,
            },
            Outputs {
                info_tx,
                state_tx: state_tx.clone(),
                message_tx: message_tx.clone(),
            },
            queue.clone(),
        );
        let task = tokio::spawn(WorkflowLoop::new(rx, manager).run());

        let connection = Connection {
            queue,
            info_rx,
            state_tx,
            message_tx,
            task,
        };
        if auto_connect {
            connection.connect();
        }
        Ok(connection)
    }
}

/// Handle to a realtime connection
pub struct Connection {
    queue: CommandQueue,
    info_rx: watch::Receiver<ConnectionInfo>,
    state_tx: broadcast::Sender<ConnectionStateChange>,
    message_tx: broadcast::Sender<ProtocolMessage>,
    task: JoinHandle<()>,
}

impl Connection {
    pub fn builder(options: ClientOptions, transport_factory: ArcTransportFactory) -> ConnectionBuilder {
        ConnectionBuilder::new(options, transport_factory)
    }

    pub fn connect(&self) {
        self.queue.push(RealtimeCommand::Connect);
    }

    /// Always accepted; a no-op once closed
    pub fn close(&self) {
        self.queue.push(RealtimeCommand::Close);
    }

    /// Round trip to the service
    pub async fn ping(&self) -> std::result::Result<Duration, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        let callback: PingCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        if !self.queue.push(RealtimeCommand::Ping { callback }) {
            return Err(ErrorInfo::closed());
        }
        rx.await.unwrap_or_else(|_| Err(ErrorInfo::closed()))
    }

    /// Send and wait for the acknowledgement, or for the write when the
    /// message needs none
    pub async fn send(&self, message: ProtocolMessage) -> std::result::Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        let callback: AckCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        self.send_with_callback(message, Some(callback));
        rx.await.unwrap_or_else(|_| Err(ErrorInfo::closed()))
    }

    pub fn send_with_callback(&self, message: ProtocolMessage, callback: Option<AckCallback>) {
        if let Err(callback) = self.try_push_send(message, callback) {
            if let Some(callback) = callback {
                callback(Err(ErrorInfo::closed()));
            }
        }
    }

    /// Publish `messages` on `channel` and wait for the acknowledgement
    pub async fn publish(&self, channel: &str, messages: Vec<Message>) -> std::result::Result<(), ErrorInfo> {
        self.send(ProtocolMessage::message(channel, messages)).await
    }

    fn try_push_send(
        &self,
        message: ProtocolMessage,
        callback: Option<AckCallback>,
    ) -> std::result::Result<(), Option<AckCallback>> {
        if self.queue.is_closed() {
            return Err(callback);
        }
        self.queue.push(RealtimeCommand::Send { message, callback });
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.info_rx.borrow().state
    }

    pub fn id(&self) -> Option<String> {
        self.info_rx.borrow().id.clone()
    }

    pub fn key(&self) -> Option<String> {
        self.info_rx.borrow().key.clone()
    }

    pub fn serial(&self) -> Option<i64> {
        self.info_rx.borrow().serial
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.info_rx.borrow().error_reason.clone()
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info_rx.borrow().clone()
    }

    pub fn recovery_key(&self) -> Option<String> {
        self.info_rx.borrow().recovery_key()
    }

    /// State changes committed from now on, one per transition
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.state_tx.subscribe()
    }

    /// Inbound channel-scoped messages
    pub fn channel_messages(&self) -> broadcast::Receiver<ProtocolMessage> {
        self.message_tx.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionInfo> {
        self.info_rx.clone()
    }

    /// Resolve once the connection reaches `state`
    pub async fn wait_for_state(&self, state: ConnectionState) -> std::result::Result<(), ErrorInfo> {
        let mut rx = self.info_rx.clone();
        rx.wait_for(|info| info.state == state)
            .await
            .map(|_| ())
            .map_err(|_| ErrorInfo::closed())
    }

    /// Raw command queue, for transports and tooling
    pub fn command_queue(&self) -> CommandQueue {
        self.queue.clone()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}
