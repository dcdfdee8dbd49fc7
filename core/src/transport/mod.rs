//! Transport Module
//!
//! The narrow interface through which the connection core drives a
//! WebSocket-like transport, plus fallback host selection.

pub mod hosts;

use std::fmt;
use std::sync::Arc;

use crate::auth::Token;
use crate::connection::command::RealtimeCommand;
use crate::connection::workflow::CommandQueue;
use crate::error::ErrorInfo;
use crate::protocol::ProtocolMessage;

pub use hosts::FallbackHosts;

/// Protocol version announced on connect
pub const PROTOCOL_VERSION: &str = "1.2";

/// Events emitted by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Underlying socket opened
    Connected,
    /// Socket closed, with the reason when abnormal
    Disconnected { error: Option<ErrorInfo> },
    /// Socket-level failure
    Error(ErrorInfo),
    /// Decoded inbound protocol message
    MessageReceived(ProtocolMessage),
}

/// Everything a transport needs to open a connection
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParams {
    pub host: String,
    pub token: Option<Token>,
    /// Key of the connection to resume
    pub connection_key: Option<String>,
    pub connection_serial: Option<i64>,
    pub recover: Option<String>,
    pub client_id: Option<String>,
    pub echo_messages: bool,
}

impl TransportParams {
    /// Query parameters for the connect request
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("v", PROTOCOL_VERSION.to_string()), ("format", "json".to_string())];
        if !self.echo_messages {
            params.push(("echo", "false".to_string()));
        }
        if let Some(key) = &self.connection_key {
            params.push(("resume", key.clone()));
            if let Some(serial) = self.connection_serial {
                params.push(("connectionSerial", serial.to_string()));
            }
        } else if let Some(recover) = &self.recover {
            // recovery key format: key:serial:msgSerial
            let mut parts = recover.split(':');
            if let (Some(key), Some(serial)) = (parts.next(), parts.next()) {
                params.push(("recover", key.to_string()));
                params.push(("connectionSerial", serial.to_string()));
            }
        }
        if let Some(client_id) = &self.client_id {
            params.push(("clientId", client_id.clone()));
        }
        if let Some(token) = &self.token {
            params.push(("accessToken", token.token.clone()));
        }
        params
    }

    /// WebSocket URL for these parameters
    pub fn url(&self) -> String {
        let query = self
            .query_params()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        format!("wss://{}/?{}", self.host, query)
    }
}

/// A single transport instance. Implementations must not block: results of
/// `connect` and `close` arrive later through the event sink.
pub trait Transport: Send {
    fn connect(&mut self);

    fn send(&mut self, message: &ProtocolMessage) -> Result<(), ErrorInfo>;

    /// Close the socket, optionally sending a `Disconnect` first
    fn close(&mut self, send_disconnect: bool);
}

pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        params: TransportParams,
        events: TransportEventSink,
    ) -> Result<Box<dyn Transport>, ErrorInfo>;
}

/// Network reachability check consulted before falling back
#[async_trait::async_trait]
pub trait Reachability: Send + Sync {
    async fn can_reach_service(&self) -> bool;
}

/// Assumes the network is always reachable
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReachable;

#[async_trait::async_trait]
impl Reachability for AlwaysReachable {
    async fn can_reach_service(&self) -> bool {
        true
    }
}

pub type ArcTransportFactory = Arc<dyn TransportFactory>;
pub type ArcReachability = Arc<dyn Reachability>;

/// Delivers transport events into the workflow loop.
///
/// Each sink is tagged with the id of the transport it was created for so
/// that events from a replaced transport are recognised and dropped.
#[derive(Clone)]
pub struct TransportEventSink {
    transport_id: u64,
    queue: CommandQueue,
}

impl TransportEventSink {
    pub(crate) fn new(transport_id: u64, queue: CommandQueue) -> Self {
        TransportEventSink {
            transport_id,
            queue,
        }
    }

    pub fn transport_id(&self) -> u64 {
        self.transport_id
    }

    /// Safe to call from any thread
    pub fn emit(&self, event: TransportEvent) {
        self.queue.push(RealtimeCommand::HandleTransportEvent {
            transport_id: self.transport_id,
            event,
        });
    }

    pub fn connected(&self) {
        self.emit(TransportEvent::Connected);
    }

    pub fn disconnected(&self, error: Option<ErrorInfo>) {
        self.emit(TransportEvent::Disconnected { error });
    }

    pub fn error(&self, error: ErrorInfo) {
        self.emit(TransportEvent::Error(error));
    }

    pub fn message_received(&self, message: ProtocolMessage) {
        self.emit(TransportEvent::MessageReceived(message));
    }
}

impl fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEventSink")
            .field("transport_id", &self.transport_id)
            .finish()
    }
}
