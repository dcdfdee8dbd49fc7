//! Scripted fakes for driving a connection without a network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use realtime_core::auth::{AuthProvider, Token};
use realtime_core::protocol::{Action, ConnectionDetails, ProtocolMessage};
use realtime_core::transport::{
    Reachability, Transport, TransportEventSink, TransportFactory, TransportParams,
};
use realtime_core::{ClientOptions, ConnectionState, ConnectionStateChange, ErrorInfo};

pub const PRIMARY_HOST: &str = "rt.test";

pub fn options() -> ClientOptions {
    ClientOptions::default()
        .with_realtime_host(PRIMARY_HOST)
        .with_fallback_hosts(vec!["fb1.test".into(), "fb2.test".into()])
}

/// What the fake service does when a transport connects
#[derive(Debug, Clone)]
pub enum Reply {
    /// Open and send Connected. Resumes the last connection when the
    /// transport presents its key.
    Accept { max_idle: Duration },
    /// Open and send a connection-level Error
    Reject(ErrorInfo),
    /// Open and send Disconnected
    Disconnect(ErrorInfo),
    /// Fail before opening
    Refuse(ErrorInfo),
    /// Do nothing
    Silent,
}

#[derive(Debug)]
pub struct TransportRecord {
    pub params: TransportParams,
    pub sink: TransportEventSink,
    pub sent: Vec<ProtocolMessage>,
    /// `Some(send_disconnect)` once closed
    pub closed: Option<bool>,
}

#[derive(Default)]
struct NetworkState {
    script: VecDeque<Reply>,
    default_reply: Option<Reply>,
    transports: Vec<TransportRecord>,
    connections: u32,
    last_connection: Option<(String, String)>,
    echo_heartbeats: bool,
    answer_close: bool,
}

/// Fake service plus transport factory. Clones share the same service.
#[derive(Clone)]
pub struct FakeNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeNetwork {
            state: Arc::new(Mutex::new(NetworkState {
                echo_heartbeats: true,
                answer_close: true,
                ..Default::default()
            })),
        })
    }

    /// Queue replies for the next connection attempts
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.state.lock().unwrap().script.extend(replies);
    }

    /// Reply used once the script runs out (defaults to Accept)
    pub fn set_default_reply(&self, reply: Reply) {
        self.state.lock().unwrap().default_reply = Some(reply);
    }

    pub fn set_echo_heartbeats(&self, echo: bool) {
        self.state.lock().unwrap().echo_heartbeats = echo;
    }

    pub fn set_answer_close(&self, answer: bool) {
        self.state.lock().unwrap().answer_close = answer;
    }

    pub fn transport_count(&self) -> usize {
        self.state.lock().unwrap().transports.len()
    }

    pub fn params(&self, index: usize) -> TransportParams {
        self.state.lock().unwrap().transports[index].params.clone()
    }

    pub fn hosts(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.transports.iter().map(|t| t.params.host.clone()).collect()
    }

    pub fn sent(&self, index: usize) -> Vec<ProtocolMessage> {
        self.state.lock().unwrap().transports[index].sent.clone()
    }

    pub fn sent_actions(&self, index: usize) -> Vec<Action> {
        self.sent(index).iter().map(|m| m.action).collect()
    }

    pub fn closed(&self, index: usize) -> Option<bool> {
        self.state.lock().unwrap().transports[index].closed
    }

    pub fn sink(&self, index: usize) -> TransportEventSink {
        self.state.lock().unwrap().transports[index].sink.clone()
    }

    pub fn last_sink(&self) -> TransportEventSink {
        let state = self.state.lock().unwrap();
        state.transports.last().expect("no transport created").sink.clone()
    }

    /// Deliver a message on the newest transport
    pub fn deliver(&self, message: ProtocolMessage) {
        self.last_sink().message_received(message);
    }

    pub fn ack(&self, msg_serial: u64, count: u32) {
        self.deliver(ProtocolMessage {
            msg_serial: Some(msg_serial),
            count: Some(count),
            ..ProtocolMessage::new(Action::Ack)
        });
    }

    pub fn nack(&self, msg_serial: u64, count: u32, error: ErrorInfo) {
        self.deliver(ProtocolMessage {
            msg_serial: Some(msg_serial),
            count: Some(count),
            error: Some(error),
            ..ProtocolMessage::new(Action::Nack)
        });
    }

    fn next_reply(&self) -> Reply {
        let mut state = self.state.lock().unwrap();
        match state.script.pop_front() {
            Some(reply) => reply,
            None => state.default_reply.clone().unwrap_or(Reply::Accept {
                max_idle: Duration::ZERO,
            }),
        }
    }

    fn on_connect(&self, index: usize) {
        let reply = self.next_reply();
        let (sink, params) = {
            let state = self.state.lock().unwrap();
            let record = &state.transports[index];
            (record.sink.clone(), record.params.clone())
        };

        match reply {
            Reply::Accept { max_idle } => {
                let message = self.connected_message(&params, max_idle);
                sink.connected();
                sink.message_received(message);
            }
            Reply::Reject(error) => {
                sink.connected();
                sink.message_received(ProtocolMessage::new(Action::Error).with_error(error));
            }
            Reply::Disconnect(error) => {
                sink.connected();
                sink.message_received(ProtocolMessage::new(Action::Disconnected).with_error(error));
            }
            Reply::Refuse(error) => sink.error(error),
            Reply::Silent => {}
        }
    }

    fn connected_message(&self, params: &TransportParams, max_idle: Duration) -> ProtocolMessage {
        let mut state = self.state.lock().unwrap();
        let resumed = match (&state.last_connection, &params.connection_key) {
            (Some((id, key)), Some(presented)) if key == presented => Some(id.clone()),
            _ => None,
        };
        let (id, key) = match resumed {
            Some(id) => {
                let key = params.connection_key.clone().unwrap_or_default();
                (id, key)
            }
            None => {
                state.connections += 1;
                (
                    format!("conn-{}", state.connections),
                    format!("key-{}", state.connections),
                )
            }
        };
        state.last_connection = Some((id.clone(), key.clone()));

        ProtocolMessage {
            connection_id: Some(id),
            connection_key: Some(key.clone()),
            connection_details: Some(ConnectionDetails {
                connection_key: Some(key),
                max_idle_interval: max_idle.as_millis() as u64,
                ..Default::default()
            }),
            ..ProtocolMessage::new(Action::Connected)
        }
    }

    fn on_send(&self, index: usize, message: &ProtocolMessage) {
        let (sink, echo, answer_close) = {
            let mut state = self.state.lock().unwrap();
            state.transports[index].sent.push(message.clone());
            (
                state.transports[index].sink.clone(),
                state.echo_heartbeats,
                state.answer_close,
            )
        };

        match message.action {
            Action::Heartbeat if echo => sink.message_received(ProtocolMessage {
                id: message.id.clone(),
                ..ProtocolMessage::new(Action::Heartbeat)
            }),
            Action::Close if answer_close => {
                sink.message_received(ProtocolMessage::new(Action::Closed))
            }
            _ => {}
        }
    }

    fn on_close(&self, index: usize, send_disconnect: bool) {
        self.state.lock().unwrap().transports[index].closed = Some(send_disconnect);
    }
}

impl TransportFactory for FakeNetwork {
    fn create(
        &self,
        params: TransportParams,
        events: TransportEventSink,
    ) -> Result<Box<dyn Transport>, ErrorInfo> {
        let mut state = self.state.lock().unwrap();
        state.transports.push(TransportRecord {
            params,
            sink: events,
            sent: Vec::new(),
            closed: None,
        });
        let index = state.transports.len() - 1;
        drop(state);

        Ok(Box::new(FakeTransport {
            index,
            network: self.clone(),
        }))
    }
}

struct FakeTransport {
    index: usize,
    network: FakeNetwork,
}

impl Transport for FakeTransport {
    fn connect(&mut self) {
        self.network.on_connect(self.index);
    }

    fn send(&mut self, message: &ProtocolMessage) -> Result<(), ErrorInfo> {
        self.network.on_send(self.index, message);
        Ok(())
    }

    fn close(&mut self, send_disconnect: bool) {
        self.network.on_close(self.index, send_disconnect);
    }
}

/// Token provider counting renewals
pub struct FakeAuth {
    renewable: bool,
    renewals: Mutex<u32>,
    renew_error: Mutex<Option<ErrorInfo>>,
}

impl FakeAuth {
    pub fn new(renewable: bool) -> Arc<Self> {
        Arc::new(FakeAuth {
            renewable,
            renewals: Mutex::new(0),
            renew_error: Mutex::new(None),
        })
    }

    pub fn renewals(&self) -> u32 {
        *self.renewals.lock().unwrap()
    }

    pub fn fail_renewal(&self, error: ErrorInfo) {
        *self.renew_error.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl AuthProvider for FakeAuth {
    async fn current_token(&self) -> Result<Option<Token>, ErrorInfo> {
        let renewals = self.renewals();
        Ok(Some(Token::new(format!("token-{}", renewals))))
    }

    async fn renew_token(&self) -> Result<Option<Token>, ErrorInfo> {
        if let Some(error) = self.renew_error.lock().unwrap().clone() {
            return Err(error);
        }
        let mut renewals = self.renewals.lock().unwrap();
        *renewals += 1;
        Ok(Some(Token::new(format!("token-{}", *renewals))))
    }

    fn is_token_renewable(&self) -> bool {
        self.renewable
    }
}

pub struct FixedReachability(pub bool);

#[async_trait]
impl Reachability for FixedReachability {
    async fn can_reach_service(&self) -> bool {
        self.0
    }
}

/// Receive state changes until `state` is reached, returning everything seen
pub async fn changes_until(
    rx: &mut broadcast::Receiver<ConnectionStateChange>,
    state: ConnectionState,
) -> Vec<ConnectionStateChange> {
    let mut seen = Vec::new();
    loop {
        let change = tokio::time::timeout(Duration::from_secs(3600), rx.recv())
            .await
            .expect("timed out waiting for state change")
            .expect("state change stream closed");
        let done = change.current == state;
        seen.push(change);
        if done {
            return seen;
        }
    }
}

pub fn states(changes: &[ConnectionStateChange]) -> Vec<ConnectionState> {
    changes.iter().map(|c| c.current).collect()
}

/// Let the workflow loop drain its queue
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
