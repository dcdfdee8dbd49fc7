//! Heartbeat Module
//!
//! Ping bookkeeping: each ping sends a Heartbeat carrying a random id and
//! waits for the service to echo it back before its own timeout elapses.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ErrorInfo;
use crate::protocol::{Action, ProtocolMessage};
use crate::timer::CountdownTimer;

/// Completion callback for a ping, with the measured round trip
pub type PingCallback = Box<dyn FnOnce(Result<Duration, ErrorInfo>) + Send + 'static>;

const PING_ID_LEN: usize = 12;

struct PendingPing {
    sent_at: Instant,
    callback: PingCallback,
    timer: Box<dyn CountdownTimer>,
}

/// Pings awaiting their heartbeat echo
#[derive(Default)]
pub struct PingTracker {
    pending: HashMap<String, PendingPing>,
}

impl PingTracker {
    pub fn new() -> Self {
        PingTracker {
            pending: HashMap::new(),
        }
    }

    pub fn new_ping_id() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PING_ID_LEN)
            .map(char::from)
            .collect()
    }

    /// Heartbeat message carrying `ping_id`
    pub fn heartbeat(ping_id: &str) -> ProtocolMessage {
        ProtocolMessage {
            id: Some(ping_id.to_string()),
            ..ProtocolMessage::new(Action::Heartbeat)
        }
    }

    /// Track a ping whose timeout `timer` is already armed
    pub fn register(&mut self, ping_id: String, callback: PingCallback, timer: Box<dyn CountdownTimer>) {
        self.pending.insert(
            ping_id,
            PendingPing {
                sent_at: Instant::now(),
                callback,
                timer,
            },
        );
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Resolve pings answered by `message`. A heartbeat without an id
    /// answers every outstanding ping.
    pub fn on_heartbeat(&mut self, message: &ProtocolMessage) -> usize {
        let ids: Vec<String> = match &message.id {
            Some(id) if self.pending.contains_key(id) => vec![id.clone()],
            Some(id) => {
                tracing::trace!("Heartbeat {} matches no pending ping", id);
                Vec::new()
            }
            None => self.pending.keys().cloned().collect(),
        };

        for id in &ids {
            if let Some(mut ping) = self.pending.remove(id) {
                ping.timer.abort();
                let elapsed = ping.sent_at.elapsed();
                tracing::debug!("Ping {} answered in {:?}", id, elapsed);
                (ping.callback)(Ok(elapsed));
            }
        }
        ids.len()
    }

    /// Fail a ping whose timer elapsed. Unknown ids were already answered.
    pub fn on_timeout(&mut self, ping_id: &str) {
        if let Some(ping) = self.pending.remove(ping_id) {
            tracing::warn!("Ping {} timed out", ping_id);
            (ping.callback)(Err(ErrorInfo::ping_timeout()));
        }
    }

    pub fn fail_all(&mut self, error: &ErrorInfo) {
        for (_, mut ping) in self.pending.drain() {
            ping.timer.abort();
            (ping.callback)(Err(error.clone()));
        }
    }
}
